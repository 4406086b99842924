//! Incremental parsing of streamed debate records.
//!
//! Chunks are appended to a buffer and every complete `{...}` span is
//! pulled out as soon as it closes. Incomplete tails wait for the next
//! chunk. Anything that can never become a record is skipped one opener at
//! a time, so a single bad fragment cannot block the records behind it.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;

use crate::chorus::{Agent, DebateRecord};
use crate::error::Result;
use crate::gateway::TextStream;
use crate::json_scan::{scan_span, Scan};

/// An unterminated span longer than this is treated as garbage
const MAX_PENDING_BYTES: usize = 16 * 1024;

#[derive(Deserialize)]
struct WireRecord {
    agent: String,
    content: String,
}

#[derive(Default)]
pub struct RecordBuffer {
    pending: String,
    seen: HashSet<(Agent, String)>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every record it completed, in stream order.
    pub fn push(&mut self, chunk: &str) -> Vec<DebateRecord> {
        self.pending.push_str(chunk);
        self.drain(false)
    }

    /// End of stream: rescan whatever is left, giving up on unclosed spans.
    pub fn finish(&mut self) -> Vec<DebateRecord> {
        let records = self.drain(true);
        self.pending.clear();
        records
    }

    fn drain(&mut self, at_end: bool) -> Vec<DebateRecord> {
        let mut records = Vec::new();
        loop {
            let Some(start) = self.pending.find('{') else {
                self.pending.clear();
                break;
            };

            match scan_span(&self.pending, start) {
                Scan::Complete(end) => {
                    let span = self.pending[start..end].to_string();
                    self.pending.drain(..end);
                    if let Some(record) = self.accept(&span) {
                        records.push(record);
                    }
                }
                Scan::Malformed => {
                    self.pending.drain(..=start);
                }
                Scan::Incomplete => {
                    if at_end
                        || self.pending.len() - start > MAX_PENDING_BYTES
                        || self.closed_record_after(start)
                    {
                        self.pending.drain(..=start);
                        continue;
                    }
                    self.pending.drain(..start);
                    break;
                }
            }
        }
        records
    }

    /// Records are one per line, so a later line opening with a span that
    /// already closed means the opener at `start` is a stray.
    fn closed_record_after(&self, start: usize) -> bool {
        self.pending[start..]
            .match_indices('\n')
            .map(|(i, _)| start + i + 1)
            .any(|line| {
                let rest = &self.pending[line..];
                let indent = rest.len() - rest.trim_start_matches(|c: char| c == ' ' || c == '\t').len();
                let opener = line + indent;
                self.pending[opener..].starts_with('{')
                    && matches!(scan_span(&self.pending, opener), Scan::Complete(_))
            })
    }

    fn accept(&mut self, span: &str) -> Option<DebateRecord> {
        let wire: WireRecord = serde_json::from_str(span).ok()?;
        let agent = match Agent::from_str(&wire.agent) {
            Some(agent) => agent,
            None => {
                tracing::debug!(agent = %wire.agent, "Dropping record from unknown agent");
                return None;
            }
        };
        let content = wire.content.trim().to_string();
        if content.is_empty() || !self.seen.insert((agent, content.clone())) {
            return None;
        }
        Some(DebateRecord { agent, content })
    }
}

/// Turn a raw text stream into debate records. A provider error is yielded
/// once and ends the stream.
pub fn debate_records(mut chunks: TextStream) -> impl Stream<Item = Result<DebateRecord>> + Send + 'static {
    async_stream::stream! {
        let mut buffer = RecordBuffer::new();
        let mut failed = false;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => {
                    for record in buffer.push(&text) {
                        yield Ok(record);
                    }
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }

        if !failed {
            for record in buffer.finish() {
                yield Ok(record);
            }
        }
    }
}
