//! Chorus: debate, structure, parallel beat generation and weave
//!
//! Stages run strictly in sequence. Stage three fans out one call per beat
//! and restores beat order by index before anything downstream sees it.

use futures::stream::{FuturesUnordered, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::debate;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::logging;
use crate::prompts;
use crate::tensor::UserTensor;

pub const BEAT_COUNT: usize = 4;

// ============ Agents ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Agent {
    Architect,
    Poet,
    Critic,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Architect => "Architect",
            Agent::Poet => "Poet",
            Agent::Critic => "Critic",
        }
    }

    /// Accepts any case and a leading "The ", as models like to write "THE POET".
    pub fn from_str(s: &str) -> Option<Agent> {
        let lowered = s.trim().to_lowercase();
        let name = lowered.strip_prefix("the ").unwrap_or(&lowered).trim();
        match name {
            "architect" => Some(Agent::Architect),
            "poet" => Some(Agent::Poet),
            "critic" => Some(Agent::Critic),
            _ => None,
        }
    }
}

impl TryFrom<String> for Agent {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Agent::from_str(&value).ok_or_else(|| format!("unknown agent: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateRecord {
    pub agent: Agent,
    pub content: String,
}

// ============ Structure ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeatType {
    Opening,
    #[serde(rename = "Rising Action")]
    RisingAction,
    Climax,
    Resolution,
}

impl BeatType {
    pub const ALL: [BeatType; BEAT_COUNT] = [
        BeatType::Opening,
        BeatType::RisingAction,
        BeatType::Climax,
        BeatType::Resolution,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BeatType::Opening => "Opening",
            BeatType::RisingAction => "Rising Action",
            BeatType::Climax => "Climax",
            BeatType::Resolution => "Resolution",
        }
    }

    pub fn from_label(s: &str) -> Option<BeatType> {
        let squashed: String = s
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_lowercase();
        match squashed.as_str() {
            "opening" => Some(BeatType::Opening),
            "risingaction" => Some(BeatType::RisingAction),
            "climax" => Some(BeatType::Climax),
            "resolution" => Some(BeatType::Resolution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Beat {
    #[serde(rename = "type")]
    pub beat_type: BeatType,
    pub instruction: String,
}

/// A beat as received from a model or a client, before the cardinality check.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBeat {
    #[serde(rename = "type", default)]
    pub label: String,
    #[serde(default)]
    pub instruction: String,
}

#[derive(Debug, Deserialize)]
struct RawStructure {
    #[serde(default)]
    title: String,
    beats: Vec<RawBeat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryStructure {
    pub title: String,
    pub beats: [Beat; BEAT_COUNT],
}

impl StoryStructure {
    /// Exactly four beats, relabelled positionally to the canonical order.
    fn assemble(title: String, beats: Vec<RawBeat>) -> std::result::Result<Self, String> {
        let count = beats.len();
        let beats: [RawBeat; BEAT_COUNT] = beats
            .try_into()
            .map_err(|_| format!("expected {} beats, got {}", BEAT_COUNT, count))?;

        let mut index = 0;
        let beats = beats.map(|raw| {
            let beat_type = BeatType::ALL[index];
            index += 1;
            if BeatType::from_label(&raw.label) != Some(beat_type) {
                tracing::warn!(
                    expected = beat_type.label(),
                    got = %raw.label,
                    "Beat label out of place, relabelling"
                );
            }
            Beat {
                beat_type,
                instruction: raw.instruction.trim().to_string(),
            }
        });

        let title = title.trim();
        Ok(Self {
            title: if title.is_empty() { "Untitled".to_string() } else { title.to_string() },
            beats,
        })
    }

    /// Structure supplied by a caller; a wrong beat count is the caller's fault.
    pub fn from_request(title: String, beats: Vec<RawBeat>) -> Result<Self> {
        Self::assemble(title, beats).map_err(Error::Validation)
    }

    fn from_model(raw: RawStructure) -> Result<Self> {
        Self::assemble(raw.title, raw.beats).map_err(Error::GenerationParse)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub index: usize,
    #[serde(rename = "type")]
    pub beat_type: BeatType,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChorusArtifact {
    pub title: String,
    pub content: String,
    pub structure: StoryStructure,
    pub threads: Vec<Thread>,
}

// ============ Session ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChorusStage {
    Idle,
    Debating,
    Structuring,
    Generating,
    Weaving,
    Complete,
}

impl ChorusStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChorusStage::Idle => "idle",
            ChorusStage::Debating => "debating",
            ChorusStage::Structuring => "structuring",
            ChorusStage::Generating => "generating",
            ChorusStage::Weaving => "weaving",
            ChorusStage::Complete => "complete",
        }
    }

    fn can_advance_to(&self, next: ChorusStage) -> bool {
        use ChorusStage::*;
        matches!(
            (self, next),
            (Idle, Debating)
                | (Debating, Idle)
                | (Idle, Structuring)
                | (Complete, Structuring)
                | (Structuring, Generating)
                | (Generating, Weaving)
                | (Weaving, Complete)
        )
    }
}

/// Tracks one run through the pipeline. Failure always lands back on idle.
#[derive(Debug, Clone)]
pub struct ChorusSession {
    stage: ChorusStage,
    trail: Vec<ChorusStage>,
}

impl Default for ChorusSession {
    fn default() -> Self {
        Self {
            stage: ChorusStage::Idle,
            trail: vec![ChorusStage::Idle],
        }
    }
}

impl ChorusSession {
    pub fn stage(&self) -> ChorusStage {
        self.stage
    }

    /// Every stage visited so far, starting with idle.
    pub fn trail(&self) -> &[ChorusStage] {
        &self.trail
    }

    pub fn advance(&mut self, next: ChorusStage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(Error::Validation(format!(
                "chorus cannot move from {} to {}",
                self.stage.as_str(),
                next.as_str()
            )));
        }
        self.enter(next);
        Ok(())
    }

    pub fn fail(&mut self) {
        self.enter(ChorusStage::Idle);
    }

    fn enter(&mut self, stage: ChorusStage) {
        self.stage = stage;
        self.trail.push(stage);
    }
}

// ============ Orchestrator ============

#[derive(Clone)]
pub struct ChorusOrchestrator {
    gateway: Gateway,
}

impl ChorusOrchestrator {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Stage 1. Records are yielded in stream order as soon as each closes.
    pub async fn debate(
        &self,
        tensor: &UserTensor,
        particle: &str,
    ) -> Result<impl Stream<Item = Result<DebateRecord>> + Send + 'static> {
        require_particle(particle)?;
        logging::log_chorus(Some(&tensor.user_id), &format!("Debate on: {}", particle.trim()));
        let chunks = self
            .gateway
            .stream_text(&prompts::chorus_debate(tensor, particle))
            .await?;
        Ok(debate::debate_records(chunks))
    }

    /// Stage 2
    pub async fn structure(
        &self,
        tensor: &UserTensor,
        particle: &str,
        transcript: &[DebateRecord],
    ) -> Result<StoryStructure> {
        require_particle(particle)?;
        let raw: RawStructure = self
            .gateway
            .generate_json(&prompts::chorus_structure(tensor, particle, transcript))
            .await?;
        let structure = StoryStructure::from_model(raw)?;
        logging::log_chorus(
            Some(&tensor.user_id),
            &format!("Structured '{}' from {} debate records", structure.title, transcript.len()),
        );
        Ok(structure)
    }

    /// Stage 3. All four calls are awaited even when one fails.
    pub async fn generate_threads(
        &self,
        tensor: &UserTensor,
        structure: &StoryStructure,
    ) -> Result<Vec<Thread>> {
        let gateway = &self.gateway;
        let mut pending: FuturesUnordered<_> = (0..BEAT_COUNT)
            .map(|index| {
                let prompt = prompts::chorus_beat(tensor, structure, index);
                async move { (index, gateway.generate_text(&prompt).await) }
            })
            .collect();

        let mut finished = Vec::with_capacity(BEAT_COUNT);
        while let Some(done) = pending.next().await {
            finished.push(done);
        }
        finished.sort_by_key(|(index, _)| *index);

        let mut threads = Vec::with_capacity(BEAT_COUNT);
        for (index, result) in finished {
            let content = result?;
            if content.is_empty() {
                return Err(Error::GenerationParse(format!(
                    "section {} came back empty",
                    index + 1
                )));
            }
            threads.push(Thread {
                index,
                beat_type: structure.beats[index].beat_type,
                content,
            });
        }

        logging::log_chorus(
            Some(&tensor.user_id),
            &format!("Generated {} threads for '{}'", threads.len(), structure.title),
        );
        Ok(threads)
    }

    /// Stage 4. Threads may arrive in any order but must cover indices 0..4 once each.
    pub async fn weave(&self, title: &str, mut threads: Vec<Thread>) -> Result<String> {
        threads.sort_by_key(|t| t.index);
        let indices: Vec<usize> = threads.iter().map(|t| t.index).collect();
        if indices != (0..BEAT_COUNT).collect::<Vec<_>>() {
            return Err(Error::Validation(format!(
                "weave needs threads 0 to {} exactly once, got {:?}",
                BEAT_COUNT - 1,
                indices
            )));
        }

        let story = self
            .gateway
            .generate_text(&prompts::chorus_weave(title, &threads))
            .await?;
        if story.is_empty() {
            return Err(Error::GenerationParse("weave came back empty".into()));
        }
        logging::log_chorus(None, &format!("Woven '{}' ({} chars)", title, story.chars().count()));
        Ok(story)
    }

    /// Stages 2 to 4 in one call, tracked by `session`.
    pub async fn compose(
        &self,
        session: &mut ChorusSession,
        tensor: &UserTensor,
        particle: &str,
        transcript: &[DebateRecord],
    ) -> Result<ChorusArtifact> {
        match self.run_pipeline(session, tensor, particle, transcript).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                logging::log_error(
                    Some(&tensor.user_id),
                    &format!("Chorus failed while {}: {}", session.stage().as_str(), e),
                );
                session.fail();
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        session: &mut ChorusSession,
        tensor: &UserTensor,
        particle: &str,
        transcript: &[DebateRecord],
    ) -> Result<ChorusArtifact> {
        session.advance(ChorusStage::Structuring)?;
        let structure = self.structure(tensor, particle, transcript).await?;

        session.advance(ChorusStage::Generating)?;
        let threads = self.generate_threads(tensor, &structure).await?;

        session.advance(ChorusStage::Weaving)?;
        let content = self.weave(&structure.title, threads.clone()).await?;

        session.advance(ChorusStage::Complete)?;
        Ok(ChorusArtifact {
            title: structure.title.clone(),
            content,
            structure,
            threads,
        })
    }
}

fn require_particle(particle: &str) -> Result<()> {
    if particle.trim().is_empty() {
        return Err(Error::Validation("Particle is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModel;
    use std::time::Duration;

    const STRUCTURE_REPLY: &str = r#"```json
{
  "title": "The Map to Nowhere",
  "beats": [
    {"type": "Opening", "instruction": "Open on the map"},
    {"type": "Rising Action", "instruction": "The roads vanish"},
    {"type": "Climax", "instruction": "She burns the map"},
    {"type": "Resolution", "instruction": "Ash becomes a road"}
  ]
}
```"#;

    fn section(prompt: &str) -> Option<usize> {
        (1..=BEAT_COUNT).find(|n| prompt.contains(&format!("Write strictly SECTION {}:", n)))
    }

    /// Beats answer in reverse order: section 1 is slowest.
    fn chorus_model() -> MockModel {
        MockModel::replying(|prompt| {
            if prompt.contains("strict 4-beat structure") {
                return Ok(STRUCTURE_REPLY.to_string());
            }
            if let Some(n) = section(prompt) {
                return Ok(format!("[BEAT-{}]", n - 1));
            }
            if prompt.contains("You are the weaver") {
                let start = prompt.find("DRAFT CONTENT:").unwrap_or(0);
                let end = prompt.find("TASK:").unwrap_or(prompt.len());
                return Ok(format!("WOVEN {}", prompt[start..end].replace('\n', " ")));
            }
            Err(Error::GenerationParse("unexpected prompt".into()))
        })
        .with_delay(|prompt| match section(prompt) {
            Some(n) => Duration::from_millis((BEAT_COUNT + 1 - n) as u64 * 15),
            None => Duration::ZERO,
        })
    }

    fn structure() -> StoryStructure {
        StoryStructure {
            title: "T".into(),
            beats: BeatType::ALL.map(|beat_type| Beat {
                beat_type,
                instruction: beat_type.label().to_string(),
            }),
        }
    }

    #[test]
    fn test_agent_from_str_variants() {
        assert_eq!(Agent::from_str("THE POET"), Some(Agent::Poet));
        assert_eq!(Agent::from_str(" architect "), Some(Agent::Architect));
        assert_eq!(Agent::from_str("Weaver"), None);
        let record: DebateRecord =
            serde_json::from_str(r#"{"agent":"The Critic","content":"Cliché."}"#).unwrap();
        assert_eq!(record.agent, Agent::Critic);
    }

    #[test]
    fn test_beat_labels_serialize_canonically() {
        let json = serde_json::to_value(&structure()).unwrap();
        assert_eq!(json["beats"][1]["type"], "Rising Action");
        assert_eq!(BeatType::from_label("rising_action"), Some(BeatType::RisingAction));
    }

    #[test]
    fn test_structure_requires_four_beats() {
        let three = vec![RawBeat::default(); 3];
        assert!(matches!(
            StoryStructure::from_request("T".into(), three),
            Err(Error::Validation(_))
        ));

        let relabelled = StoryStructure::from_request(
            "  ".into(),
            vec![
                RawBeat { label: "Climax".into(), instruction: "a".into() },
                RawBeat { label: "Opening".into(), instruction: "b".into() },
                RawBeat::default(),
                RawBeat::default(),
            ],
        )
        .unwrap();
        assert_eq!(relabelled.title, "Untitled");
        assert_eq!(relabelled.beats[0].beat_type, BeatType::Opening);
        assert_eq!(relabelled.beats[0].instruction, "a");
    }

    #[tokio::test]
    async fn test_model_structure_with_five_beats_is_parse_error() {
        let (gateway, _) = MockModel::replying(|_| {
            Ok(r#"{"title":"T","beats":[{},{},{},{},{}]}"#.into())
        })
        .build();
        let chorus = ChorusOrchestrator::new(gateway);
        let err = chorus
            .structure(&UserTensor::default_for("u"), "particle", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationParse(_)));
    }

    #[tokio::test]
    async fn test_threads_sorted_despite_reverse_completion() {
        let (gateway, _) = chorus_model().build();
        let chorus = ChorusOrchestrator::new(gateway);
        let threads = chorus
            .generate_threads(&UserTensor::default_for("u"), &structure())
            .await
            .unwrap();

        let contents: Vec<&str> = threads.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["[BEAT-0]", "[BEAT-1]", "[BEAT-2]", "[BEAT-3]"]);
        let types: Vec<BeatType> = threads.iter().map(|t| t.beat_type).collect();
        assert_eq!(types, BeatType::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_one_failed_beat_fails_the_stage() {
        let (gateway, model) = MockModel::replying(|prompt| match section(prompt) {
            Some(3) => Err(Error::GenerationUnavailable("timeout".into())),
            _ => Ok("prose".into()),
        })
        .build();
        let chorus = ChorusOrchestrator::new(gateway);
        let err = chorus
            .generate_threads(&UserTensor::default_for("u"), &structure())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GenerationUnavailable(_)));
        assert_eq!(model.prompts().len(), BEAT_COUNT);
    }

    #[tokio::test]
    async fn test_weave_orders_shuffled_threads() {
        let (gateway, model) = chorus_model().build();
        let chorus = ChorusOrchestrator::new(gateway);
        let shuffled: Vec<Thread> = [2, 0, 3, 1]
            .iter()
            .map(|&index| Thread {
                index,
                beat_type: BeatType::ALL[index],
                content: format!("[BEAT-{}]", index),
            })
            .collect();
        chorus.weave("T", shuffled).await.unwrap();

        let prompt = model.prompts().pop().unwrap();
        let positions: Vec<usize> = (0..BEAT_COUNT)
            .map(|i| prompt.find(&format!("[BEAT-{}]", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_weave_rejects_missing_thread() {
        let (gateway, model) = chorus_model().build();
        let chorus = ChorusOrchestrator::new(gateway);
        let threads = vec![Thread {
            index: 0,
            beat_type: BeatType::Opening,
            content: "x".into(),
        }];
        assert!(matches!(chorus.weave("T", threads).await, Err(Error::Validation(_))));
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_compose_map_to_nowhere() {
        let (gateway, _) = chorus_model().build();
        let chorus = ChorusOrchestrator::new(gateway);
        let mut session = ChorusSession::default();
        let artifact = chorus
            .compose(
                &mut session,
                &UserTensor::default_for("u"),
                "A story about a map to nowhere",
                &[],
            )
            .await
            .unwrap();

        assert_eq!(artifact.title, "The Map to Nowhere");
        let labels: Vec<&str> = artifact.structure.beats.iter().map(|b| b.beat_type.label()).collect();
        assert_eq!(labels, vec!["Opening", "Rising Action", "Climax", "Resolution"]);
        let indices: Vec<usize> = artifact.threads.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let woven = &artifact.content;
        let positions: Vec<usize> = (0..BEAT_COUNT)
            .map(|i| woven.find(&format!("[BEAT-{}]", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(session.stage(), ChorusStage::Complete);
        assert_eq!(
            session.trail(),
            &[
                ChorusStage::Idle,
                ChorusStage::Structuring,
                ChorusStage::Generating,
                ChorusStage::Weaving,
                ChorusStage::Complete
            ]
        );
    }

    #[tokio::test]
    async fn test_compose_failure_returns_to_idle() {
        let (gateway, _) = MockModel::replying(|prompt| {
            if prompt.contains("strict 4-beat structure") {
                Ok(STRUCTURE_REPLY.to_string())
            } else {
                Err(Error::GenerationUnavailable("down".into()))
            }
        })
        .build();
        let chorus = ChorusOrchestrator::new(gateway);
        let mut session = ChorusSession::default();
        let result = chorus
            .compose(&mut session, &UserTensor::default_for("u"), "particle", &[])
            .await;
        assert!(result.is_err());
        assert_eq!(session.stage(), ChorusStage::Idle);
        assert_eq!(session.trail().last(), Some(&ChorusStage::Idle));
        assert!(session.trail().contains(&ChorusStage::Generating));
        assert!(!session.trail().contains(&ChorusStage::Weaving));
    }

    #[test]
    fn test_session_rejects_skipping_stages() {
        let mut session = ChorusSession::default();
        assert!(session.advance(ChorusStage::Weaving).is_err());
        session.advance(ChorusStage::Debating).unwrap();
        assert!(session.advance(ChorusStage::Structuring).is_err());
        session.advance(ChorusStage::Idle).unwrap();
        session.advance(ChorusStage::Structuring).unwrap();
    }

    #[tokio::test]
    async fn test_debate_requires_particle() {
        let (gateway, model) = MockModel::replying(|_| Ok(String::new())).build();
        let chorus = ChorusOrchestrator::new(gateway);
        assert!(matches!(
            chorus.debate(&UserTensor::default_for("u"), " ").await.err(),
            Some(Error::Validation(_))
        ));
        assert!(model.prompts().is_empty());
    }
}
