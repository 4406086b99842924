//! Calibration Engine: one conversational turn that may refine the tensor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::generation::ChatTurn;
use crate::logging;
use crate::prompts;
use crate::tensor::{self, TensorStore};

pub const FALLBACK_REPLY: &str = "I see. Could you tell me more about that?";

#[derive(Debug, Deserialize)]
struct CalibrationReply {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    updates: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationOutcome {
    pub reply: String,
    pub tensor_updated: bool,
}

impl CalibrationOutcome {
    fn fallback() -> Self {
        Self {
            reply: FALLBACK_REPLY.to_string(),
            tensor_updated: false,
        }
    }
}

#[derive(Clone)]
pub struct CalibrationEngine {
    gateway: Gateway,
    tensors: TensorStore,
}

impl CalibrationEngine {
    pub fn new(gateway: Gateway, tensors: TensorStore) -> Self {
        Self { gateway, tensors }
    }

    /// Unparseable model output degrades to [`FALLBACK_REPLY`] with no
    /// mutation. An unreachable provider or store still fails the turn.
    pub async fn calibrate(
        &self,
        user_id: &str,
        message: &str,
        history: &[ChatTurn],
    ) -> Result<CalibrationOutcome> {
        if message.trim().is_empty() {
            return Err(Error::Validation("Message is required".into()));
        }
        let tensor = self.tensors.get(user_id).await?;

        let prompt = prompts::calibration_turn(&tensor, message, history);
        let parsed: CalibrationReply = match self.gateway.generate_json(&prompt).await {
            Ok(parsed) => parsed,
            Err(Error::GenerationParse(detail)) => {
                tracing::warn!(user = user_id, %detail, "Calibration reply unparseable, using fallback");
                return Ok(CalibrationOutcome::fallback());
            }
            Err(e) => return Err(e),
        };

        let sections = match &parsed.updates {
            Some(Value::Object(map)) => tensor::known_sections(map),
            _ => Map::new(),
        };
        let tensor_updated = if sections.is_empty() {
            false
        } else {
            match self.tensors.merge(user_id, &Value::Object(sections)).await {
                Ok(_) => true,
                Err(Error::Validation(detail)) => {
                    tracing::warn!(user = user_id, %detail, "Ignoring malformed calibration update");
                    false
                }
                Err(e) => return Err(e),
            }
        };

        let reply = parsed.reply.trim();
        let reply = if reply.is_empty() { FALLBACK_REPLY } else { reply };
        logging::log_calibration(
            Some(user_id),
            &format!("Turn complete (tensor updated: {})", tensor_updated),
        );
        Ok(CalibrationOutcome {
            reply: reply.to_string(),
            tensor_updated,
        })
    }
}
