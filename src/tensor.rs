//! User tensor: the per-user creative profile and its store
//!
//! The store owns three operations:
//! - `get`: read, synthesizing and persisting a default on first access
//! - `merge`: shallow top-level merge of a partial document
//! - `replace`: full-document upsert

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::logging;

// ============ Data Model ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserTensor {
    pub user_id: String,
    pub timestamp: String,
    pub cultural_coordinates: CulturalCoordinates,
    pub intellectual_frameworks: IntellectualFrameworks,
    pub creative_voice: CreativeVoice,
    pub emotional_landscape: EmotionalLandscape,
    pub contextual_signals: ContextualSignals,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CulturalCoordinates {
    pub heritage: Vec<HeritageEntry>,
    pub linguistics: Linguistics,
    pub faith_framework: FaithFramework,
}

/// One heritage record. Serialized with an explicit `kind` discriminant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeritageEntry {
    Region(WeightedRegion),
    Diaspora(DiasporaContext),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRegion {
    pub region: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub nuance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiasporaContext {
    pub context: String,
    #[serde(default)]
    pub generation: f64,
    #[serde(default)]
    pub anxieties: Vec<String>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedHeritage {
    Region(WeightedRegion),
    Diaspora(DiasporaContext),
}

/// Accepted input shapes: tagged, or an untagged record from an older
/// document or a model reply, recognised by its required key.
#[derive(Deserialize)]
#[serde(untagged)]
enum HeritageInput {
    Tagged(TaggedHeritage),
    Region(WeightedRegion),
    Diaspora(DiasporaContext),
}

impl<'de> Deserialize<'de> for HeritageEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match HeritageInput::deserialize(deserializer)? {
            HeritageInput::Tagged(TaggedHeritage::Region(r)) | HeritageInput::Region(r) => {
                HeritageEntry::Region(r)
            }
            HeritageInput::Tagged(TaggedHeritage::Diaspora(d)) | HeritageInput::Diaspora(d) => {
                HeritageEntry::Diaspora(d)
            }
        })
    }
}

impl HeritageEntry {
    /// Short label used in prompts
    pub fn label(&self) -> String {
        match self {
            HeritageEntry::Region(r) => r.region.clone(),
            HeritageEntry::Diaspora(d) if d.generation > 0.0 => {
                format!("{} (Generation {})", d.context, d.generation)
            }
            HeritageEntry::Diaspora(d) => d.context.clone(),
        }
    }

    /// Place name only, without generation detail
    pub fn place(&self) -> &str {
        match self {
            HeritageEntry::Region(r) => &r.region,
            HeritageEntry::Diaspora(d) => &d.context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Linguistics {
    pub primary: String,
    pub secondary: String,
    pub tertiary: String,
    pub code_switching_patterns: CodeSwitchingPatterns,
}

impl Default for Linguistics {
    fn default() -> Self {
        Self {
            primary: "English".to_string(),
            secondary: String::new(),
            tertiary: String::new(),
            code_switching_patterns: CodeSwitchingPatterns::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSwitchingPatterns {
    pub emotional_transition: String,
    pub intellectual_transition: String,
    /// High | Medium | Low
    pub frequency: String,
}

impl Default for CodeSwitchingPatterns {
    fn default() -> Self {
        Self {
            emotional_transition: String::new(),
            intellectual_transition: String::new(),
            frequency: "Low".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaithFramework {
    pub tradition: String,
    pub practice_level: String,
    pub key_concepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntellectualFrameworks {
    pub disciplines: Vec<String>,
    pub core_concepts: Vec<String>,
    pub fandoms: Vec<Fandom>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fandom {
    pub domain: String,
    pub metaphor_utility: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreativeVoice {
    pub syntax_rhythm: String,
    pub diction: String,
    pub metaphor_density: String,
    pub recurring_motifs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionalLandscape {
    pub current_state: EmotionalState,
    pub processed_themes: Vec<String>,
    pub active_conflicts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionalState {
    pub valence: String,
    pub arousal: String,
    pub dominant_emotion: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextualSignals {
    pub local_time: String,
    pub heart_rate: f64,
    pub device: String,
    pub recent_consumption: Vec<String>,
}

impl Default for UserTensor {
    fn default() -> Self {
        Self::default_for("")
    }
}

impl UserTensor {
    /// Deterministic starting profile for a new user. Descriptors are empty so
    /// prompts fall back to neutral wording until calibration fills them in.
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            cultural_coordinates: CulturalCoordinates::default(),
            intellectual_frameworks: IntellectualFrameworks::default(),
            creative_voice: CreativeVoice::default(),
            emotional_landscape: EmotionalLandscape::default(),
            contextual_signals: ContextualSignals::default(),
        }
    }

    pub fn primary_heritage(&self) -> Option<&HeritageEntry> {
        self.cultural_coordinates.heritage.first()
    }
}

// ============ Merge ============

/// Top-level keys owned by the store rather than by callers
const RESERVED_KEYS: [&str; 2] = ["user_id", "timestamp"];

pub const SECTION_KEYS: [&str; 5] = [
    "cultural_coordinates",
    "intellectual_frameworks",
    "creative_voice",
    "emotional_landscape",
    "contextual_signals",
];

/// The entries of `update` that name a tensor section.
pub fn known_sections(update: &Map<String, Value>) -> Map<String, Value> {
    update
        .iter()
        .filter(|(key, _)| SECTION_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Shallow merge: every top-level key in `update` replaces the current value
/// wholesale. Omitted keys are preserved. Nested objects are not merged.
pub fn merge_shallow(current: &UserTensor, update: &Map<String, Value>) -> Result<UserTensor> {
    let mut document = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(Error::StoreUnavailable("tensor did not serialize to an object".into())),
        Err(e) => return Err(Error::StoreUnavailable(e.to_string())),
    };

    for (key, value) in update {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        document.insert(key.clone(), value.clone());
    }
    document.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));

    let mut merged: UserTensor = serde_json::from_value(Value::Object(document))
        .map_err(|e| Error::Validation(format!("update does not match the tensor shape: {}", e)))?;
    merged.user_id = current.user_id.clone();
    Ok(merged)
}

// ============ Store ============

#[derive(Clone)]
pub struct TensorStore {
    db: Database,
}

impl TensorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch, initializing and persisting a default tensor on first access.
    pub async fn get(&self, user_id: &str) -> Result<UserTensor> {
        require_user(user_id)?;
        if let Some(tensor) = self.db.get_tensor(user_id).await? {
            return Ok(tensor);
        }

        let fresh = UserTensor::default_for(user_id);
        if self.db.insert_tensor_if_absent(&fresh).await? {
            logging::log_tensor(Some(user_id), "Initialized default tensor");
            return Ok(fresh);
        }
        // Lost a race with a concurrent initializer; theirs is authoritative.
        self.db
            .get_tensor(user_id)
            .await?
            .ok_or_else(|| Error::StoreUnavailable("tensor vanished after insert".into()))
    }

    pub async fn merge(&self, user_id: &str, update: &Value) -> Result<UserTensor> {
        require_user(user_id)?;
        let Value::Object(update) = update else {
            return Err(Error::Validation("tensor updates must be a JSON object".into()));
        };

        let current = self.get(user_id).await?;
        let merged = merge_shallow(&current, update)?;
        self.db.upsert_tensor(&merged).await?;

        let keys: Vec<&str> = update
            .keys()
            .map(String::as_str)
            .filter(|k| !RESERVED_KEYS.contains(k))
            .collect();
        logging::log_tensor(Some(user_id), &format!("Merged sections: {}", keys.join(", ")));
        Ok(merged)
    }

    /// Upsert the whole document. Returns true if a prior document was replaced.
    pub async fn replace(&self, mut tensor: UserTensor) -> Result<bool> {
        require_user(&tensor.user_id)?;
        tensor.timestamp = Utc::now().to_rfc3339();
        let replaced = self.db.upsert_tensor(&tensor).await?;
        logging::log_tensor(
            Some(&tensor.user_id),
            if replaced { "Replaced tensor" } else { "Created tensor" },
        );
        Ok(replaced)
    }
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::Validation("User ID is required".into()));
    }
    Ok(())
}
