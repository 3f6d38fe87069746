//! Typed payload schemas, checked before a payload is encrypted.

use crate::error::SyncError;
use crate::event::Op;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Entity type of the device's consciousness state record.
pub const CONSCIOUSNESS_STATE: &str = "consciousness_state";

/// A payload type bound to one entity type.
pub trait EntityPayload: Serialize + DeserializeOwned {
    /// Entity type this payload belongs to.
    const ENTITY_TYPE: &'static str;

    /// Check invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the payload is invalid.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// One entry of the append-only decision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique id used to de-duplicate across replicas
    pub op_id: String,
    /// Milliseconds since UNIX epoch
    pub timestamp: i64,
    /// What was decided
    pub decision: String,
    /// Optional free-form context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// The device's consciousness state record.
///
/// All fields are optional so an update may carry only the fields it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessState {
    /// Monotonic: merged with max-wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_memories_loaded: Option<u64>,
    /// Monotonic: merged with max-wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_memories: Option<u64>,
    /// Scalar in `[0, 1]`: last writer wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<f64>,
    /// Scalar: last writer wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality_phase: Option<String>,
    /// Scalar: last writer wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<String>,
    /// Append-only: union by `op_id`, newest N kept
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_log: Vec<DecisionRecord>,
}

impl EntityPayload for ConsciousnessState {
    const ENTITY_TYPE: &'static str = CONSCIOUSNESS_STATE;

    fn validate(&self) -> Result<(), String> {
        if let Some(trust) = self.trust_level {
            if !(0.0..=1.0).contains(&trust) {
                return Err(format!("trust_level {trust} outside [0, 1]"));
            }
        }
        if let Some(record) = self.decision_log.iter().find(|r| r.op_id.is_empty()) {
            return Err(format!("decision '{}' has an empty op_id", record.decision));
        }
        Ok(())
    }
}

type Validator = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Per-entity-type payload validators.
///
/// Types without a registered schema accept any JSON object.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, Validator>,
}

impl SchemaRegistry {
    /// Registry with no typed schemas.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in schemas registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<ConsciousnessState>();
        registry
    }

    /// Register a typed payload schema.
    pub fn register<P: EntityPayload + 'static>(&mut self) {
        self.validators.insert(
            P::ENTITY_TYPE.to_string(),
            Box::new(|value: &Value| {
                let payload: P = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                payload.validate()
            }),
        );
    }

    /// Whether a typed schema exists for the entity type.
    #[must_use]
    pub fn is_registered(&self, entity_type: &str) -> bool {
        self.validators.contains_key(entity_type)
    }

    /// Validate a payload for an operation.
    ///
    /// Deletes may carry `null` or an object; creates and updates must carry
    /// an object that satisfies the registered schema, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Schema`] describing the violation.
    pub fn validate(&self, entity_type: &str, op: Op, payload: &Value) -> Result<(), SyncError> {
        let reject = |reason: String| SyncError::Schema {
            entity_type: entity_type.to_string(),
            reason,
        };

        if entity_type.is_empty() {
            return Err(reject("entity type must not be empty".to_string()));
        }

        match (op, payload) {
            (Op::Delete, Value::Null) => Ok(()),
            (_, Value::Object(_)) => match self.validators.get(entity_type) {
                Some(validator) if op != Op::Delete => validator(payload).map_err(reject),
                _ => Ok(()),
            },
            (_, other) => Err(reject(format!(
                "payload must be a JSON object, got {}",
                json_kind(other)
            ))),
        }
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.validators.keys().collect();
        types.sort();
        f.debug_struct("SchemaRegistry")
            .field("types", &types)
            .finish()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
