use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::ProcessError;
use crate::schema::Signature;
use crate::value::Value;

/// Integer node identity, unique within a graph. Used for wiring and for
/// keying persisted outputs; the cache key itself is the fingerprint.
pub type NodeId = u64;

/// Resolved, name-keyed inputs handed to a processor's `process` call.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    values: BTreeMap<String, Value>,
}

impl Inputs {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Get a required input or return an error.
    pub fn require(&self, name: &str) -> Result<&Value, ProcessError> {
        self.values
            .get(name)
            .ok_or_else(|| ProcessError::MissingInput(name.to_string()))
    }

    pub fn require_number(&self, name: &str) -> Result<f64, ProcessError> {
        let value = self.require(name)?;
        value.as_f64().ok_or_else(|| ProcessError::InvalidInputType {
            field: name.to_string(),
            expected: "number".to_string(),
            actual: value.kind_name().to_string(),
        })
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ProcessError> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| ProcessError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.kind_name().to_string(),
        })
    }

    pub fn require_bool(&self, name: &str) -> Result<bool, ProcessError> {
        let value = self.require(name)?;
        value.as_bool().ok_or_else(|| ProcessError::InvalidInputType {
            field: name.to_string(),
            expected: "bool".to_string(),
            actual: value.kind_name().to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/// A live node instance created from a [`ProcessorKind`].
///
/// Instances are created lazily by the executor, only when a cache miss
/// makes a `process` call unavoidable, and are dropped again when the graph
/// releases resources.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Acquire heavy state (models, GPU contexts, subprocess servers).
    /// Called once before the first `process` of this instance's life.
    async fn init(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    /// The computation. Must be pure with respect to its declared inputs
    /// and must not partially mutate durable state on failure.
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError>;

    /// Release heavy state. Must be idempotent; safe to call whether or not
    /// `init` ran.
    async fn release(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// Declarative template a node is instantiated from.
///
/// Naming suggestion: name kinds as agent nouns (`SpeakerDiarizer`), name
/// the graph variable holding the returned id as a verb with a `_node`
/// suffix (`diarize_node`).
pub trait ProcessorKind: Send + Sync {
    /// Stable kind name; participates in the fingerprint.
    fn name(&self) -> &str;

    /// Bump whenever the computation's meaning changes; participates in the
    /// fingerprint so stale cached outputs stop matching.
    fn version(&self) -> &str {
        "0"
    }

    /// Declared `process` input signature.
    fn signature(&self) -> Signature;

    /// Declared construction-argument schema, validated at `add_node` time.
    fn config_schema(&self) -> Signature {
        Signature::new()
    }

    /// Construct an instance from validated construction arguments. Keep
    /// this cheap; defer heavy acquisition to [`Processor::init`].
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError>;

    /// Encode an output for persistence. Override together with `decode`
    /// for values that are not naturally serializable.
    fn encode(&self, value: &Value) -> Result<serde_json::Value, ProcessError> {
        Ok(serde_json::to_value(value)?)
    }

    /// Decode a persisted output back into a value.
    fn decode(&self, raw: serde_json::Value) -> Result<Value, ProcessError> {
        Ok(serde_json::from_value(raw)?)
    }
}
