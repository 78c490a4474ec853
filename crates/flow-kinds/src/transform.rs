use async_trait::async_trait;
use flow_core::{Inputs, ProcessError, Processor, ProcessorKind, Signature, Value, ValueType};
use std::collections::BTreeMap;

/// Parses a JSON string into a JSON value.
pub struct JsonParse;

struct JsonParseProcessor;

#[async_trait]
impl Processor for JsonParseProcessor {
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        let text = inputs.require_str("json")?;
        let parsed: serde_json::Value = serde_json::from_str(text)?;
        Ok(Value::Json(parsed))
    }
}

impl ProcessorKind for JsonParse {
    fn name(&self) -> &str {
        "transform.json_parse"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn signature(&self) -> Signature {
        Signature::new().param("json", ValueType::String)
    }

    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(JsonParseProcessor))
    }
}

/// Renders any value as a pretty-printed JSON string.
pub struct JsonStringify;

struct JsonStringifyProcessor;

#[async_trait]
impl Processor for JsonStringifyProcessor {
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        let value = inputs.require("value")?;
        let text = serde_json::to_string_pretty(value)?;
        Ok(Value::String(text))
    }
}

impl ProcessorKind for JsonStringify {
    fn name(&self) -> &str {
        "transform.json_stringify"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn signature(&self) -> Signature {
        Signature::new().param("value", ValueType::Any)
    }

    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(JsonStringifyProcessor))
    }
}
