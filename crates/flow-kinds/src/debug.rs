use async_trait::async_trait;
use flow_core::{Inputs, ProcessError, Processor, ProcessorKind, Signature, Value, ValueType};
use std::collections::BTreeMap;

/// Logs its input and passes it through unchanged.
pub struct Log;

struct LogProcessor;

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        let value = inputs.require("value")?;
        tracing::info!(?value, "debug.log");
        Ok(value.clone())
    }
}

impl ProcessorKind for Log {
    fn name(&self) -> &str {
        "debug.log"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn signature(&self) -> Signature {
        Signature::new().param("value", ValueType::Any)
    }

    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(LogProcessor))
    }
}
