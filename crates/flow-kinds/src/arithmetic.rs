use async_trait::async_trait;
use flow_core::{Inputs, ProcessError, Processor, ProcessorKind, Signature, Value, ValueType};
use std::collections::BTreeMap;

/// Adds two numbers.
pub struct Sum;

struct SumProcessor;

#[async_trait]
impl Processor for SumProcessor {
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        let a = inputs.require_number("a")?;
        let b = inputs.require_number("b")?;
        Ok(Value::Number(a + b))
    }
}

impl ProcessorKind for Sum {
    fn name(&self) -> &str {
        "arithmetic.sum"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn signature(&self) -> Signature {
        Signature::new()
            .param("a", ValueType::Number)
            .param("b", ValueType::Number)
    }

    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(SumProcessor))
    }
}

/// Adds a fixed amount, supplied as a construction argument.
pub struct Increment;

struct IncrementProcessor {
    amount: f64,
}

#[async_trait]
impl Processor for IncrementProcessor {
    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        let a = inputs.require_number("a")?;
        Ok(Value::Number(a + self.amount))
    }
}

impl ProcessorKind for Increment {
    fn name(&self) -> &str {
        "arithmetic.increment"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn signature(&self) -> Signature {
        Signature::new().param("a", ValueType::Number)
    }

    fn config_schema(&self) -> Signature {
        Signature::new().param("amount", ValueType::Number)
    }

    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        let amount = config
            .get("amount")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProcessError::Configuration("missing amount".to_string()))?;
        Ok(Box::new(IncrementProcessor { amount }))
    }
}
