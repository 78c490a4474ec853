use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flow_core::{
    ConstructionError, FlowError, Inputs, ProcessError, Processor, ProcessorKind, ResourcePhase,
    Signature, Value, ValueType,
};
use flow_runtime::{Binding, Executor, Graph};

/// Adds two numbers and counts its lifecycle calls so tests can assert
/// exactly when the engine touched it.
struct CountingSum {
    version: String,
    init_calls: Arc<AtomicUsize>,
    process_calls: Arc<AtomicUsize>,
}

impl CountingSum {
    fn new() -> (Arc<Self>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        Self::with_version("1")
    }

    fn with_version(version: &str) -> (Arc<Self>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let init_calls = Arc::new(AtomicUsize::new(0));
        let process_calls = Arc::new(AtomicUsize::new(0));
        let kind = Arc::new(CountingSum {
            version: version.to_string(),
            init_calls: init_calls.clone(),
            process_calls: process_calls.clone(),
        });
        (kind, init_calls, process_calls)
    }
}

struct CountingSumProcessor {
    init_calls: Arc<AtomicUsize>,
    process_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Processor for CountingSumProcessor {
    async fn init(&mut self) -> Result<(), ProcessError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        let a = inputs.require_number("a")?;
        let b = inputs.require_number("b")?;
        Ok(Value::Number(a + b))
    }
}

impl ProcessorKind for CountingSum {
    fn name(&self) -> &str {
        "sum"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn signature(&self) -> Signature {
        Signature::new()
            .param("a", ValueType::Number)
            .param("b", ValueType::Number)
    }

    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Processor>, ProcessError> {
        Ok(Box::new(CountingSumProcessor {
            init_calls: self.init_calls.clone(),
            process_calls: self.process_calls.clone(),
        }))
    }
}

fn bindings(pairs: Vec<(&str, Binding)>) -> BTreeMap<String, Binding> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Chained addition: c0 -> n1(a=c0, b=200) -> n2(a=300, b=n1). Changing the
/// constant re-executes exactly its descendants.
#[tokio::test]
async fn chained_addition_recomputes_descendants() {
    let mut graph = Graph::new();
    let (sum1, _, n1_calls) = CountingSum::new();
    let (sum2, _, n2_calls) = CountingSum::new();

    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(100i64)).unwrap();
    let n1 = graph
        .add_node(1, sum1, bindings(vec![("a", Binding::node(c0)), ("b", Binding::value(200i64))]))
        .unwrap();
    let n2 = graph
        .add_node(2, sum2, bindings(vec![("a", Binding::value(300i64)), ("b", Binding::node(n1))]))
        .unwrap();

    assert_eq!(graph.run_upto(n2).await.unwrap(), Value::Number(600.0));

    graph.set_constant(c0, Value::from(0i64)).unwrap();
    assert_eq!(graph.run_upto(n2).await.unwrap(), Value::Number(500.0));

    assert_eq!(n1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 2);
}

/// Back-to-back runs with identical inputs: the second run is all cache
/// hits and touches no processor at all.
#[tokio::test]
async fn warm_cache_runs_zero_processes() {
    let mut graph = Graph::new();
    let (sum1, n1_inits, n1_calls) = CountingSum::new();
    let (sum2, n2_inits, n2_calls) = CountingSum::new();

    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(100i64)).unwrap();
    graph
        .add_node(1, sum1, bindings(vec![("a", Binding::node(c0)), ("b", Binding::value(200i64))]))
        .unwrap();
    let n2 = graph
        .add_node(2, sum2, bindings(vec![("a", Binding::value(300i64)), ("b", Binding::node(1))]))
        .unwrap();

    assert_eq!(graph.run_upto(n2).await.unwrap(), Value::Number(600.0));
    assert_eq!(graph.run_upto(n2).await.unwrap(), Value::Number(600.0));

    assert_eq!(n1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(n1_inits.load(Ordering::SeqCst), 1);
    assert_eq!(n2_inits.load(Ordering::SeqCst), 1);
}

/// Constant changes invalidate only the transitive descendants; siblings
/// keep their cached outputs.
#[tokio::test]
async fn sibling_branch_reuses_cache() {
    let mut graph = Graph::new();
    let (sum1, _, n1_calls) = CountingSum::new();
    let (sum2, _, n2_calls) = CountingSum::new();
    let (sum3, _, n3_calls) = CountingSum::new();

    let c0 = graph.add_constant_node(0, "left").unwrap();
    let c1 = graph.add_constant_node(1, "right").unwrap();
    graph.set_constant(c0, Value::from(1i64)).unwrap();
    graph.set_constant(c1, Value::from(2i64)).unwrap();

    graph
        .add_node(2, sum1, bindings(vec![("a", Binding::node(c0)), ("b", Binding::value(10i64))]))
        .unwrap();
    graph
        .add_node(3, sum2, bindings(vec![("a", Binding::node(c1)), ("b", Binding::value(20i64))]))
        .unwrap();
    let n3 = graph
        .add_node(4, sum3, bindings(vec![("a", Binding::node(2)), ("b", Binding::node(3))]))
        .unwrap();

    assert_eq!(graph.run_upto(n3).await.unwrap(), Value::Number(33.0));

    graph.set_constant(c0, Value::from(5i64)).unwrap();
    assert_eq!(graph.run_upto(n3).await.unwrap(), Value::Number(37.0));

    assert_eq!(n1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(n3_calls.load(Ordering::SeqCst), 2);
}

/// Releasing resources discards instances but not cached outputs; a rerun
/// reproduces the same result without re-initializing anything.
#[tokio::test]
async fn release_then_rerun_hits_cache() {
    let mut graph = Graph::new();
    let (sum, inits, calls) = CountingSum::new();

    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(3i64)).unwrap();
    let n1 = graph
        .add_node(1, sum, bindings(vec![("a", Binding::node(c0)), ("b", Binding::value(4i64))]))
        .unwrap();

    assert_eq!(graph.run_upto(n1).await.unwrap(), Value::Number(7.0));
    graph.release_resources().await.unwrap();
    assert_eq!(graph.run_upto(n1).await.unwrap(), Value::Number(7.0));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(inits.load(Ordering::SeqCst), 1);
}

/// Bumping a kind's version changes the fingerprint of the node and of
/// every descendant, forcing both to re-execute on identical inputs.
#[tokio::test]
async fn version_bump_invalidates_node_and_descendants() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("run.json");

    let build = |version: &str| {
        let mut graph = Graph::new();
        let (sum1, _, n1_calls) = CountingSum::with_version(version);
        let (sum2, _, n2_calls) = CountingSum::with_version("1");
        let c0 = graph.add_constant_node(0, "item_value").unwrap();
        graph.set_constant(c0, Value::from(100i64)).unwrap();
        graph
            .add_node(1, sum1, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(200i64))]))
            .unwrap();
        graph
            .add_node(2, sum2, bindings(vec![("a", Binding::value(300i64)), ("b", Binding::node(1))]))
            .unwrap();
        (graph, n1_calls, n2_calls)
    };

    let (mut graph, n1_calls, n2_calls) = build("1");
    graph.persist(&location);
    assert_eq!(graph.run_upto(2).await.unwrap(), Value::Number(600.0));
    assert_eq!(n1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 1);

    // Same document, same inputs, new version of n1's kind.
    let (mut graph, n1_calls, n2_calls) = build("2");
    graph.persist(&location);
    assert_eq!(graph.run_upto(2).await.unwrap(), Value::Number(600.0));
    assert_eq!(n1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 1);
}

/// A fresh graph loading a persisted document reuses every output.
#[tokio::test]
async fn persisted_document_reloads_without_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("run.json");

    let build = || {
        let mut graph = Graph::new();
        let (sum1, _, n1_calls) = CountingSum::new();
        let (sum2, _, n2_calls) = CountingSum::new();
        let c0 = graph.add_constant_node(0, "item_value").unwrap();
        graph.set_constant(c0, Value::from(2i64)).unwrap();
        graph
            .add_node(1, sum1, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
            .unwrap();
        graph
            .add_node(2, sum2, bindings(vec![("a", Binding::node(1)), ("b", Binding::node(1))]))
            .unwrap();
        (graph, n1_calls, n2_calls)
    };

    let (mut graph, ..) = build();
    graph.persist(&location);
    assert_eq!(graph.run_upto(2).await.unwrap(), Value::Number(8.0));

    let (mut graph, n1_calls, n2_calls) = build();
    graph.persist(&location);
    assert_eq!(graph.run_upto(2).await.unwrap(), Value::Number(8.0));
    assert_eq!(n1_calls.load(Ordering::SeqCst), 0);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 0);
}

/// The persisted document is plain JSON keyed by node id, with the
/// fingerprint and value visible to inspection tools.
#[tokio::test]
async fn persisted_document_is_inspectable() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("run.json");

    let mut graph = Graph::new();
    let (sum, ..) = CountingSum::new();
    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(1i64)).unwrap();
    graph
        .add_node(1, sum, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
        .unwrap();
    graph.persist(&location);
    graph.run_upto(1).await.unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
    assert_eq!(raw["1"]["name"], "sum");
    assert_eq!(raw["1"]["value"]["type"], "Number");
    assert_eq!(raw["1"]["value"]["value"], 3.0);
    assert!(raw["1"]["fingerprint"].is_string());
    assert!(raw["0"].is_object());
}

/// A failing process aborts the run with the node's identity, leaves
/// upstream outputs persisted, and stores nothing for the failing node.
#[tokio::test]
async fn process_failure_keeps_upstream_outputs() {
    struct Failing;
    struct FailingProcessor;

    #[async_trait]
    impl Processor for FailingProcessor {
        async fn process(&mut self, _inputs: &Inputs) -> Result<Value, ProcessError> {
            Err(ProcessError::failed("boom"))
        }
    }

    impl ProcessorKind for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn signature(&self) -> Signature {
            Signature::new().param("a", ValueType::Number)
        }

        fn create(
            &self,
            _config: &BTreeMap<String, Value>,
        ) -> Result<Box<dyn Processor>, ProcessError> {
            Ok(Box::new(FailingProcessor))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("run.json");

    let mut graph = Graph::new();
    let (sum, ..) = CountingSum::new();
    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(1i64)).unwrap();
    graph
        .add_node(1, sum, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
        .unwrap();
    let n2 = graph
        .add_node(2, Arc::new(Failing), bindings(vec![("a", Binding::node(1))]))
        .unwrap();
    graph.persist(&location);

    let err = graph.run_upto(n2).await.unwrap_err();
    match err {
        FlowError::Node(failure) => {
            assert_eq!(failure.node_id, 2);
            assert_eq!(failure.name, "failing");
        }
        other => panic!("expected node failure, got {other}"),
    }

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
    assert!(raw["1"].is_object());
    assert!(raw["2"].is_null());
}

/// init failures surface as resource errors, distinguishable from process
/// failures.
#[tokio::test]
async fn init_failure_is_a_resource_error() {
    struct BadInit;
    struct BadInitProcessor;

    #[async_trait]
    impl Processor for BadInitProcessor {
        async fn init(&mut self) -> Result<(), ProcessError> {
            Err(ProcessError::failed("gpu unavailable"))
        }

        async fn process(&mut self, _inputs: &Inputs) -> Result<Value, ProcessError> {
            Ok(Value::Null)
        }
    }

    impl ProcessorKind for BadInit {
        fn name(&self) -> &str {
            "bad_init"
        }

        fn signature(&self) -> Signature {
            Signature::new().param("a", ValueType::Number)
        }

        fn create(
            &self,
            _config: &BTreeMap<String, Value>,
        ) -> Result<Box<dyn Processor>, ProcessError> {
            Ok(Box::new(BadInitProcessor))
        }
    }

    let mut graph = Graph::new();
    let n1 = graph
        .add_node(1, Arc::new(BadInit), bindings(vec![("a", Binding::value(1i64))]))
        .unwrap();

    match graph.run_upto(n1).await.unwrap_err() {
        FlowError::Resource(failure) => {
            assert_eq!(failure.node_id, 1);
            assert_eq!(failure.phase, ResourcePhase::Init);
        }
        other => panic!("expected resource failure, got {other}"),
    }
}

/// A literal binding with the wrong type is rejected at add time; a
/// node-reference binding with the wrong runtime type is rejected by the
/// one-time validation pass before the node first runs.
#[tokio::test]
async fn type_mismatches_are_construction_errors() {
    let mut graph = Graph::new();
    let (sum, ..) = CountingSum::new();
    let err = graph
        .add_node(
            1,
            sum,
            bindings(vec![("a", Binding::value("one")), ("b", Binding::value(2i64))]),
        )
        .unwrap_err();
    assert!(matches!(err, ConstructionError::TypeMismatch { .. }));

    // A constant resolves at run time; its type is only seen then.
    let mut graph = Graph::new();
    let (sum, _, calls) = CountingSum::new();
    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from("not a number")).unwrap();
    let n1 = graph
        .add_node(1, sum, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
        .unwrap();

    match graph.run_upto(n1).await.unwrap_err() {
        FlowError::Construction(ConstructionError::TypeMismatch { node_id, param, .. }) => {
            assert_eq!(node_id, 1);
            assert_eq!(param, "a");
        }
        other => panic!("expected type mismatch, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Forgetting one node's entry re-executes only that node; descendants
/// still match their fingerprints afterwards.
#[tokio::test]
async fn forget_reexecutes_single_node() {
    let mut graph = Graph::new();
    let (sum1, _, n1_calls) = CountingSum::new();
    let (sum2, _, n2_calls) = CountingSum::new();

    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(1i64)).unwrap();
    graph
        .add_node(1, sum1, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
        .unwrap();
    let n2 = graph
        .add_node(2, sum2, bindings(vec![("a", Binding::node(1)), ("b", Binding::value(3i64))]))
        .unwrap();

    graph.run_upto(n2).await.unwrap();
    graph.store_mut().forget(1).unwrap();
    graph.run_upto(n2).await.unwrap();

    assert_eq!(n1_calls.load(Ordering::SeqCst), 2);
    assert_eq!(n2_calls.load(Ordering::SeqCst), 1);
}

/// Custom encode/decode hooks round-trip values the default serialization
/// cannot carry faithfully.
#[tokio::test]
async fn custom_codec_round_trips_through_the_store() {
    /// Emits bytes, persisting them hex-encoded.
    struct HexBytes;
    struct HexBytesProcessor;

    #[async_trait]
    impl Processor for HexBytesProcessor {
        async fn process(&mut self, inputs: &Inputs) -> Result<Value, ProcessError> {
            let n = inputs.require_number("n")? as u8;
            Ok(Value::Bytes(vec![n, n + 1, n + 2]))
        }
    }

    impl ProcessorKind for HexBytes {
        fn name(&self) -> &str {
            "hex_bytes"
        }

        fn signature(&self) -> Signature {
            Signature::new().param("n", ValueType::Number)
        }

        fn create(
            &self,
            _config: &BTreeMap<String, Value>,
        ) -> Result<Box<dyn Processor>, ProcessError> {
            Ok(Box::new(HexBytesProcessor))
        }

        fn encode(&self, value: &Value) -> Result<serde_json::Value, ProcessError> {
            match value {
                Value::Bytes(bytes) => {
                    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                    Ok(serde_json::Value::String(hex))
                }
                other => Err(ProcessError::failed(format!(
                    "expected bytes, got {}",
                    other.kind_name()
                ))),
            }
        }

        fn decode(&self, raw: serde_json::Value) -> Result<Value, ProcessError> {
            let hex = raw
                .as_str()
                .ok_or_else(|| ProcessError::failed("expected hex string"))?;
            let bytes = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|err| ProcessError::failed(err.to_string()))?;
            Ok(Value::Bytes(bytes))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("run.json");

    let mut graph = Graph::new();
    graph
        .add_node(1, Arc::new(HexBytes), bindings(vec![("n", Binding::value(7i64))]))
        .unwrap();
    graph.persist(&location);
    let first = graph.run_upto(1).await.unwrap();
    assert_eq!(first, Value::Bytes(vec![7, 8, 9]));

    // The document holds the hex string, not the tagged byte array.
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&location).unwrap()).unwrap();
    assert_eq!(raw["1"]["value"], "070809");

    // A fresh graph decodes the stored value back without re-running.
    let mut graph = Graph::new();
    graph
        .add_node(1, Arc::new(HexBytes), bindings(vec![("n", Binding::value(7i64))]))
        .unwrap();
    graph.persist(&location);
    assert_eq!(graph.run_upto(1).await.unwrap(), first);
}

/// A pre-cancelled token stops the run before any node executes.
#[tokio::test]
async fn cancellation_stops_the_run() {
    let mut graph = Graph::new();
    let (sum, _, calls) = CountingSum::new();
    let c0 = graph.add_constant_node(0, "item_value").unwrap();
    graph.set_constant(c0, Value::from(1i64)).unwrap();
    let n1 = graph
        .add_node(1, sum, bindings(vec![("a", Binding::node(0)), ("b", Binding::value(2i64))]))
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let executor = Executor::with_cancellation(cancel);
    assert!(matches!(
        executor.run_upto(&mut graph, n1).await,
        Err(FlowError::Cancelled)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
