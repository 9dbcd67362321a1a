use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ScriptError;
use crate::eval::{CompiledScript, HostContext, HostState};

/// What a namespace's callable is, for trace frame naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Behavior,
    Init,
}

impl CallKind {
    fn frame_name(self) -> &'static str {
        match self {
            CallKind::Behavior => "behavior",
            CallKind::Init => "init",
        }
    }
}

struct Namespace {
    script: CompiledScript,
    bindings: HashMap<String, Value>,
}

/// The embedded interpreter runtime for `.interp` guest sources.
///
/// One instance is owned by each scheduler worker; it is never shared across
/// concurrently running workers. Each loaded file gets its own namespace so
/// symbols never collide between files, while globals and the dataset cache
/// are interpreter-level and visible to every namespace.
///
/// The dataset cache is keyed by storage key; shortname lookups go through
/// an index, so two dataset versions sharing a shortname both stay cached
/// and the index points at the most recently bound version.
pub struct Interpreter {
    namespaces: HashMap<String, Namespace>,
    globals: Value,
    dataset_payloads: HashMap<String, Arc<Value>>,
    shortname_index: HashMap<String, String>,
    datasets_view: Value,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            namespaces: HashMap::new(),
            globals: Value::Object(Map::new()),
            dataset_payloads: HashMap::new(),
            shortname_index: HashMap::new(),
            datasets_view: Value::Object(Map::new()),
        }
    }

    /// Compile a source file into its own namespace. Syntax failures surface
    /// structured, position-carrying errors.
    pub fn load(&mut self, filename: &str, src: &str) -> Result<(), ScriptError> {
        let script = CompiledScript::compile(src)?;
        self.namespaces.insert(
            filename.to_string(),
            Namespace {
                script,
                bindings: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn is_loaded(&self, filename: &str) -> bool {
        self.namespaces.contains_key(filename)
    }

    /// Invoke a loaded file. State reads and writes go through a per-call
    /// key/value cache that is flushed into the backing state only when the
    /// call succeeds. Runtime failures come back as rendered trace text.
    pub fn call(
        &mut self,
        filename: &str,
        kind: CallKind,
        state: &mut dyn HostState,
        context: &dyn HostContext,
    ) -> Result<Option<Value>, ScriptError> {
        let globals = self.globals.clone();
        let datasets = self.datasets_view.clone();
        let namespace = self
            .namespaces
            .get_mut(filename)
            .ok_or_else(|| ScriptError::Trace(format!("no namespace loaded for '{}'", filename)))?;

        let mut cache = CachingState {
            inner: state,
            cache: HashMap::new(),
            messages: Vec::new(),
        };
        let wrapped = NamespacedContext {
            inner: context,
            globals,
            datasets,
        };
        let result = namespace
            .script
            .run_with_bindings(&mut namespace.bindings, &mut cache, &wrapped);
        match result {
            Ok(value) => {
                cache.flush();
                Ok(value)
            }
            Err(err) => Err(ScriptError::Trace(render_trace(filename, kind, &err))),
        }
    }

    /// Replace the globals every namespace sees. Applies to all loaded files
    /// at once; callers serialize this against in-flight calls.
    pub fn update_globals(&mut self, globals: &Value) {
        self.globals = globals.clone();
    }

    /// Inject dataset payloads for keys the interpreter has not seen yet and
    /// rebind the shortname index.
    pub fn refresh_datasets<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, String, Arc<Value>)>,
    {
        for (storage_key, shortname, payload) in entries {
            self.dataset_payloads.entry(storage_key.clone()).or_insert(payload);
            self.shortname_index.insert(shortname, storage_key);
        }
        let mut view = Map::new();
        for (shortname, storage_key) in &self.shortname_index {
            if let Some(payload) = self.dataset_payloads.get(storage_key) {
                view.insert(shortname.clone(), (**payload).clone());
            }
        }
        self.datasets_view = Value::Object(view);
    }

    pub fn dataset_by_shortname(&self, shortname: &str) -> Option<&Arc<Value>> {
        let storage_key = self.shortname_index.get(shortname)?;
        self.dataset_payloads.get(storage_key)
    }

    pub fn cached_storage_keys(&self) -> impl Iterator<Item = &String> {
        self.dataset_payloads.keys()
    }
}

/// Per-call state wrapper: reads populate a cache, writes stay in the cache,
/// and everything lands on the backing state in one flush after the call.
struct CachingState<'a> {
    inner: &'a mut dyn HostState,
    cache: HashMap<String, Value>,
    messages: Vec<(Value, String, Value)>,
}

impl CachingState<'_> {
    fn flush(self) {
        for (key, value) in self.cache {
            self.inner.set(&key, value);
        }
        for (to, kind, data) in self.messages {
            self.inner.add_message(to, kind, data);
        }
    }
}

impl HostState for CachingState<'_> {
    fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.cache.get(key) {
            return Some(value.clone());
        }
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.cache.insert(key.to_string(), value);
    }

    fn add_message(&mut self, to: Value, kind: String, data: Value) {
        self.messages.push((to, kind, data));
    }
}

/// Context wrapper serving globals and datasets from the interpreter while
/// delegating the per-agent views to the kernel's context.
struct NamespacedContext<'a> {
    inner: &'a dyn HostContext,
    globals: Value,
    datasets: Value,
}

impl HostContext for NamespacedContext<'_> {
    fn globals(&self) -> Value {
        self.globals.clone()
    }

    fn data(&self) -> Value {
        self.datasets.clone()
    }

    fn messages(&self) -> Value {
        self.inner.messages()
    }

    fn neighbors(&self) -> Value {
        self.inner.neighbors()
    }

    fn step(&self) -> u64 {
        self.inner.step()
    }
}

fn render_trace(filename: &str, kind: CallKind, err: &ScriptError) -> String {
    match err {
        ScriptError::Runtime { message, line, .. } => format!(
            "Trace (most recent call last):\n  File \"{}\", line {}, in {}\n{}\n  at sim_script::eval::Evaluator::exec\n  at sim_script::interp::Interpreter::call",
            filename,
            line,
            kind.frame_name(),
            message
        ),
        other => format!(
            "Trace (most recent call last):\n  File \"{}\", in {}\n{}\n  at sim_script::interp::Interpreter::call",
            filename,
            kind.frame_name(),
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MapState {
        fields: Map<String, Value>,
        messages: Vec<Value>,
    }

    impl MapState {
        fn new(fields: Value) -> Self {
            Self {
                fields: fields.as_object().cloned().unwrap_or_default(),
                messages: Vec::new(),
            }
        }
    }

    impl HostState for MapState {
        fn get(&self, key: &str) -> Option<Value> {
            self.fields.get(key).cloned()
        }
        fn set(&mut self, key: &str, value: Value) {
            self.fields.insert(key.to_string(), value);
        }
        fn add_message(&mut self, to: Value, kind: String, data: Value) {
            self.messages.push(json!({"to": to, "type": kind, "data": data}));
        }
    }

    struct NullContext;

    impl HostContext for NullContext {
        fn globals(&self) -> Value {
            json!({"marker": "kernel"})
        }
        fn data(&self) -> Value {
            json!({})
        }
        fn messages(&self) -> Value {
            json!([])
        }
        fn neighbors(&self) -> Value {
            json!([])
        }
        fn step(&self) -> u64 {
            7
        }
    }

    #[test]
    fn namespaces_are_isolated_per_file() {
        let mut interp = Interpreter::new();
        interp
            .load("a.interp", "let x = 1; state.from_a = x;")
            .expect("a should load");
        interp
            .load("b.interp", "let x = 2; state.from_b = x;")
            .expect("b should load");

        let mut state = MapState::new(json!({}));
        interp
            .call("a.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("a should run");
        interp
            .call("b.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("b should run");
        assert_eq!(state.fields["from_a"], json!(1));
        assert_eq!(state.fields["from_b"], json!(2));
    }

    #[test]
    fn interpreter_globals_shadow_kernel_globals() {
        let mut interp = Interpreter::new();
        interp.update_globals(&json!({"marker": "interp", "rate": 4}));
        interp
            .load("g.interp", "state.seen = context.globals().marker;")
            .expect("load");
        let mut state = MapState::new(json!({}));
        interp
            .call("g.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("run");
        assert_eq!(state.fields["seen"], json!("interp"));
    }

    #[test]
    fn globals_update_reaches_every_namespace() {
        let mut interp = Interpreter::new();
        interp.update_globals(&json!({"rate": 1}));
        interp
            .load("a.interp", "state.rate_a = context.globals().rate;")
            .expect("load a");
        interp
            .load("b.interp", "state.rate_b = context.globals().rate;")
            .expect("load b");
        interp.update_globals(&json!({"rate": 9}));

        let mut state = MapState::new(json!({}));
        interp
            .call("a.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("run a");
        interp
            .call("b.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("run b");
        assert_eq!(state.fields["rate_a"], json!(9));
        assert_eq!(state.fields["rate_b"], json!(9));
    }

    #[test]
    fn shortname_collision_keeps_both_versions_cached() {
        let mut interp = Interpreter::new();
        let v1 = Arc::new(json!([1]));
        let v2 = Arc::new(json!([2]));
        interp.refresh_datasets(vec![(
            "key-v1".to_string(),
            "rates".to_string(),
            v1.clone(),
        )]);
        interp.refresh_datasets(vec![(
            "key-v2".to_string(),
            "rates".to_string(),
            v2.clone(),
        )]);

        assert_eq!(interp.cached_storage_keys().count(), 2);
        let current = interp
            .dataset_by_shortname("rates")
            .expect("shortname resolves");
        assert!(Arc::ptr_eq(current, &v2));
    }

    #[test]
    fn datasets_are_visible_through_context_data() {
        let mut interp = Interpreter::new();
        interp.refresh_datasets(vec![(
            "key-1".to_string(),
            "rates".to_string(),
            Arc::new(json!([10, 20])),
        )]);
        interp
            .load("d.interp", "state.first = context.data().rates[0];")
            .expect("load");
        let mut state = MapState::new(json!({}));
        interp
            .call("d.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect("run");
        assert_eq!(state.fields["first"], json!(10));
    }

    #[test]
    fn failed_call_does_not_flush_state_writes() {
        let mut interp = Interpreter::new();
        interp
            .load("f.interp", "state.touched = true;\nlet bad = 1 + \"x\";")
            .expect("load");
        let mut state = MapState::new(json!({}));
        let err = interp
            .call("f.interp", CallKind::Behavior, &mut state, &NullContext)
            .expect_err("call should fail");
        assert!(!state.fields.contains_key("touched"));
        match err {
            ScriptError::Trace(trace) => {
                assert!(trace.contains("line 2, in behavior"), "trace: {}", trace);
                assert!(trace.contains("at sim_script"), "trace: {}", trace);
            }
            other => panic!("expected trace error, got {:?}", other),
        }
    }
}
