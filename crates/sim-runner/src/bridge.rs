use serde::{Deserialize, Serialize};
use serde_json::Value;

use sim_core::{ConfigError, GuestLanguage, SourceDescriptor};
use sim_script::{CallKind, CompiledScript, HostContext, HostState, Interpreter, ScriptError};

use crate::dataset::LoadedDataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterStatus {
    Loading,
    Loaded,
    Unused,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Initializer,
    Behavior,
}

#[derive(Debug)]
pub enum BridgeError {
    Config(ConfigError),
    Script {
        filename: String,
        error: ScriptError,
    },
    /// Native-language behaviors are compiled into the kernel; invoking the
    /// placeholder is always an error.
    NotParsed {
        filename: String,
    },
    InitializerShape {
        filename: String,
    },
    JsonInit {
        filename: String,
        message: String,
    },
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Config(err) => write!(f, "{}", err),
            BridgeError::Script { filename, error } => write!(f, "{}: {}", filename, error),
            BridgeError::NotParsed { filename } => {
                write!(f, "{}: native behavior not parsed at this layer", filename)
            }
            BridgeError::InitializerShape { filename } => {
                write!(f, "{}: init must return an array of agents", filename)
            }
            BridgeError::JsonInit { filename, message } => {
                write!(f, "{}: {}", filename, message)
            }
        }
    }
}

impl std::error::Error for BridgeError {}

#[derive(Debug, Clone)]
enum Callable {
    Script(CompiledScript),
    Interp,
    Native,
    JsonData,
}

/// A loaded initializer or behavior, ready to invoke through the bridge.
#[derive(Debug, Clone)]
pub struct LoadedBehavior {
    pub filename: String,
    pub dependencies: Vec<String>,
    source_text: String,
    callable: Callable,
}

/// Compiles and invokes guest-language callables. One bridge (and thus one
/// embedded interpreter) belongs to one scheduler worker; runs executing on
/// that worker share its warm interpreter, never with other workers.
pub struct BehaviorBridge {
    interpreter: Option<Interpreter>,
    status: InterpreterStatus,
}

impl Default for BehaviorBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorBridge {
    pub fn new() -> Self {
        Self {
            interpreter: None,
            status: InterpreterStatus::Unused,
        }
    }

    pub fn interpreter_status(&self) -> InterpreterStatus {
        self.status
    }

    /// A fresh initialize gets a clean slate after a previous run errored
    /// the interpreter state.
    pub fn clear_error(&mut self) {
        if self.status == InterpreterStatus::Errored {
            self.status = if self.interpreter.is_some() {
                InterpreterStatus::Loaded
            } else {
                InterpreterStatus::Unused
            };
        }
    }

    fn ensure_interpreter(&mut self) -> &mut Interpreter {
        if self.interpreter.is_none() {
            self.status = InterpreterStatus::Loading;
            self.interpreter = Some(Interpreter::new());
            self.status = InterpreterStatus::Loaded;
        }
        self.interpreter.as_mut().expect("interpreter built above")
    }

    pub fn load(
        &mut self,
        kind: LoadKind,
        descriptor: &SourceDescriptor,
        interpreter_enabled: bool,
    ) -> Result<LoadedBehavior, BridgeError> {
        let language = descriptor.language().map_err(BridgeError::Config)?;
        let filename = descriptor.filename.clone();
        let callable = match (kind, language) {
            (_, GuestLanguage::Script) => {
                let script =
                    CompiledScript::compile(&descriptor.source_text).map_err(|error| {
                        BridgeError::Script {
                            filename: filename.clone(),
                            error,
                        }
                    })?;
                Callable::Script(script)
            }
            (_, GuestLanguage::Interp) => {
                if !interpreter_enabled {
                    self.status = InterpreterStatus::Errored;
                    return Err(BridgeError::Config(ConfigError::InterpreterDisabled(
                        filename,
                    )));
                }
                let interpreter = self.ensure_interpreter();
                interpreter
                    .load(&filename, &descriptor.source_text)
                    .map_err(|error| BridgeError::Script {
                        filename: filename.clone(),
                        error,
                    })?;
                Callable::Interp
            }
            (LoadKind::Behavior, GuestLanguage::Native) => Callable::Native,
            (LoadKind::Initializer, GuestLanguage::Json) => Callable::JsonData,
            (LoadKind::Initializer, GuestLanguage::Native) => {
                return Err(BridgeError::Config(ConfigError::UnsupportedInitializer(
                    filename,
                )))
            }
            (LoadKind::Behavior, GuestLanguage::Json) => {
                return Err(BridgeError::Config(ConfigError::UnsupportedBehavior(
                    filename,
                )))
            }
        };
        Ok(LoadedBehavior {
            filename,
            dependencies: descriptor.dependencies.clone(),
            source_text: descriptor.source_text.clone(),
            callable,
        })
    }

    /// Behaviors mutate the passed-in state handle in place; the script's
    /// return value is ignored.
    pub fn invoke_behavior(
        &mut self,
        behavior: &LoadedBehavior,
        state: &mut dyn HostState,
        context: &dyn HostContext,
    ) -> Result<(), BridgeError> {
        match &behavior.callable {
            Callable::Script(script) => {
                script.run(state, context).map_err(|error| BridgeError::Script {
                    filename: behavior.filename.clone(),
                    error,
                })?;
                Ok(())
            }
            Callable::Interp => {
                let filename = behavior.filename.clone();
                let interpreter = self.interpreter.as_mut().ok_or_else(|| {
                    BridgeError::Config(ConfigError::InterpreterDisabled(filename.clone()))
                })?;
                interpreter
                    .call(&behavior.filename, CallKind::Behavior, state, context)
                    .map_err(|error| BridgeError::Script { filename, error })?;
                Ok(())
            }
            Callable::Native | Callable::JsonData => Err(BridgeError::NotParsed {
                filename: behavior.filename.clone(),
            }),
        }
    }

    /// Initializers must produce an array of agent records; anything else is
    /// a hard error.
    pub fn invoke_initializer(
        &mut self,
        initializer: &LoadedBehavior,
        context: &dyn HostContext,
    ) -> Result<Vec<Value>, BridgeError> {
        let filename = initializer.filename.clone();
        let result = match &initializer.callable {
            Callable::JsonData => serde_json::from_str::<Value>(&initializer.source_text)
                .map_err(|err| BridgeError::JsonInit {
                    filename: filename.clone(),
                    message: err.to_string(),
                })?,
            Callable::Script(script) => {
                let mut scratch = ScratchState::default();
                script
                    .run(&mut scratch, context)
                    .map_err(|error| BridgeError::Script {
                        filename: filename.clone(),
                        error,
                    })?
                    .unwrap_or(Value::Null)
            }
            Callable::Interp => {
                let interpreter = self.interpreter.as_mut().ok_or_else(|| {
                    BridgeError::Config(ConfigError::InterpreterDisabled(filename.clone()))
                })?;
                let mut scratch = ScratchState::default();
                interpreter
                    .call(&initializer.filename, CallKind::Init, &mut scratch, context)
                    .map_err(|error| BridgeError::Script {
                        filename: filename.clone(),
                        error,
                    })?
                    .unwrap_or(Value::Null)
            }
            Callable::Native => {
                return Err(BridgeError::Config(ConfigError::UnsupportedInitializer(
                    filename,
                )))
            }
        };
        match result {
            Value::Array(agents) => Ok(agents),
            _ => Err(BridgeError::InitializerShape { filename }),
        }
    }

    /// Push new global properties into every interpreter namespace.
    pub fn update_globals(&mut self, properties: &Value) {
        if let Some(interpreter) = &mut self.interpreter {
            interpreter.update_globals(properties);
        }
    }

    /// Inject freshly loaded datasets into the interpreter, keyed by storage
    /// key with a shortname index.
    pub fn refresh_datasets(&mut self, loaded: &[LoadedDataset]) {
        if let Some(interpreter) = &mut self.interpreter {
            interpreter.refresh_datasets(loaded.iter().map(|d| {
                (d.storage_key.clone(), d.shortname.clone(), d.payload.clone())
            }));
        }
    }

    pub fn interpreter_in_use(&self) -> bool {
        self.interpreter.is_some()
    }
}

/// Initializers have no agent state; writes land here and are discarded.
#[derive(Default)]
struct ScratchState {
    fields: serde_json::Map<String, Value>,
}

impl HostState for ScratchState {
    fn get(&self, key: &str) -> Option<Value> {
        self.fields.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    fn add_message(&mut self, _to: Value, _kind: String, _data: Value) {}
}
