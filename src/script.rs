// # Script Evaluation Seam
//
// The fabric ships script strings between processes but never interprets
// them itself: given a script and an optional context it asks a host for a
// result or an error. `CommandScriptHost` is the whitelist-only host: a
// registry of named operations dispatched by the script string, refusing
// anything unregistered. Hosts that embed a real interpreter implement the
// same trait.

use crate::message::ErrorPayload;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a hosted evaluation, in wire shape.
pub type ScriptResult = std::result::Result<Value, ErrorPayload>;

/// Evaluation capability of one side of the fabric.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Evaluates a script string with an optional serialized context.
    async fn eval(&self, script: &str, context: Option<Value>) -> ScriptResult;

    /// Resolves a dotted path against the embedded client's state.
    /// Missing segments yield `Value::Null`.
    async fn fetch_prop(&self, path: &str) -> Value {
        let _ = path;
        Value::Null
    }
}

/// Resolves a dotted path (`"a.b.c"`) inside a JSON value.
pub fn lookup_path(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return Value::Null;
        }
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

type CommandFn = Arc<dyn Fn(Option<Value>) -> ScriptResult + Send + Sync>;

/// Whitelist-only script host: the script string is an operation id, the
/// context is its argument struct.
#[derive(Default)]
pub struct CommandScriptHost {
    commands: RwLock<HashMap<String, CommandFn>>,
    state: RwLock<Value>,
}

impl CommandScriptHost {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
            state: RwLock::new(Value::Null),
        }
    }

    /// Registers a named operation. Re-registering replaces the previous
    /// handler.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> ScriptResult + Send + Sync + 'static,
    {
        self.commands.write().insert(name.into(), Arc::new(handler));
    }

    /// Replaces the state snapshot served by `fetch_prop`.
    pub fn set_state(&self, state: Value) {
        *self.state.write() = state;
    }

    pub fn state(&self) -> Value {
        self.state.read().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.read().len()
    }
}

#[async_trait]
impl ScriptHost for CommandScriptHost {
    async fn eval(&self, script: &str, context: Option<Value>) -> ScriptResult {
        let handler = self.commands.read().get(script).cloned();
        match handler {
            Some(handler) => handler(context),
            None => Err(ErrorPayload::new(
                "InvalidScript",
                format!("unknown operation: {}", script),
            )),
        }
    }

    async fn fetch_prop(&self, path: &str) -> Value {
        lookup_path(&self.state.read(), path)
    }
}

impl std::fmt::Debug for CommandScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandScriptHost")
            .field("commands", &self.command_count())
            .finish()
    }
}
