//! Per-agent-class table of named, invokable methods (§9 "dynamic dispatch
//! over method names"): RPC-callable methods and scheduler callback
//! methods are both looked up here instead of through any runtime
//! attribute/reflection mechanism. Unknown names fail synchronously at
//! `schedule()` time and loudly (logged, non-fatal) at fire time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::actor::context::ActorContext;
use crate::error::AgentError;

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, AgentError>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(Arc<ActorContext>, serde_json::Value) -> MethodFuture + Send + Sync>;

#[derive(Clone)]
pub struct MethodSpec {
    pub handler: MethodHandler,
    /// Whether clients may invoke this method directly via `rpc`. A method
    /// registered only for scheduler callbacks should leave this `false`.
    pub callable: bool,
}

#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodSpec>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, spec: MethodSpec) {
        self.methods.insert(name.into(), spec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }
}
