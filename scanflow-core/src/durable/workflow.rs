use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::Result;

use super::{codec, context::WorkflowContext};

/// A durable, replayable unit of orchestration.
///
/// `run` must be deterministic with respect to its context: every external
/// effect goes through [`WorkflowContext`] so a replay after a crash walks the
/// same sequence of slots.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(&self, ctx: &mut WorkflowContext, input: Self::Input) -> Result<Self::Output>;
}

/// Object-safe view over [`Workflow`] used by the registry.
#[async_trait]
pub trait ErasedWorkflow: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_encoded(&self, ctx: &mut WorkflowContext, input: Value) -> Result<Value>;
}

#[async_trait]
impl<W: Workflow> ErasedWorkflow for W {
    fn name(&self) -> &'static str {
        W::NAME
    }

    async fn run_encoded(&self, ctx: &mut WorkflowContext, input: Value) -> Result<Value> {
        let input: W::Input = codec::decode(input)?;
        let output = self.run(ctx, input).await?;
        codec::encode(&output)
    }
}

/// Name → implementation table consulted when an executor claims an instance.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    entries: HashMap<&'static str, Arc<dyn ErasedWorkflow>>,
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &names)
            .finish()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.entries.insert(W::NAME, Arc::new(workflow));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedWorkflow>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
