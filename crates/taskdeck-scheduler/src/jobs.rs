//! Registry of unit-of-work types that `UnitOfWork` tasks refer to by id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use taskdeck_core::error::{Result, TaskdeckError};

/// A queued piece of work built from positional arguments.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Run to completion. `Ok` carries the text stored as the run's output.
    async fn perform(&self) -> Result<String>;
}

/// Builds a unit of work from a task's positional arguments.
pub type JobFactory =
    Arc<dyn Fn(&[serde_json::Value]) -> Result<Box<dyn UnitOfWork>> + Send + Sync>;

/// Type id → factory.
#[derive(Default, Clone)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `type_id`.
    pub fn register<F>(&mut self, type_id: &str, factory: F)
    where
        F: Fn(&[serde_json::Value]) -> Result<Box<dyn UnitOfWork>> + Send + Sync + 'static,
    {
        self.factories.insert(type_id.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Instantiate `type_id` with `arguments`.
    pub fn build(&self, type_id: &str, arguments: &[serde_json::Value]) -> Result<Box<dyn UnitOfWork>> {
        let factory = self.factories.get(type_id).ok_or_else(|| {
            TaskdeckError::Execution(format!("no unit of work registered as '{type_id}'"))
        })?;
        factory(arguments)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").field("types", &self.type_ids()).finish()
    }
}
