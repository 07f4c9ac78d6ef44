//! Child-execution invocation.
//!
//! [`NotebookRunner`] is the primitive the relay calls to run a child
//! notebook. [`LocalRunner`] runs registered in-process handlers and
//! enforces the timeout itself.

use crate::error::RunError;
use crate::relay::Parameters;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs a child execution and returns its exit value.
#[async_trait]
pub trait NotebookRunner: Send + Sync {
    async fn run(
        &self,
        path: &str,
        timeout: Duration,
        parameters: Parameters,
    ) -> Result<String, RunError>;
}

/// Handler for one in-process notebook.
pub type NotebookHandler =
    Arc<dyn Fn(Parameters) -> BoxFuture<'static, Result<String, RunError>> + Send + Sync>;

/// In-process runner keyed by notebook path.
#[derive(Clone, Default)]
pub struct LocalRunner {
    notebooks: Arc<RwLock<HashMap<String, NotebookHandler>>>,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `path`, replacing any previous handler.
    pub fn register<F>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(Parameters) -> BoxFuture<'static, Result<String, RunError>> + Send + Sync + 'static,
    {
        self.notebooks.write().insert(path.into(), Arc::new(handler));
    }

    pub fn with_notebook<F>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Parameters) -> BoxFuture<'static, Result<String, RunError>> + Send + Sync + 'static,
    {
        self.register(path, handler);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.notebooks.read().contains_key(path)
    }
}

#[async_trait]
impl NotebookRunner for LocalRunner {
    async fn run(
        &self,
        path: &str,
        timeout: Duration,
        parameters: Parameters,
    ) -> Result<String, RunError> {
        let handler = self
            .notebooks
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| RunError::NotFound(path.to_string()))?;

        debug!(path, ?timeout, parameters = parameters.len(), "running notebook");
        match tokio::time::timeout(timeout, handler(parameters)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(path, ?timeout, "notebook timed out");
                Err(RunError::Timeout {
                    path: path.to_string(),
                    timeout,
                })
            }
        }
    }
}
