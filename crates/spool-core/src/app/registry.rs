use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Task, TaskResult, TaskType};
use crate::error::{HandlerError, RegistryError};

/// A handler for a specific task type.
///
/// Takes the whole claimed `Task` so the handler can decode `parameters` as
/// it likes (see [`Task::decode_parameters`]). Handlers never touch task
/// status; the worker records whatever they return.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError>;
}

/// Adapter so plain async closures can be registered.
pub struct FnHandler<F>(F);

/// ```ignore
/// let echo = handler_fn(|task: Task| async move {
///     Ok::<_, HandlerError>(TaskResult::success(1).with_data(task.parameters))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskResult, HandlerError>> + Send + 'static,
{
    async fn process(&self, task: &Task) -> Result<TaskResult, HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// Registry of handlers (task_type -> handler).
///
/// Design:
/// - Built during initialization (mutable).
/// - Shared read-only by the worker afterwards, so no locks.
/// - Its key set is the worker's claim filter.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type. Duplicates and malformed type
    /// names are rejected.
    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if !task_type.is_valid() {
            return Err(RegistryError::InvalidTaskType(task_type.to_string()));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
