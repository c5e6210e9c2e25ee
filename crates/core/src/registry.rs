use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, DEFAULT_TASK_TYPE};
use crate::processor::TaskProcessor;
use crate::processors::{RoomGenerationProcessor, RoomRegenProcessor};

/// Task-type → processor map, fixed once the server starts.
pub struct TaskRegistry {
    processors: HashMap<String, Arc<dyn TaskProcessor>>,
    default_task_type: String,
}

impl TaskRegistry {
    pub fn new(default_task_type: impl Into<String>) -> Self {
        Self {
            processors: HashMap::new(),
            default_task_type: default_task_type.into(),
        }
    }

    pub fn register(&mut self, processor: Arc<dyn TaskProcessor>) {
        self.processors
            .insert(processor.task_type().to_string(), processor);
    }

    pub fn lookup(&self, task_type: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.get(task_type).cloned()
    }

    pub fn default_task_type(&self) -> &str {
        &self.default_task_type
    }

    pub fn list_supported(&self) -> Vec<&str> {
        let mut task_types: Vec<&str> = self.processors.keys().map(|v| v.as_str()).collect();
        task_types.sort_unstable();
        task_types
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_TYPE)
    }
}

pub fn register_all_processors(registry: &mut TaskRegistry, config: &AppConfig) {
    registry.register(Arc::new(RoomGenerationProcessor::new(config)));
    registry.register(Arc::new(RoomRegenProcessor::new(config)));
}

pub fn build_default_registry(config: &AppConfig) -> TaskRegistry {
    let mut registry = TaskRegistry::new(config.tasks.default_task.clone());
    register_all_processors(&mut registry, config);
    registry
}
