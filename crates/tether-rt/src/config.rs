//! Loop configuration.

use std::env;

use crate::utils::clamp;

/// Smallest and largest number of tasks polled per loop tick.
pub const MIN_TASK_BUDGET: usize = 1;
pub const MAX_TASK_BUDGET: usize = 4096;

const DEFAULT_TASK_BUDGET: usize = 64;

/// Settings for a [`Loop`](crate::Loop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Name used in log events.
    pub name: String,
    /// Maximum number of spawned tasks polled per loop tick before the loop
    /// goes back to dispatching wake handles.
    pub task_budget: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            task_budget: DEFAULT_TASK_BUDGET,
        }
    }
}

impl LoopConfig {
    /// Defaults overridden by `TETHER_LOOP_NAME` and `TETHER_TASK_BUDGET`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut builder = LoopBuilder::new();
        if let Ok(name) = env::var("TETHER_LOOP_NAME") {
            if !name.is_empty() {
                builder = builder.name(name);
            }
        }
        if let Some(budget) = env::var("TETHER_TASK_BUDGET")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            builder = builder.task_budget(budget);
        }
        builder.config()
    }
}

/// Fluent builder for [`LoopConfig`] / [`Loop`](crate::Loop).
#[derive(Debug, Clone, Default)]
pub struct LoopBuilder {
    config: LoopConfig,
}

impl LoopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Tasks polled per tick, clamped to
    /// [`MIN_TASK_BUDGET`]`..=`[`MAX_TASK_BUDGET`].
    pub fn task_budget(mut self, budget: usize) -> Self {
        self.config.task_budget = clamp(budget, MIN_TASK_BUDGET, MAX_TASK_BUDGET);
        self
    }

    pub fn config(self) -> LoopConfig {
        self.config
    }

    /// Create the loop.
    pub fn build(self) -> std::io::Result<std::sync::Arc<crate::Loop>> {
        crate::Loop::with_config(self.config)
    }
}
