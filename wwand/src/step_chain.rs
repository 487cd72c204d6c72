//! Sequential asynchronous task runner.
//!
//! A chain is an ordered queue of named steps. Each step runs to completion
//! before the next starts; a failing step either aborts the chain (default)
//! or is swallowed with a warning (ignorable). Chains run inside a driver
//! task owned by the capability, so aborting that task drops the in-flight
//! step future and nothing after it ever runs.

use crate::modem_manager::Result;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use tracing::{debug, warn};

type StepFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Step {
    name: &'static str,
    ignorable: bool,
    run: StepFn,
}

pub struct StepChain {
    name: &'static str,
    steps: VecDeque<Step>,
}

impl StepChain {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: VecDeque::new(),
        }
    }

    /// Append a step whose failure aborts the chain.
    pub fn push<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push_back(Step {
            name,
            ignorable: false,
            run: Box::new(move || Box::pin(f())),
        });
    }

    /// Append a step whose failure is logged and skipped over.
    pub fn push_ignorable<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push_back(Step {
            name,
            ignorable: true,
            run: Box::new(move || Box::pin(f())),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step strictly in order. The first fatal failure stops the
    /// chain and becomes its result.
    pub async fn run(mut self) -> Result<()> {
        let chain = self.name;
        while let Some(step) = self.steps.pop_front() {
            debug!(chain, step = step.name, "running step");
            match (step.run)().await {
                Ok(()) => {}
                Err(e) if step.ignorable => {
                    warn!(chain, step = step.name, "ignorable step failed: {e}");
                }
                Err(e) => {
                    warn!(chain, step = step.name, "step failed, aborting chain: {e}");
                    return Err(e);
                }
            }
        }
        debug!(chain, "chain completed");
        Ok(())
    }
}

impl std::fmt::Debug for StepChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepChain")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
