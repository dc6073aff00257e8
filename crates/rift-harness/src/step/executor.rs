//! Three-phase step execution.
//!
//! 1. Register: every hook and wait step arms its hook, in declared order,
//!    before any action runs.
//! 2. Execute: actions run in order, waits block on their hook.
//! 3. Clean up: test-case hooks are removed from every touched component.
//!    This runs from a drop guard, so it also happens when the run is
//!    aborted or its future is dropped.

use super::result::{StepFailure, StepResult, StepStatus, TestCaseResult};
use super::{ActionFn, Step, StepKind, StepMode};
use crate::component::Component;
use crate::config::ExecutorConfig;
use crate::hook::{catch_panic, HookScope, WaitResult};
use crate::race::race;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Phase 2 work left for a step once phase 1 ran.
enum Armed {
    Action(ActionFn),
    Hook,
    Wait {
        rx: oneshot::Receiver<WaitResult>,
        timeout: Duration,
        label: String,
    },
}

struct Prepared {
    component: Arc<dyn Component>,
    mode: StepMode,
    message_type: Option<String>,
    description: Option<String>,
    armed: Armed,
}

/// Removes a test case's hooks from every component it touched.
struct Cleanup {
    test_case_id: String,
    components: Vec<Arc<dyn Component>>,
}

impl Cleanup {
    fn touch(&mut self, component: &Arc<dyn Component>) {
        let ptr = Arc::as_ptr(component) as *const ();
        if !self
            .components
            .iter()
            .any(|c| Arc::as_ptr(c) as *const () == ptr)
        {
            self.components.push(Arc::clone(component));
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for component in self.components.drain(..) {
            let result = catch_panic(|| component.clear_test_case_hooks(Some(&self.test_case_id)));
            match result {
                Some(Ok(removed)) => debug!(
                    "[{}] Removed {} hook(s) of test case {}",
                    component.name(),
                    removed,
                    self.test_case_id
                ),
                Some(Err(e)) => debug!(
                    "[{}] Hook cleanup for test case {} failed: {}",
                    component.name(),
                    self.test_case_id,
                    e
                ),
                None => debug!(
                    "[{}] Hook cleanup for test case {} panicked",
                    component.name(),
                    self.test_case_id
                ),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs step lists as test cases.
pub struct StepExecutor {
    config: ExecutorConfig,
    abort: CancellationToken,
}

impl StepExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            abort: CancellationToken::new(),
        }
    }

    /// Abort running and future test cases when `token` is cancelled.
    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `steps` as test case `id`. Its hooks are removed afterwards no
    /// matter how the run ends.
    pub async fn run_test_case(&self, id: &str, name: &str, steps: Vec<Step>) -> TestCaseResult {
        let mut cleanup = Cleanup {
            test_case_id: id.to_string(),
            components: Vec::new(),
        };
        for step in &steps {
            cleanup.touch(step.component());
        }
        let result = self
            .run(id, name, HookScope::TestCase(id.to_string()), steps)
            .await;
        drop(cleanup);
        result
    }

    /// Run scenario init steps. Hooks registered here are persistent and are
    /// never cleaned up by test cases.
    pub async fn run_init(&self, steps: Vec<Step>) -> TestCaseResult {
        self.run("init", "init", HookScope::Scenario, steps).await
    }

    /// Phase 1: arm every hook and wait step, in declared order.
    fn register(&self, scope: &HookScope, steps: Vec<Step>) -> Vec<Prepared> {
        steps
            .into_iter()
            .map(|step| {
                let mode = step.mode();
                let message_type = step.message_type();
                let description = step.description().map(str::to_string);
                let component = Arc::clone(step.component());
                let armed = match step.kind {
                    StepKind::Action(action) => Armed::Action(action),
                    StepKind::Hook(builder) => {
                        let (hook, _) = builder.build(scope.clone());
                        component.registry().register_hook(hook);
                        Armed::Hook
                    }
                    StepKind::Wait(builder) => {
                        let (hook, rx) = builder.build(scope.clone());
                        let timeout = builder
                            .wait_timeout()
                            .unwrap_or_else(|| self.config.default_wait_timeout());
                        let label = builder.matcher().label();
                        component.registry().register_hook(hook);
                        match rx {
                            Some(rx) => Armed::Wait { rx, timeout, label },
                            None => Armed::Hook,
                        }
                    }
                };
                Prepared {
                    component,
                    mode,
                    message_type,
                    description,
                    armed,
                }
            })
            .collect()
    }

    async fn run(
        &self,
        id: &str,
        name: &str,
        scope: HookScope,
        steps: Vec<Step>,
    ) -> TestCaseResult {
        let started = Instant::now();
        info!("Running test case '{}' ({}, {} steps)", name, id, steps.len());

        let prepared = self.register(&scope, steps);

        // Phase 2
        let mut results = Vec::with_capacity(prepared.len());
        let mut first_error: Option<StepFailure> = None;
        for (index, step) in prepared.into_iter().enumerate() {
            let step_started = Instant::now();
            let skip = if self.abort.is_cancelled() {
                if first_error.is_none() {
                    first_error = Some(StepFailure::new("Test case aborted"));
                }
                true
            } else {
                first_error.is_some() && self.config.fail_fast
            };

            let Prepared {
                component,
                mode,
                message_type,
                description,
                armed,
            } = step;

            let (status, error) = if skip {
                (StepStatus::Skipped, None)
            } else {
                match self.execute(armed).await {
                    Ok(()) => (StepStatus::Passed, None),
                    Err(failure) => {
                        warn!(
                            "Test case '{}' step {} ({} on {}) failed: {}",
                            name,
                            index,
                            mode,
                            component.name(),
                            failure.message
                        );
                        if first_error.is_none() {
                            first_error = Some(failure.clone());
                        }
                        (StepStatus::Failed, Some(failure))
                    }
                }
            };

            debug!("Step {} ({}) {:?}", index, mode, status);
            results.push(StepResult {
                index,
                mode,
                component: component.name().to_string(),
                message_type,
                description,
                status,
                duration_ms: elapsed_ms(step_started),
                error,
            });
        }

        let result = TestCaseResult::new(id, name, elapsed_ms(started), results, first_error);
        info!(
            "Test case '{}' {} in {}ms ({} passed, {} failed, {} skipped)",
            name,
            if result.passed { "passed" } else { "failed" },
            result.duration_ms,
            result.passed_steps,
            result.failed_steps,
            result.skipped_steps
        );
        result
    }

    async fn execute(&self, armed: Armed) -> Result<(), StepFailure> {
        match armed {
            Armed::Hook => Ok(()),
            Armed::Action(action) => {
                let run = AssertUnwindSafe(action()).catch_unwind();
                tokio::select! {
                    outcome = run => match outcome {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(StepFailure::from(&e)),
                        Err(payload) => Err(StepFailure::new(format!(
                            "Action panicked: {}",
                            panic_message(payload)
                        ))),
                    },
                    _ = self.abort.cancelled() => Err(StepFailure::new("Test case aborted")),
                }
            }
            Armed::Wait { rx, timeout, label } => {
                tokio::select! {
                    outcome = race(rx, timeout) => match outcome {
                        Ok(Ok(Ok(_message))) => Ok(()),
                        Ok(Ok(Err(error))) => Err(StepFailure::new(error)),
                        Ok(Err(_)) => Err(StepFailure::new(format!(
                            "Hook for message '{label}' was removed before it matched"
                        ))),
                        Err(_) => Err(StepFailure::new(format!(
                            "Timeout waiting for message '{label}' after {}ms",
                            timeout.as_millis()
                        ))),
                    },
                    _ = self.abort.cancelled() => Err(StepFailure::new("Test case aborted")),
                }
            }
        }
    }
}
