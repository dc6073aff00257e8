//! Scenario orchestration.
//!
//! A scenario owns its components, starts them in order, runs init steps
//! (whose hooks persist), runs its test groups, and stops the components in
//! reverse order.

use crate::component::Component;
use crate::config::ExecutorConfig;
use crate::hook::UnhandledError;
use crate::step::{Step, StepExecutor, TestCaseResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How the test cases of a group are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    #[default]
    Sequential,
    Parallel,
}

pub struct TestCase {
    pub name: String,
    steps: Vec<Step>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

pub struct TestGroup {
    pub name: String,
    pub mode: GroupMode,
    cases: Vec<TestCase>,
}

impl TestGroup {
    pub fn sequential(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: GroupMode::Sequential,
            cases: Vec::new(),
        }
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self {
            mode: GroupMode::Parallel,
            ..Self::sequential(name)
        }
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<TestCaseResult>,
    pub test_cases: Vec<TestCaseResult>,
    pub passed_cases: usize,
    pub failed_cases: usize,
    /// Set when the scenario could not run its test cases at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhandled_errors: Vec<UnhandledError>,
}

pub struct Scenario {
    name: String,
    components: Vec<Arc<dyn Component>>,
    init: Vec<Step>,
    groups: Vec<TestGroup>,
    executor: StepExecutor,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ExecutorConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            init: Vec::new(),
            groups: Vec::new(),
            executor: StepExecutor::new(config),
        }
    }

    /// Register a component. Components start in registration order.
    pub fn component<C: Component + 'static>(mut self, component: &Arc<C>) -> Self {
        self.components.push(Arc::clone(component) as Arc<dyn Component>);
        self
    }

    pub fn init(mut self, steps: Vec<Step>) -> Self {
        self.init.extend(steps);
        self
    }

    pub fn group(mut self, group: TestGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_abort(token);
        self
    }

    pub async fn run(self) -> ScenarioResult {
        let Scenario {
            name,
            components,
            init,
            groups,
            executor,
        } = self;
        let started = Instant::now();
        info!("Starting scenario '{}'", name);

        let mut result = ScenarioResult {
            name: name.clone(),
            passed: false,
            duration_ms: 0,
            init: None,
            test_cases: Vec::new(),
            passed_cases: 0,
            failed_cases: 0,
            error: None,
            unhandled_errors: Vec::new(),
        };

        if let Err(e) = start_components(&components).await {
            result.error = Some(e);
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let init_passed = if init.is_empty() {
            true
        } else {
            let init_result = executor.run_init(init).await;
            let passed = init_result.passed;
            result.init = Some(init_result);
            passed
        };

        if init_passed {
            for group in groups {
                let cases = run_group(&executor, group).await;
                result.test_cases.extend(cases);
            }
        } else {
            result.error = Some("Scenario init failed".to_string());
        }

        for component in &components {
            result.unhandled_errors.extend(component.unhandled_errors());
        }
        stop_components(&components).await;

        result.passed_cases = result.test_cases.iter().filter(|t| t.passed).count();
        result.failed_cases = result.test_cases.len() - result.passed_cases;
        result.passed = result.error.is_none() && result.failed_cases == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Scenario '{}' {} ({} passed, {} failed) in {}ms",
            name,
            if result.passed { "passed" } else { "failed" },
            result.passed_cases,
            result.failed_cases,
            result.duration_ms
        );
        result
    }
}

async fn start_components(components: &[Arc<dyn Component>]) -> Result<(), String> {
    for (index, component) in components.iter().enumerate() {
        if let Err(e) = component.start().await {
            error!("Component '{}' failed to start: {}", component.name(), e);
            stop_components(&components[..index]).await;
            return Err(format!(
                "Component '{}' failed to start: {}",
                component.name(),
                e
            ));
        }
    }
    Ok(())
}

/// Stop in reverse order. Errors are logged and otherwise ignored.
async fn stop_components(components: &[Arc<dyn Component>]) {
    for component in components.iter().rev() {
        if let Err(e) = component.stop().await {
            warn!("Error stopping component '{}': {}", component.name(), e);
        }
    }
}

async fn run_group(executor: &StepExecutor, group: TestGroup) -> Vec<TestCaseResult> {
    info!(
        "Running group '{}' ({:?}, {} test cases)",
        group.name,
        group.mode,
        group.cases.len()
    );
    // Every test case gets a fresh id so its hooks can be told apart.
    let runs = group.cases.into_iter().map(|case| {
        let id = uuid::Uuid::new_v4().to_string();
        async move { executor.run_test_case(&id, &case.name, case.steps).await }
    });
    match group.mode {
        GroupMode::Parallel => join_all(runs).await,
        GroupMode::Sequential => {
            let mut results = Vec::new();
            for run in runs {
                results.push(run.await);
            }
            results
        }
    }
}
