use super::*;
use crate::component::{ComponentState, Lifecycle};
use crate::config::ExecutorConfig;
use crate::error::HarnessError;
use crate::hook::{Direction, HookOutcome, HookRegistry, HookTarget};
use crate::message::Message;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Component with nothing but a registry; actions drive traffic through it
/// directly.
struct Probe {
    lifecycle: Lifecycle,
    registry: HookRegistry,
}

fn probe(name: &str) -> Arc<Probe> {
    Arc::new(Probe {
        lifecycle: Lifecycle::new(name),
        registry: HookRegistry::new(name),
    })
}

#[async_trait]
impl Component for Probe {
    fn name(&self) -> &str {
        self.registry.owner()
    }

    fn state(&self) -> ComponentState {
        self.lifecycle.state()
    }

    fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    async fn start(&self) -> Result<(), HarnessError> {
        self.lifecycle.begin_start()?;
        self.lifecycle.transition(ComponentState::Started)?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        if self.lifecycle.begin_stop()? {
            self.lifecycle.transition(ComponentState::Stopped)?;
        }
        Ok(())
    }
}

fn publish(target: &Arc<Probe>, message_type: &'static str) -> Step {
    let component = Arc::clone(target);
    target.action(format!("publish {message_type}"), move || async move {
        // A publisher never sees hook failures.
        let _ = component
            .registry()
            .execute_hooks(Message::new(message_type, json!({"n": 1})), Direction::Downstream)
            .await;
        Ok(())
    })
}

fn executor() -> StepExecutor {
    StepExecutor::new(ExecutorConfig::default())
}

#[tokio::test]
async fn test_hooks_are_armed_before_any_action_runs() {
    let svc = probe("svc");
    let component = Arc::clone(&svc);
    let steps = vec![
        svc.action("publish before the hook step", move || async move {
            let outcome = component
                .registry()
                .execute_hooks(Message::new("Early", json!({})), Direction::Downstream)
                .await?;
            anyhow::ensure!(outcome == HookOutcome::Dropped, "Early was not intercepted");
            Ok(())
        }),
        svc.on_message("Early").drop().into(),
    ];

    let result = executor().run_test_case("t1", "armed early", steps).await;
    assert!(result.passed, "{:?}", result.error);
    assert_eq!(result.steps[1].mode, StepMode::Hook);
    assert_eq!(result.steps[1].message_type.as_deref(), Some("Early"));
}

#[tokio::test]
async fn test_wait_resolves_on_matching_message() {
    let svc = probe("svc");
    let publisher = Arc::clone(&svc);
    let steps: Vec<Step> = vec![
        publish(&svc, "Foo"),
        svc.wait_message("Foo").into(),
        svc.action("publish Bar later", move || async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = publisher
                    .registry()
                    .execute_hooks(Message::new("Bar", json!({})), Direction::Downstream)
                    .await;
            });
            Ok(())
        }),
        svc.wait_message("Bar").into(),
    ];

    let result = executor().run_test_case("t1", "wait", steps).await;
    assert!(result.passed, "{:?}", result.error);
    assert_eq!(result.steps[1].mode, StepMode::Wait);
    assert_eq!(result.steps[3].message_type.as_deref(), Some("Bar"));
}

#[tokio::test]
async fn test_wait_timeout_names_message_type() {
    let svc = probe("svc");
    let steps: Vec<Step> = vec![svc
        .wait_message("Foo")
        .timeout(Duration::from_millis(50))
        .into()];

    let started = Instant::now();
    let result = executor().run_test_case("t1", "timeout", steps).await;
    let elapsed = started.elapsed();

    assert!(!result.passed);
    assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(500));
    let message = &result.error.unwrap().message;
    assert!(message.contains("Foo"));
    assert!(message.contains("Timeout"));
}

#[tokio::test]
async fn test_wait_reports_chain_failure() {
    let svc = probe("svc");
    let steps: Vec<Step> = vec![
        publish(&svc, "Order"),
        svc.wait_message("Order")
            .assert(|p| p["qty"].as_u64().unwrap_or(0) > 0)
            .describe("quantity must be positive")
            .into(),
    ];

    let result = executor().run_test_case("t1", "assert", steps).await;
    assert!(!result.passed);
    let failed = result.first_failure().unwrap();
    assert_eq!(failed.mode, StepMode::Wait);
    assert!(failed
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("quantity must be positive"));
}

#[tokio::test]
async fn test_fail_fast_skips_remaining_steps() {
    let svc = probe("svc");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let steps = vec![
        svc.action("fails", || async { Err(anyhow::anyhow!("first failure")) }),
        svc.action("counts", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    ];

    let result = executor().run_test_case("t1", "fail fast", steps).await;
    assert!(!result.passed);
    assert_eq!(result.error.as_ref().unwrap().message, "first failure");
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_without_fail_fast_every_step_runs() {
    let svc = probe("svc");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let steps = vec![
        svc.action("fails", || async { Err(anyhow::anyhow!("first failure")) }),
        svc.action("also fails", || async { Err(anyhow::anyhow!("second failure")) }),
        svc.action("counts", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    ];

    let config = ExecutorConfig {
        fail_fast: false,
        ..ExecutorConfig::default()
    };
    let result = StepExecutor::new(config)
        .run_test_case("t1", "keep going", steps)
        .await;
    assert_eq!((result.failed_steps, result.passed_steps), (2, 1));
    assert_eq!(result.error.unwrap().message, "first failure");
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cleanup_removes_only_test_case_hooks() {
    let svc = probe("svc");
    let exec = executor();

    let init = exec.run_init(vec![svc.on_message("Audit").proxy().into()]).await;
    assert!(init.passed);

    let steps: Vec<Step> = vec![
        svc.on_message("A").drop().into(),
        svc.action("fails", || async { Err(anyhow::anyhow!("boom")) }),
    ];
    exec.run_test_case("t1", "cleanup", steps).await;

    assert_eq!(svc.registry().len(), 1);
    let remaining = svc
        .registry()
        .matching_hooks(&Message::new("Audit", json!({})), Direction::Downstream);
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].scope.is_persistent());
}

#[tokio::test]
async fn test_cleanup_runs_when_the_run_is_dropped() {
    let svc = probe("svc");
    let steps: Vec<Step> = vec![svc
        .wait_message("Never")
        .timeout(Duration::from_secs(30))
        .into()];

    let handle = tokio::spawn(async move { executor().run_test_case("t1", "dropped", steps).await });
    let registry_probe = Arc::clone(&svc);
    for _ in 0..100 {
        if !registry_probe.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(svc.registry().len(), 1);

    handle.abort();
    let _ = handle.await;
    assert!(svc.registry().is_empty());
}

#[tokio::test]
async fn test_abort_skips_steps_and_still_cleans_up() {
    let svc = probe("svc");
    let token = CancellationToken::new();
    let exec = executor().with_abort(token.clone());

    let cancel = token.clone();
    let steps: Vec<Step> = vec![
        svc.on_message("X").drop().into(),
        svc.action("abort", move || async move {
            cancel.cancel();
            Ok(())
        }),
        svc.action("never", || async { Ok(()) }),
    ];

    let result = exec.run_test_case("t1", "aborted", steps).await;
    assert!(!result.passed);
    assert_eq!(result.error.unwrap().message, "Test case aborted");
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert!(svc.registry().is_empty());
}

#[tokio::test]
async fn test_panicking_action_fails_step() {
    let svc = probe("svc");
    let steps = vec![svc.action("explodes", || async { panic!("kaboom") })];
    let result = executor().run_test_case("t1", "panic", steps).await;
    let message = result.error.unwrap().message;
    assert!(message.contains("Action panicked"));
    assert!(message.contains("kaboom"));
}

#[tokio::test]
async fn test_cleanup_touches_each_component_once() {
    let a = probe("a");
    let b = probe("b");
    let steps: Vec<Step> = vec![
        a.on_message("One").drop().into(),
        a.on_message("Two").drop().into(),
        b.on_event("Three").drop().into(),
    ];
    let result = executor().run_test_case("t1", "two components", steps).await;
    assert!(result.passed);
    assert!(a.registry().is_empty());
    assert!(b.registry().is_empty());
    assert_eq!(result.steps[2].component, "b");
}
