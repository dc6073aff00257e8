//! End-to-end scenarios: clients, mocks and proxies wired over the in-process
//! network, plus one run over real TCP sockets.

use rift_harness::config::{ClientConfig, ExecutorConfig, ServerConfig};
use rift_harness::transport::{MemoryNetwork, TcpTransport};
use rift_harness::{
    AsyncServer, Client, Component, HookTarget, Message, Scenario, Step, StepMode, StepStatus,
    TestCase, TestGroup,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn mock(network: &MemoryNetwork, address: &str) -> Arc<AsyncServer> {
    Arc::new(AsyncServer::new(address, ServerConfig::mock(address), network.transport()).unwrap())
}

fn proxy(network: &MemoryNetwork, address: &str, target: &str) -> Arc<AsyncServer> {
    Arc::new(
        AsyncServer::new(
            address,
            ServerConfig::proxy(address, target),
            network.transport(),
        )
        .unwrap(),
    )
}

fn client(network: &MemoryNetwork, name: &str, target: &str) -> Arc<Client> {
    Arc::new(Client::new(name, ClientConfig::new(target), network.transport()).unwrap())
}

/// Backend answering `Login` with `LoginResponse`, echoing `user` and
/// `clientId`. Also answers `Ping` so callers can tell when it caught up.
fn login_backend(network: &MemoryNetwork) -> Arc<AsyncServer> {
    let backend = mock(network, "backend");
    backend
        .on_message("Login")
        .mock_event("LoginResponse", |p| {
            json!({"user": p["user"], "clientId": p["clientId"]})
        })
        .register_persistent();
    backend
        .on_message("Ping")
        .mock_event("Pong", |p| json!({"seq": p["seq"]}))
        .register_persistent();
    backend
}

#[tokio::test]
async fn test_ping_pong_against_mock() {
    let network = MemoryNetwork::new();
    let server = mock(&network, "mock");
    let alice = client(&network, "alice", "mock");

    let steps: Vec<Step> = vec![
        server
            .on_message("Ping")
            .mock_event("Pong", |p| json!({"seq": p["seq"]}))
            .into(),
        alice.send_step(Message::new("Ping", json!({"seq": 1}))),
        alice
            .wait_event("Pong")
            .where_payload(|m| m.payload["seq"] == 1)
            .into(),
    ];

    let result = Scenario::new("ping pong")
        .component(&server)
        .component(&alice)
        .group(TestGroup::sequential("basic").case(TestCase::new("ping", steps)))
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
    assert_eq!(result.passed_cases, 1);
    let steps = &result.test_cases[0].steps;
    assert_eq!(
        steps.iter().map(|s| s.mode).collect::<Vec<_>>(),
        vec![StepMode::Hook, StepMode::Action, StepMode::Wait]
    );
    assert_eq!(alice.state(), rift_harness::ComponentState::Stopped);
}

#[tokio::test]
async fn test_proxy_rewrites_login() {
    let network = MemoryNetwork::new();
    let backend = login_backend(&network);
    let front = proxy(&network, "proxy", "backend");
    let alice = client(&network, "alice", "proxy");

    let steps: Vec<Step> = vec![
        front
            .on_message("Login")
            .proxy_with(|p| {
                let user = p["user"].as_str().unwrap_or_default().to_uppercase();
                json!({"user": user, "clientId": p["clientId"]})
            })
            .into(),
        alice.send_step(Message::new("Login", json!({"user": "alice", "clientId": "c1"}))),
        alice
            .wait_event("LoginResponse")
            .where_payload(|m| m.payload["user"] == "ALICE")
            .into(),
    ];

    let result = Scenario::new("proxy login")
        .component(&backend)
        .component(&front)
        .component(&alice)
        .group(TestGroup::sequential("login").case(TestCase::new("uppercase", steps)))
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
}

#[tokio::test]
async fn test_dropped_messages_never_reach_the_backend() {
    let network = MemoryNetwork::new();
    let backend = login_backend(&network);
    let data_seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&data_seen);
    backend
        .on_message("Data")
        .assert(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .register_persistent();
    let front = proxy(&network, "proxy", "backend");
    let alice = client(&network, "alice", "proxy");

    // Messages on a session are handled in order, so once Pong is back the
    // Data message has already been dealt with.
    let steps: Vec<Step> = vec![
        front.on_message("Data").drop().into(),
        alice.send_step(Message::new("Data", json!({"bytes": 42}))),
        alice.send_step(Message::new("Ping", json!({"seq": 7}))),
        alice.wait_event("Pong").into(),
    ];

    let result = Scenario::new("drop data")
        .component(&backend)
        .component(&front)
        .component(&alice)
        .group(TestGroup::sequential("drops").case(TestCase::new("data", steps)))
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
    assert_eq!(data_seen.load(Ordering::SeqCst), 0);
    assert!(alice.received_of("Data").is_empty());
    assert!(result.unhandled_errors.is_empty());
}

#[tokio::test]
async fn test_wait_timeout_fails_the_test_case() {
    let network = MemoryNetwork::new();
    let server = mock(&network, "mock");

    let steps: Vec<Step> = vec![server
        .wait_message("Foo")
        .timeout(Duration::from_millis(50))
        .into()];

    let result = Scenario::new("timeout")
        .component(&server)
        .group(TestGroup::sequential("waits").case(TestCase::new("never arrives", steps)))
        .run()
        .await;

    assert!(!result.passed);
    assert_eq!(result.failed_cases, 1);
    let case = &result.test_cases[0];
    assert_eq!(case.steps[0].status, StepStatus::Failed);
    let message = &case.error.as_ref().unwrap().message;
    assert!(message.contains("Foo"), "{message}");
    assert!(message.contains("Timeout"), "{message}");
}

#[tokio::test]
async fn test_concurrent_sessions_only_see_their_own_responses() {
    let network = MemoryNetwork::new();
    let backend = login_backend(&network);
    let front = proxy(&network, "proxy", "backend");
    let first = client(&network, "first", "proxy");
    let second = client(&network, "second", "proxy");

    let mut steps: Vec<Step> = Vec::new();
    for (client, id) in [(&first, "c1"), (&second, "c2")] {
        for user in ["u1", "u2"] {
            steps.push(client.send_step(Message::new(
                "Login",
                json!({"user": user, "clientId": id}),
            )));
        }
    }
    // Declared after the sends; hooks are armed before any action runs. Each
    // session is ordered, so u2's response arrives last.
    for (client, id) in [(&first, "c1"), (&second, "c2")] {
        steps.push(
            client
                .wait_event("LoginResponse")
                .where_payload(move |m| m.payload["clientId"] == id && m.payload["user"] == "u2")
                .into(),
        );
    }

    let result = Scenario::new("isolation")
        .component(&backend)
        .component(&front)
        .component(&first)
        .component(&second)
        .group(TestGroup::sequential("sessions").case(TestCase::new("two clients", steps)))
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
    for (client, id) in [(&first, "c1"), (&second, "c2")] {
        let responses = client.received_of("LoginResponse");
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|m| m.payload["clientId"] == id));
    }
}

#[tokio::test]
async fn test_test_case_hooks_do_not_leak_into_later_cases() {
    let network = MemoryNetwork::new();
    let server = mock(&network, "mock");
    let alice = client(&network, "alice", "mock");

    let init: Vec<Step> = vec![server
        .on_message("Ping")
        .mock_event("Pong", |_| json!({"source": "init"}))
        .into()];
    let overridden: Vec<Step> = vec![
        server
            .on_message("Ping")
            .mock_event("Pong", |_| json!({"source": "case"}))
            .into(),
        alice.send_step(Message::new("Ping", json!({}))),
        alice
            .wait_event("Pong")
            .where_payload(|m| m.payload["source"] == "case")
            .into(),
    ];
    let plain: Vec<Step> = vec![
        alice.send_step(Message::new("Ping", json!({}))),
        alice
            .wait_event("Pong")
            .where_payload(|m| m.payload["source"] == "init")
            .into(),
    ];

    let result = Scenario::new("hook scopes")
        .component(&server)
        .component(&alice)
        .init(init)
        .group(
            TestGroup::sequential("scopes")
                .case(TestCase::new("override", overridden))
                .case(TestCase::new("persistent only", plain)),
        )
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
    assert!(result.init.as_ref().unwrap().passed);
    let sources: Vec<_> = alice
        .received_of("Pong")
        .iter()
        .map(|m| m.payload["source"].clone())
        .collect();
    assert_eq!(sources, vec![json!("case"), json!("init")]);
}

#[tokio::test]
async fn test_parallel_cases_run_concurrently_and_clean_up() {
    let network = MemoryNetwork::new();
    let server = mock(&network, "mock");
    let alice = client(&network, "alice", "mock");
    let bob = client(&network, "bob", "mock");

    let case = |who: &Arc<Client>, kind: &'static str| -> Vec<Step> {
        let reply = format!("{kind}Done");
        vec![
            server
                .on_message(kind)
                .delay(Duration::from_millis(100))
                .mock_event(reply.clone(), |_| json!({}))
                .into(),
            who.send_step(Message::new(kind, json!({}))),
            who.wait_event(reply.as_str()).into(),
        ]
    };
    let group = TestGroup::parallel("both")
        .case(TestCase::new("alice", case(&alice, "Alpha")))
        .case(TestCase::new("bob", case(&bob, "Beta")));

    let started = std::time::Instant::now();
    let result = Scenario::new("parallel")
        .component(&server)
        .component(&alice)
        .component(&bob)
        .group(group)
        .run()
        .await;

    assert!(result.passed, "{:?}", result.test_cases);
    assert_eq!(result.passed_cases, 2);
    assert!(started.elapsed() < Duration::from_millis(190));
    assert!(alice.received_of("BetaDone").is_empty());
    assert!(bob.received_of("AlphaDone").is_empty());
}

#[tokio::test]
async fn test_failed_component_start_skips_the_run() {
    let network = MemoryNetwork::new();
    let server = mock(&network, "mock");
    let orphan = client(&network, "orphan", "nowhere");

    let result = Scenario::with_config(
        "unreachable",
        ExecutorConfig {
            fail_fast: true,
            ..ExecutorConfig::default()
        },
    )
    .component(&server)
    .component(&orphan)
    .group(TestGroup::sequential("never").case(TestCase::new("skipped", Vec::new())))
    .run()
    .await;

    assert!(!result.passed);
    assert!(result.test_cases.is_empty());
    assert!(result.error.unwrap().contains("orphan"));
    assert!(!network.is_listening("mock"));
}

#[tokio::test]
async fn test_tcp_loopback_proxy() {
    let backend_transport = Arc::new(TcpTransport::new());
    let backend = Arc::new(assert_ok!(AsyncServer::new(
        "backend",
        ServerConfig::mock("127.0.0.1:0"),
        backend_transport.clone(),
    )));
    backend
        .on_message("Ping")
        .mock_event("Pong", |p| json!({"seq": p["seq"]}))
        .register_persistent();
    assert_ok!(backend.start().await);
    let backend_addr = backend_transport.local_addr().unwrap().to_string();

    let front_transport = Arc::new(TcpTransport::new());
    let front = Arc::new(assert_ok!(AsyncServer::new(
        "front",
        ServerConfig::proxy("127.0.0.1:0", backend_addr),
        front_transport.clone(),
    )));
    front
        .on_event("Pong")
        .transform(|p| json!({"seq": p["seq"], "via": "front"}))
        .register_persistent();
    assert_ok!(front.start().await);
    let front_addr = front_transport.local_addr().unwrap().to_string();

    let tcp_client = Client::new(
        "tcp-client",
        ClientConfig::new(front_addr),
        Arc::new(TcpTransport::new()),
    )
    .unwrap();
    assert_ok!(tcp_client.start().await);
    assert_ok!(tcp_client.send(Message::new("Ping", json!({"seq": 3}))).await);

    let pong = tokio::time::timeout(Duration::from_secs(5), tcp_client.first_of("Pong"))
        .await
        .unwrap();
    assert_eq!(pong.payload, json!({"seq": 3, "via": "front"}));

    assert_ok!(tcp_client.stop().await);
    assert_ok!(front.stop().await);
    assert_ok!(backend.stop().await);
}
