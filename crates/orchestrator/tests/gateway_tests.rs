mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use governance::{
    AuditCategory, AuditOutcome, BackendKind, GovernanceConfig, RateLimitError,
};
use orchestrator::{
    cancellation, estimate_cost, spawn_sweeper, CancelSignal, Gateway, InboundRequest, RelayError,
};
use support::{backends, Fixture, ScriptedBackend, Step};

fn inbound(identity: &str, prompt: &str) -> InboundRequest {
    InboundRequest {
        identity: identity.to_string(),
        prompt: prompt.to_string(),
        ..InboundRequest::default()
    }
}

fn gateway(fixture: &Fixture, config: &GovernanceConfig, claude: &Arc<ScriptedBackend>) -> Gateway {
    Gateway::build(
        config,
        fixture.storage.clone(),
        backends(&[claude]),
        fixture.clock.clone(),
    )
    .unwrap()
}

fn count(gateway: &Gateway, category: AuditCategory, outcome: AuditOutcome) -> usize {
    gateway
        .recent_audit(1000)
        .iter()
        .filter(|event| event.category == category && event.outcome == outcome)
        .count()
}

#[tokio::test]
async fn request_is_served_and_charged_actual_cost() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::new(BackendKind::Claude, Step::reply("hi there", 0.07));
    let gateway = gateway(&fixture, &fixture.config(), &claude);

    let outcome = gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(outcome.turn.response, "hi there");
    assert!(!outcome.replayed);
    assert!((outcome.budget.cost_spent - 0.07).abs() < 1e-9);
    assert_eq!(outcome.budget.request_count_remaining, 9);
    assert_eq!(count(&gateway, AuditCategory::Provider, AuditOutcome::Succeeded), 1);
    assert_eq!(count(&gateway, AuditCategory::Session, AuditOutcome::Allowed), 1);
}

#[tokio::test]
async fn requests_beyond_the_window_are_limited() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.rate_limit.requests = 2;
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &config, &claude);

    for _ in 0..2 {
        gateway
            .handle(inbound("alice", "hello"), CancelSignal::never())
            .await
            .unwrap();
    }
    let err = gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayError::RateLimited(RateLimitError::RequestLimit { .. })
    ));
    assert_eq!(claude.calls(), 2);
    assert_eq!(count(&gateway, AuditCategory::Rate, AuditOutcome::Denied), 1);

    // Other identities have their own budget.
    gateway
        .handle(inbound("bob", "hello"), CancelSignal::never())
        .await
        .unwrap();

    fixture.clock.advance(Duration::from_secs(61));
    gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_execution_keeps_the_estimate() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::failing(BackendKind::Claude);
    let gateway = gateway(&fixture, &fixture.config(), &claude);

    let err = gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ProviderFailure { attempts: 1, .. }));
    let budget = gateway.budget("alice");
    assert!((budget.cost_spent - estimate_cost("hello", false)).abs() < 1e-9);
    assert_eq!(count(&gateway, AuditCategory::Provider, AuditOutcome::Failed), 2);
}

#[tokio::test]
async fn traversal_refunds_the_reservation() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &fixture.config(), &claude);

    let mut request = inbound("alice", "hello");
    request.working_directory = Some(PathBuf::from("../../etc"));
    let err = gateway
        .handle(request, CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::DirectoryTraversal(_)));
    assert_eq!(gateway.budget("alice").cost_spent, 0.0);
    assert_eq!(claude.calls(), 0);
    assert_eq!(count(&gateway, AuditCategory::Path, AuditOutcome::Denied), 1);
}

#[tokio::test]
async fn replay_refunds_the_estimate_but_uses_a_slot() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::new(BackendKind::Claude, Step::reply("ok", 0.05));
    let gateway = gateway(&fixture, &fixture.config(), &claude);

    let mut request = inbound("alice", "hello");
    request.idempotency_key = Some("update-991".into());
    let first = gateway
        .handle(request.clone(), CancelSignal::never())
        .await
        .unwrap();
    let second = gateway
        .handle(request, CancelSignal::never())
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(second.turn.sequence, first.turn.sequence);
    assert!((second.budget.cost_spent - 0.05).abs() < 1e-9);
    assert_eq!(second.budget.request_count_remaining, 8);
    assert_eq!(claude.calls(), 1);
}

#[tokio::test]
async fn unlisted_identity_is_refused() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.auth.allowed_identities = vec!["alice".into()];
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &config, &claude);

    let err = gateway
        .handle(inbound("mallory", "hello"), CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Authentication(_)));
    assert_eq!(claude.calls(), 0);
    assert_eq!(count(&gateway, AuditCategory::Auth, AuditOutcome::Denied), 1);
    assert_eq!(gateway.budget("mallory").request_count_remaining, 10);
}

#[tokio::test]
async fn issued_token_authenticates() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.auth.allowed_identities = vec!["alice".into()];
    config.auth.token_auth = true;
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &config, &claude);

    let token = gateway.issue_token("alice", None).unwrap();
    let err = gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Authentication(_)));

    let mut request = inbound("alice", "hello");
    request.token = Some(token);
    gateway
        .handle(request.clone(), CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(gateway.revoke_tokens("alice").unwrap(), 1);
    assert!(gateway.handle(request, CancelSignal::never()).await.is_err());
}

#[tokio::test]
async fn tool_denial_is_audited_once() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.tools.allowed = vec!["Read".into(), "Grep".into()];
    let claude = ScriptedBackend::new(
        BackendKind::Claude,
        Step::tool("Write", serde_json::json!({ "file_path": "a.txt" })),
    );
    let gateway = gateway(&fixture, &config, &claude);

    let err = gateway
        .handle(inbound("alice", "write a file"), CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ToolDenied { .. }));
    assert_eq!(count(&gateway, AuditCategory::Tool, AuditOutcome::Denied), 1);
    assert!(gateway.budget("alice").cost_spent > 0.0);
}

#[tokio::test]
async fn sessions_close_only_for_their_owner() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &fixture.config(), &claude);
    let outcome = gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap();

    let err = gateway
        .close_session("bob", None, &outcome.session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Authorization(_)));

    let closed = gateway
        .close_session("alice", None, &outcome.session_id)
        .await
        .unwrap();
    assert_eq!(closed.turn_count, 1);
    let err = gateway
        .close_session("alice", None, &outcome.session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::SessionNotFound(_)));

    let next = gateway
        .handle(inbound("alice", "hello again"), CancelSignal::never())
        .await
        .unwrap();
    assert_ne!(next.session_id, outcome.session_id);
    assert_eq!(next.turn.sequence, 1);
}

#[tokio::test]
async fn sweeper_evicts_idle_sessions_until_stopped() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.sessions.idle_timeout_secs = 60;
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &config, &claude);
    gateway
        .handle(inbound("alice", "hello"), CancelSignal::never())
        .await
        .unwrap();
    let _ = gateway
        .handle(inbound("", "hello"), CancelSignal::never())
        .await;
    assert_eq!(gateway.auth().tracked_failures(), 1);
    fixture.clock.advance(Duration::from_secs(301));

    let (stop, signal) = cancellation();
    let sweeper = spawn_sweeper(
        gateway.auth().clone(),
        gateway.rate().clone(),
        gateway.sessions().clone(),
        Duration::from_millis(10),
        Duration::from_millis(10),
        signal,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.sessions().live_count(), 0);
    assert_eq!(gateway.auth().tracked_failures(), 0);

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn provider_health_lists_configured_backends() {
    let fixture = Fixture::new();
    let claude = ScriptedBackend::replying(BackendKind::Claude);
    let gateway = gateway(&fixture, &fixture.config(), &claude);
    // OpenAi is configured but has no implementation registered.
    let report = gateway.provider_health();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].provider_id, BackendKind::Claude);
    assert_eq!(gateway.shutdown(), 0);
}
