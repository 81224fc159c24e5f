#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream;
use governance::{
    AuditCategory, AuditLog, AuditOutcome, AuthorizationContext, BackendKind,
    CircuitBreakerConfig, GovernanceConfig, InMemoryHealthStore, InMemoryStorage, ManualClock,
    ToolMonitor,
};
use orchestrator::{
    Backend, BackendError, BackendEvent, BackendRequest, EventStream, ProviderOrchestrator,
    SessionCoordinator,
};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;

/// What a scripted backend does on one invocation.
#[derive(Clone, Debug)]
pub enum Step {
    Reply {
        text: String,
        cost: f64,
        tools: Vec<(String, Value)>,
    },
    Fail(BackendError),
    /// Never answers.
    Hang,
    /// Answers after a delay.
    Slow(Duration),
}

impl Step {
    pub fn reply(text: &str, cost: f64) -> Self {
        Step::Reply {
            text: text.to_string(),
            cost,
            tools: Vec::new(),
        }
    }

    pub fn tool(name: &str, arguments: Value) -> Self {
        Step::Reply {
            text: "done".to_string(),
            cost: 0.01,
            tools: vec![(name.to_string(), arguments)],
        }
    }
}

pub struct ScriptedBackend {
    kind: BackendKind,
    queued: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queued: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(kind: BackendKind) -> Arc<Self> {
        Self::new(kind, Step::reply(&format!("hello from {kind}"), 0.02))
    }

    pub fn failing(kind: BackendKind) -> Arc<Self> {
        Self::new(kind, Step::Fail(BackendError::Upstream("502 bad gateway".into())))
    }

    /// Queues a one-off step ahead of the fallback behaviour.
    pub fn then(&self, step: Step) {
        self.queued.lock().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn reply_stream(text: String, cost: f64, tools: Vec<(String, Value)>) -> EventStream {
        let mut events: Vec<Result<BackendEvent, BackendError>> = tools
            .into_iter()
            .map(|(name, arguments)| Ok(BackendEvent::ToolUse { name, arguments }))
            .collect();
        events.push(Ok(BackendEvent::Text { text }));
        events.push(Ok(BackendEvent::Usage { cost }));
        Box::pin(stream::iter(events))
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<EventStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        let step = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Reply { text, cost, tools } => Ok(Self::reply_stream(text, cost, tools)),
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
            Step::Slow(delay) => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Self::reply_stream(request.prompt.clone(), 0.02, Vec::new()))
            }
        }
    }
}

pub fn backends(list: &[&Arc<ScriptedBackend>]) -> Vec<Arc<dyn Backend>> {
    list.iter()
        .map(|backend| Arc::clone(*backend) as Arc<dyn Backend>)
        .collect()
}

/// Shared pieces for building components against a temporary approved root.
pub struct Fixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub clock: Arc<ManualClock>,
    pub storage: Arc<InMemoryStorage>,
    pub audit: Arc<AuditLog>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("project")).unwrap();
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let storage = InMemoryStorage::shared();
        let audit = AuditLog::shared(storage.clone(), clock.clone());
        Self {
            _dir: dir,
            root,
            clock,
            storage,
            audit,
        }
    }

    pub fn config(&self) -> GovernanceConfig {
        let mut config = GovernanceConfig::with_root(&self.root);
        config.providers.order = vec![BackendKind::Claude, BackendKind::OpenAi];
        config.providers.timeout_secs = 1;
        config.providers.max_switches = 3;
        config.providers.failure_threshold = 3;
        config.tools.allowed = ["Read", "Grep", "Write", "Bash"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        config
    }

    pub fn context(&self, identity: &str) -> AuthorizationContext {
        AuthorizationContext {
            identity: identity.to_string(),
            approved_root: self.root.clone(),
            granted_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            development: false,
        }
    }

    pub fn orchestrator(
        &self,
        config: &GovernanceConfig,
        backends: Vec<Arc<dyn Backend>>,
    ) -> (Arc<ProviderOrchestrator>, Arc<InMemoryHealthStore>) {
        let health = InMemoryHealthStore::shared(
            CircuitBreakerConfig::from(&config.providers),
            self.clock.clone(),
        );
        let tools =
            ToolMonitor::new(&config.tools, self.audit.clone(), self.clock.clone()).unwrap();
        let orchestrator = ProviderOrchestrator::new(
            &config.providers,
            backends,
            health.clone(),
            Arc::new(tools),
            self.audit.clone(),
        );
        (Arc::new(orchestrator), health)
    }

    pub fn coordinator(
        &self,
        config: &GovernanceConfig,
        backends: Vec<Arc<dyn Backend>>,
    ) -> Arc<SessionCoordinator> {
        let (orchestrator, _) = self.orchestrator(config, backends);
        Arc::new(SessionCoordinator::new(
            config.sessions.clone(),
            orchestrator,
            self.storage.clone(),
            self.audit.clone(),
            self.clock.clone(),
        ))
    }

    pub fn audited(&self, category: AuditCategory, outcome: AuditOutcome) -> usize {
        self.audit
            .recent(1000)
            .iter()
            .filter(|event| event.category == category && event.outcome == outcome)
            .count()
    }
}
