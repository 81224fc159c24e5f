use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use governance::{BackendKind, EndpointConfig, ProviderConfig};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, BackendEvent, BackendRequest, EventStream};

#[derive(Clone, Debug)]
pub struct HttpBackendConfig {
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            user_agent: "relay-orchestrator".to_string(),
        }
    }
}

#[derive(Serialize)]
struct InvocationBody<'a> {
    model: Option<&'a str>,
    #[serde(flatten)]
    request: &'a BackendRequest,
}

#[derive(Deserialize)]
struct InvocationReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_events: Vec<ToolEvent>,
    #[serde(default)]
    cost: f64,
}

#[derive(Deserialize)]
struct ToolEvent {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Backend reached over HTTP: one JSON POST per turn, answered with
/// `{content, tool_events, cost}`.
#[derive(Clone)]
pub struct HttpBackend {
    kind: BackendKind,
    client: reqwest::Client,
    endpoint: EndpointConfig,
    api_key: Option<String>,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(
        kind: BackendKind,
        endpoint: EndpointConfig,
        config: HttpBackendConfig,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .build()
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        let api_key = endpoint
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Ok(Self {
            kind,
            client,
            endpoint,
            api_key,
            config,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Some(key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }
}

/// HTTP backends for every entry in the priority order that has an
/// endpoint configured. Entries without one are skipped.
pub fn http_backends(
    config: &ProviderConfig,
    http: &HttpBackendConfig,
) -> Result<Vec<Arc<dyn Backend>>, BackendError> {
    let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
    for kind in &config.order {
        match config.endpoint(*kind) {
            Some(endpoint) => {
                let backend = HttpBackend::new(*kind, endpoint.clone(), http.clone())?;
                backends.push(Arc::new(backend));
            }
            None => warn!(backend = %kind, "no endpoint configured, backend skipped"),
        }
    }
    Ok(backends)
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(body),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            BackendError::Unavailable(body)
        }
        status if status.is_server_error() => BackendError::Upstream(format!("{status}: {body}")),
        status => BackendError::Rejected(format!("{status}: {body}")),
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if err.is_connect() {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Upstream(err.to_string())
    }
}

fn reply_to_events(reply: InvocationReply) -> Vec<Result<BackendEvent, BackendError>> {
    let mut events: Vec<Result<BackendEvent, BackendError>> = reply
        .tool_events
        .into_iter()
        .map(|event| {
            Ok(BackendEvent::ToolUse {
                name: event.name,
                arguments: event.arguments,
            })
        })
        .collect();
    if !reply.content.is_empty() {
        events.push(Ok(BackendEvent::Text {
            text: reply.content,
        }));
    }
    events.push(Ok(BackendEvent::Usage { cost: reply.cost }));
    events
}

#[async_trait]
impl Backend for HttpBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<EventStream, BackendError> {
        let body = InvocationBody {
            model: self.endpoint.model.as_deref(),
            request,
        };
        let response = self
            .client
            .post(&self.endpoint.url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }
        let reply: InvocationReply = response
            .json()
            .await
            .map_err(|err| BackendError::Upstream(format!("malformed reply: {err}")))?;
        debug!(
            backend = %self.kind,
            tool_events = reply.tool_events.len(),
            cost = reply.cost,
            "backend replied"
        );
        Ok(Box::pin(stream::iter(reply_to_events(reply))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            BackendError::Unauthorized(String::new())
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }

    #[test]
    fn backends_follow_order_and_skip_missing_endpoints() {
        let config = governance::GovernanceConfig::from_toml_str(
            r#"
[sandbox]
approved_root = "/srv/code"
[providers]
order = ["openai", "claude", "gemini"]
[providers.endpoints.Claude]
url = "http://localhost:9000/claude"
[providers.endpoints.openai]
url = "http://localhost:9000/openai"
"#,
        )
        .unwrap();
        let kinds: Vec<BackendKind> = http_backends(&config.providers, &HttpBackendConfig::default())
            .unwrap()
            .iter()
            .map(|backend| backend.kind())
            .collect();
        assert_eq!(kinds, vec![BackendKind::OpenAi, BackendKind::Claude]);
    }

    #[test]
    fn reply_events_put_tools_first() {
        let reply = InvocationReply {
            content: "done".into(),
            tool_events: vec![ToolEvent {
                name: "Read".into(),
                arguments: serde_json::json!({"file_path": "a"}),
            }],
            cost: 0.2,
        };
        let events: Vec<_> = reply_to_events(reply).into_iter().map(Result::unwrap).collect();
        assert!(matches!(events[0], BackendEvent::ToolUse { .. }));
        assert_eq!(events[1], BackendEvent::Text { text: "done".into() });
        assert_eq!(events[2], BackendEvent::Usage { cost: 0.2 });
    }
}
