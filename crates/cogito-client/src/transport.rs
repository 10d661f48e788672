//! Wire types for the vendor messages endpoint and the HTTP transport.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use cogito_core::{CogitoError, CogitoResult, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    pub system: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl MessagesResponse {
    /// Response carrying a single text block.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock {
                kind: "text".into(),
                text: Some(text.into()),
            }],
        }
    }

    /// The generated text: the first non-empty text block.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .find(|text| !text.is_empty())
    }
}

/// One outbound call to the model vendor. Implementations do not retry;
/// the orchestrator owns the retry policy.
pub trait Transport: Send + Sync {
    fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Vendor base URL, or the base of a proxy exposing the same API.
    pub base_url: String,
    pub api_key: String,
    pub anthropic_version: String,
    pub timeout: Duration,
}

/// Blocking transport to the vendor messages endpoint.
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
    anthropic_version: String,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings) -> CogitoResult<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(CogitoError::Config("missing vendor API key".into()));
        }
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Ok(Self {
            agent,
            endpoint: format!(
                "{}{MESSAGES_PATH}",
                settings.base_url.trim_end_matches('/')
            ),
            api_key: settings.api_key,
            anthropic_version: settings.anthropic_version,
            timeout_ms: settings.timeout.as_millis() as u64,
        })
    }

    fn post(&self) -> ureq::Request {
        self.agent
            .post(&self.endpoint)
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", &self.anthropic_version)
            .set("content-type", "application/json")
    }

    /// Relay an arbitrary body to the vendor and hand back its status and
    /// JSON body, whatever the status. Only transport-level failures are
    /// errors.
    pub fn forward(&self, body: &Value) -> Result<(u16, Value), TransportError> {
        debug!(endpoint = %self.endpoint, "forwarding request to vendor");
        match self.post().send_json(body) {
            Ok(response) => {
                let status = response.status();
                let json = response
                    .into_json::<Value>()
                    .map_err(|e| TransportError::Decode(e.to_string()))?;
                Ok((status, json))
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                let json = serde_json::from_str(&text).unwrap_or(Value::String(text));
                Ok((status, json))
            }
            Err(ureq::Error::Transport(t)) => Err(classify_transport(&t, self.timeout_ms)),
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, TransportError> {
        debug!(endpoint = %self.endpoint, model = %request.model, "POST messages");
        match self.post().send_json(request) {
            Ok(response) => response
                .into_json::<MessagesResponse>()
                .map_err(|e| TransportError::Decode(e.to_string())),
            Err(ureq::Error::Status(status, response)) => Err(TransportError::Status {
                status,
                body: vendor_message(response.into_string().unwrap_or_default()),
            }),
            Err(ureq::Error::Transport(t)) => Err(classify_transport(&t, self.timeout_ms)),
        }
    }
}

/// A timeout anywhere in the source chain wins; everything else is a
/// network failure.
fn classify_transport(t: &ureq::Transport, timeout_ms: u64) -> TransportError {
    let mut source = t.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) {
                return TransportError::Timeout(timeout_ms);
            }
        }
        source = err.source();
    }
    TransportError::Network(t.to_string())
}

/// Pull `error.message` out of a vendor error body when there is one.
fn vendor_message(body: String) -> String {
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn settings(base_url: String, timeout: Duration) -> HttpSettings {
        HttpSettings {
            base_url,
            api_key: "k".into(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
            timeout,
        }
    }

    fn request() -> MessagesRequest {
        MessagesRequest {
            model: "m".into(),
            max_tokens: 10,
            messages: vec![Message::user("hi")],
            system: "s".into(),
        }
    }

    /// Consume one HTTP request: headers plus a content-length body.
    fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .filter_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        let value = lower.strip_prefix("content-length:")?;
                        value.trim().parse::<usize>().ok()
                    })
                    .next()
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Answer a single request with a canned status and body.
    fn stub_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_rate_limited_status_is_mapped() {
        let base = stub_server(
            "429 Too Many Requests",
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        );
        let transport = HttpTransport::new(settings(base, Duration::from_secs(5))).unwrap();
        let err = transport.send(&request()).unwrap_err();
        assert_eq!(
            err,
            TransportError::Status {
                status: 429,
                body: "slow down".into()
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unauthorized_status_is_credential_rejection() {
        let base = stub_server(
            "401 Unauthorized",
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        );
        let transport = HttpTransport::new(settings(base, Duration::from_secs(5))).unwrap();
        let err = transport.send(&request()).unwrap_err();
        assert!(err.is_credential_rejection());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_success_body_is_decoded() {
        let base = stub_server(
            "200 OK",
            r#"{"id":"msg_1","content":[{"type":"text","text":"{\"a\":1}"}]}"#,
        );
        let transport = HttpTransport::new(settings(base, Duration::from_secs(5))).unwrap();
        let response = transport.send(&request()).unwrap();
        assert_eq!(response.text(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_forward_relays_error_status() {
        let base = stub_server("400 Bad Request", r#"{"error":{"message":"bad"}}"#);
        let transport = HttpTransport::new(settings(base, Duration::from_secs(5))).unwrap();
        let (status, body) = transport.forward(&json!({"model": "m"})).unwrap();
        assert_eq!(status, 400);
        assert_eq!(body, json!({"error": {"message": "bad"}}));
    }

    #[test]
    fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            thread::sleep(Duration::from_secs(3));
        });
        let transport =
            HttpTransport::new(settings(format!("http://{addr}"), Duration::from_millis(200)))
                .unwrap();
        assert_eq!(
            transport.send(&request()).unwrap_err(),
            TransportError::Timeout(200)
        );
    }

    #[test]
    fn test_refused_connection_is_network_error() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let transport =
            HttpTransport::new(settings(format!("http://{addr}"), Duration::from_secs(2))).unwrap();
        assert!(matches!(
            transport.send(&request()).unwrap_err(),
            TransportError::Network(_)
        ));
    }

    #[test]
    fn test_request_wire_shape() {
        let request = MessagesRequest {
            model: "m".into(),
            max_tokens: 1000,
            messages: vec![Message::user("hi")],
            system: "persona".into(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "m",
                "max_tokens": 1000,
                "messages": [{"role": "user", "content": "hi"}],
                "system": "persona"
            })
        );
    }

    #[test]
    fn test_response_text_skips_empty_blocks() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": [
                {"type": "tool_use"},
                {"type": "text", "text": ""},
                {"type": "text", "text": "{\"a\":1}"}
            ]
        }))
        .unwrap();
        assert_eq!(response.text(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_response_without_content() {
        let response: MessagesResponse = serde_json::from_value(json!({"id": "x"})).unwrap();
        assert_eq!(response.text(), None);
    }

    #[test]
    fn test_vendor_message_extraction() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        assert_eq!(vendor_message(body.into()), "invalid x-api-key");
        assert_eq!(vendor_message("plain".into()), "plain");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let settings = HttpSettings {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: "  ".into(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
            timeout: Duration::from_secs(60),
        };
        assert!(matches!(
            HttpTransport::new(settings),
            Err(CogitoError::Config(_))
        ));
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let settings = HttpSettings {
            base_url: "http://localhost:3001/api/".into(),
            api_key: "k".into(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
            timeout: Duration::from_secs(1),
        };
        let transport = HttpTransport::new(settings).unwrap();
        assert_eq!(transport.endpoint, "http://localhost:3001/api/v1/messages");
    }
}
