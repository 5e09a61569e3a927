use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};
use tungstenite::http::Uri;
use tungstenite::{Message, WebSocket};

use crate::node::AttachError;
use crate::profile::Pid;

/// Port Node's inspector listens on when opened with SIGUSR1. It can't be
/// changed from the outside.
pub const DEFAULT_DEBUGGER_PORT: u16 = 9229;

/// Bounded, fixed-delay retries for debugger discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// What the payload module should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAction {
    Start,
    Stop,
}

impl ModuleAction {
    fn method(&self) -> &'static str {
        match self {
            ModuleAction::Start => "start",
            ModuleAction::Stop => "stop",
        }
    }
}

/// Access to a Node.js process' inspector.
pub trait Inspector: Send + Sync {
    /// Asks the process to open its inspector endpoint.
    fn open_endpoint(&self, pid: Pid) -> Result<(), AttachError>;

    /// A single attempt at finding the endpoint's WebSocket url.
    fn discover(&self) -> Result<String, AttachError>;

    fn connect(&self, url: &str) -> Result<Box<dyn InspectorSession>, AttachError>;
}

pub trait InspectorSession {
    /// Evaluates `expression` with `Runtime.evaluate` and returns the whole
    /// response message.
    fn evaluate(&mut self, expression: &str) -> Result<Value, AttachError>;
}

pub fn discover_debugger_url(
    inspector: &dyn Inspector,
    retry: &RetryPolicy,
) -> Result<String, AttachError> {
    let mut last_failure = String::new();
    for attempt in 1..=retry.attempts {
        match inspector.discover() {
            Ok(url) => return Ok(url),
            Err(err) => {
                debug!("debugger discovery attempt {} failed: {}", attempt, err);
                last_failure = err.to_string();
            }
        }
        if attempt < retry.attempts {
            thread::sleep(retry.delay);
        }
    }

    Err(AttachError::DebuggerEndpointNotFound {
        attempts: retry.attempts,
        last_failure,
    })
}

/// Loads the payload module from `module_dir` (a path inside the target's
/// mount namespace) and starts or stops it.
pub fn control_module(
    session: &mut dyn InspectorSession,
    module_dir: &str,
    action: ModuleAction,
) -> Result<(), AttachError> {
    let expression = format!(
        "process.mainModule.require(\"{}/linux-perf.js\").{}()",
        module_dir.trim_end_matches('/'),
        action.method()
    );
    let response = session.evaluate(&expression)?;
    match response.pointer("/result/result/type") {
        Some(Value::String(kind)) if kind == "boolean" => Ok(()),
        _ => Err(AttachError::UnexpectedProtocolResponse(response.to_string())),
    }
}

pub fn evaluate_value(
    session: &mut dyn InspectorSession,
    expression: &str,
) -> Result<Value, AttachError> {
    let response = session.evaluate(expression)?;
    response
        .pointer("/result/result/value")
        .cloned()
        .ok_or_else(|| AttachError::UnexpectedProtocolResponse(response.to_string()))
}

/// Makes sure the session talks to the process we meant: same pid namespace
/// instance and same pid within it.
pub fn validate_target(
    session: &mut dyn InspectorSession,
    expected_nspid: Pid,
    expected_ns_link: &str,
) -> Result<(), AttachError> {
    let ns_link = evaluate_value(
        session,
        "const fs = process.mainModule.require(\"fs\"); fs.readlinkSync(\"/proc/self/ns/pid\")",
    )?;
    let ns_link = ns_link
        .as_str()
        .ok_or_else(|| AttachError::UnexpectedProtocolResponse(ns_link.to_string()))?;
    if ns_link != expected_ns_link {
        return Err(AttachError::WrongTargetProcess {
            expected: expected_ns_link.to_string(),
            actual: ns_link.to_string(),
        });
    }

    let pid = evaluate_value(session, "process.pid")?;
    let pid = pid
        .as_i64()
        .ok_or_else(|| AttachError::UnexpectedProtocolResponse(pid.to_string()))?;
    if pid != i64::from(expected_nspid) {
        return Err(AttachError::WrongTargetProcess {
            expected: format!("pid {}", expected_nspid),
            actual: format!("pid {}", pid),
        });
    }
    Ok(())
}

/// One entry of the inspector's `/json/list`.
#[derive(Debug, Deserialize)]
struct DebuggerTarget {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// Talks to the inspector over the loopback interface of whatever network
/// namespace the calling thread is in.
#[derive(Debug, Clone)]
pub struct NodeInspector {
    port: u16,
    http_timeout: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for NodeInspector {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUGGER_PORT)
    }
}

impl NodeInspector {
    pub fn new(port: u16) -> Self {
        NodeInspector {
            port,
            http_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl Inspector for NodeInspector {
    fn open_endpoint(&self, pid: Pid) -> Result<(), AttachError> {
        kill(NixPid::from_raw(pid), Signal::SIGUSR1).map_err(|e| match e {
            nix::errno::Errno::ESRCH => AttachError::NoSuchProcess(pid),
            other => AttachError::Signal(other),
        })
    }

    #[instrument(level = "debug", skip(self))]
    fn discover(&self) -> Result<String, AttachError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.http_timeout)
            .no_proxy()
            .build()
            .map_err(|e| AttachError::Http(e.to_string()))?;
        let response = client
            .get(format!("http://127.0.0.1:{}/json/list", self.port))
            .send()
            .map_err(|e| AttachError::Http(e.to_string()))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        if status != StatusCode::OK || !is_json {
            let body = response.text().unwrap_or_default();
            return Err(AttachError::Http(format!("status {}: {}", status, body)));
        }

        let body = response
            .text()
            .map_err(|e| AttachError::Http(e.to_string()))?;
        let targets: Vec<DebuggerTarget> = serde_json::from_str(&body)
            .map_err(|e| AttachError::Http(format!("{}: {}", e, body)))?;
        targets
            .into_iter()
            .next()
            .and_then(|target| target.web_socket_debugger_url)
            .ok_or_else(|| AttachError::Http(format!("no debugger url in {}", body)))
    }

    fn connect(&self, url: &str) -> Result<Box<dyn InspectorSession>, AttachError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| AttachError::UnexpectedProtocolResponse(url.to_string()))?;
        let host = uri
            .host()
            .ok_or_else(|| AttachError::UnexpectedProtocolResponse(url.to_string()))?;
        let port = uri.port_u16().unwrap_or(80);
        let address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AttachError::UnexpectedProtocolResponse(url.to_string()))?;

        let stream = TcpStream::connect_timeout(&address, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;
        let (socket, _) =
            tungstenite::client(url, stream).map_err(|e| AttachError::WebSocket(e.to_string()))?;

        Ok(Box::new(WebSocketSession { socket, next_id: 1 }))
    }
}

struct WebSocketSession {
    socket: WebSocket<TcpStream>,
    next_id: u64,
}

impl InspectorSession for WebSocketSession {
    fn evaluate(&mut self, expression: &str) -> Result<Value, AttachError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({
            "id": id,
            "method": "Runtime.evaluate",
            "params": {
                "expression": expression,
                "replMode": true,
            },
        });
        self.socket
            .send(Message::text(request.to_string()))
            .map_err(|e| AttachError::WebSocket(e.to_string()))?;

        // Events may be interleaved with our response.
        loop {
            let message = self
                .socket
                .read()
                .map_err(|e| AttachError::WebSocket(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(AttachError::WebSocket("connection closed".to_string()))
                }
                _ => continue,
            };
            let response: Value = serde_json::from_str(&text)
                .map_err(|_| AttachError::UnexpectedProtocolResponse(text.clone()))?;
            if response.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(response);
            }
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        let _ = self.socket.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves every request with the given raw HTTP response, counting them.
    fn http_server(response: &'static str) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&chunk[..read]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (port, requests)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_discovery_gives_up_after_all_attempts() {
        let (port, requests) = http_server(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        let inspector = NodeInspector::new(port);

        let result = discover_debugger_url(&inspector, &fast_retry());

        assert!(matches!(
            result,
            Err(AttachError::DebuggerEndpointNotFound { attempts: 5, .. })
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_discovery() {
        let (port, requests) = http_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: 51\r\nConnection: close\r\n\r\n[{\"webSocketDebuggerUrl\": \"ws://127.0.0.1:1/abcd\"}]",
        );
        let inspector = NodeInspector::new(port);

        let url = discover_debugger_url(&inspector, &fast_retry()).unwrap();

        assert_eq!(url, "ws://127.0.0.1:1/abcd");
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discovery_requires_json() {
        let (port, _) = http_server(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\nConnection: close\r\n\r\n[]",
        );
        assert!(NodeInspector::new(port).discover().is_err());
    }

    /// Answers each `Runtime.evaluate` with an unrelated event first, then the
    /// response built by `reply`.
    fn inspector_server(reply: fn(&str) -> Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else { return };
            let Ok(mut socket) = tungstenite::accept(stream) else { return };
            while let Ok(Message::Text(text)) = socket.read() {
                let request: Value = serde_json::from_str(&text).unwrap();
                let expression = request["params"]["expression"].as_str().unwrap().to_string();
                let mut response = reply(&expression);
                response["id"] = request["id"].clone();
                let event = json!({"method": "Runtime.executionContextCreated"});
                let _ = socket.send(Message::text(event.to_string()));
                let _ = socket.send(Message::text(response.to_string()));
            }
        });
        format!("ws://127.0.0.1:{}/0f2c", port)
    }

    #[test]
    fn test_session_controls_module_and_validates() {
        let url = inspector_server(|expression| {
            if expression.contains("readlinkSync") {
                json!({"result": {"result": {"type": "string", "value": "pid:[4026531836]"}}})
            } else if expression == "process.pid" {
                json!({"result": {"result": {"type": "number", "value": 77}}})
            } else {
                assert!(expression.contains("/tmp/mod/linux-perf.js\").start()"));
                json!({"result": {"result": {"type": "boolean", "value": true}}})
            }
        });

        let mut session = NodeInspector::new(0).connect(&url).unwrap();
        validate_target(session.as_mut(), 77, "pid:[4026531836]").unwrap();
        assert!(matches!(
            validate_target(session.as_mut(), 78, "pid:[4026531836]"),
            Err(AttachError::WrongTargetProcess { .. })
        ));
        control_module(session.as_mut(), "/tmp/mod/", ModuleAction::Start).unwrap();
    }

    #[test]
    fn test_unexpected_module_response() {
        let url = inspector_server(|_| {
            json!({"result": {"result": {"type": "object", "subtype": "error"}}})
        });

        let mut session = NodeInspector::new(0).connect(&url).unwrap();
        assert!(matches!(
            control_module(session.as_mut(), "/tmp/mod", ModuleAction::Stop),
            Err(AttachError::UnexpectedProtocolResponse(_))
        ));
    }
}
