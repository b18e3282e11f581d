//! Headless native event loop.
//!
//! Stands in for the GUI thread: requests arrive as JSON lines, responses
//! leave as JSON lines, and the loop thread never blocks on a command.
//!
//! ```text
//! reader thread ──NativeEvent::Request──►┐
//!                                        ├─► native loop ──► InvokeHandler::handle
//! responders  ──NativeEvent::Response──►┤          │
//! channels    ──NativeEvent::Channel───►┘          └──► stdout (JSON lines)
//! ```

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ext_ipc::{
    AppHandle, ChannelId, ChannelSink, Invoke, InvokeBody, InvokeContext, InvokeHandler,
    InvokeResponse, IpcError, WebviewWindow,
};
use serde::{Deserialize, Serialize};

/// One request line.
///
/// `body` is sent as raw bytes; `json` is forwarded as a JSON body.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
    #[serde(default)]
    pub window: Option<String>,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn from_invoke(id: u64, response: InvokeResponse) -> Self {
        match response {
            Ok(bytes) => Self {
                id,
                ok: Some(String::from_utf8_lossy(&bytes).into_owned()),
                error: None,
            },
            Err(message) => Self {
                id,
                ok: None,
                error: Some(message),
            },
        }
    }
}

/// One message pushed by a command over a webview channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: u32,
    pub window: String,
    pub data: String,
}

/// Events processed by the native loop
#[derive(Debug)]
pub enum NativeEvent {
    Request(Request),
    /// A line that is not a valid request
    Malformed { line: usize, error: String },
    Response(Response),
    Channel(ChannelMessage),
    /// Input closed
    Eof,
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub requests: usize,
    pub resolved: usize,
    pub rejected: usize,
    pub malformed: usize,
    pub cancelled: usize,
    pub channel_messages: usize,
}

/// Channel delivery for one window: messages join the loop's event stream.
struct NativeChannels {
    window: String,
    tx: Sender<NativeEvent>,
}

impl ChannelSink for NativeChannels {
    fn send(&self, channel: ChannelId, data: Vec<u8>) -> Result<(), IpcError> {
        let message = ChannelMessage {
            channel: channel.id(),
            window: self.window.clone(),
            data: String::from_utf8_lossy(&data).into_owned(),
        };
        self.tx
            .send(NativeEvent::Channel(message))
            .map_err(|_| IpcError::channel_send(channel.id(), "native loop has stopped"))
    }
}

pub struct NativeLoop {
    handler: InvokeHandler,
    app: AppHandle,
    drain_timeout: Duration,
    tx: Sender<NativeEvent>,
    rx: Receiver<NativeEvent>,
}

impl NativeLoop {
    pub fn new(handler: InvokeHandler, app: AppHandle, drain_timeout: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            handler,
            app,
            drain_timeout,
            tx,
            rx,
        }
    }

    /// Spawn a thread that turns input lines into events.
    ///
    /// Lines are read as raw bytes; a line that is not a valid request is
    /// reported as [`NativeEvent::Malformed`] and reading continues.
    pub fn spawn_reader<R>(&self, mut reader: R) -> Result<JoinHandle<()>>
    where
        R: BufRead + Send + 'static,
    {
        let tx = self.tx.clone();
        thread::Builder::new()
            .name("ferry-stdin".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                let mut line = 0usize;
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to read input");
                            break;
                        }
                    }
                    line += 1;
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event = match serde_json::from_slice::<Request>(&buf) {
                        Ok(request) => NativeEvent::Request(request),
                        Err(e) => NativeEvent::Malformed {
                            line,
                            error: e.to_string(),
                        },
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                let _ = tx.send(NativeEvent::Eof);
            })
            .context("spawning input reader")
    }

    /// Run until input is closed and every request has been answered.
    pub fn run<W: Write>(self, out: &mut W) -> Result<LoopStats> {
        let mut stats = LoopStats::default();
        let mut pending = 0usize;
        let mut draining = false;
        let mut deadline: Option<Instant> = None;

        loop {
            if draining && pending == 0 {
                break;
            }

            let event = match deadline {
                None => self.rx.recv().context("native event channel closed")?,
                Some(at) => match self.rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        let cancelled = self.handler.cancel_all();
                        tracing::warn!(
                            pending,
                            cancelled,
                            "Drain timeout reached, cancelling outstanding commands"
                        );
                        stats.cancelled += cancelled;
                        // Cancelled commands still answer.
                        deadline = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        anyhow::bail!("native event channel closed")
                    }
                },
            };

            match event {
                NativeEvent::Request(request) => {
                    stats.requests += 1;
                    pending += 1;
                    self.dispatch(request);
                }
                NativeEvent::Malformed { line, error } => {
                    stats.malformed += 1;
                    tracing::warn!(line, error = %error, "Malformed request");
                    write_line(
                        out,
                        &Response {
                            id: 0,
                            ok: None,
                            error: Some(format!("malformed request on line {line}: {error}")),
                        },
                    )?;
                }
                NativeEvent::Response(response) => {
                    pending = pending.saturating_sub(1);
                    if response.error.is_some() {
                        stats.rejected += 1;
                    } else {
                        stats.resolved += 1;
                    }
                    write_line(out, &response)?;
                }
                NativeEvent::Channel(message) => {
                    stats.channel_messages += 1;
                    write_line(out, &message)?;
                }
                NativeEvent::Eof => {
                    tracing::debug!(pending, "Input closed");
                    draining = true;
                    deadline = Some(Instant::now() + self.drain_timeout);
                }
            }
        }

        Ok(stats)
    }

    fn dispatch(&self, request: Request) {
        let Request {
            id,
            command,
            body,
            json,
            window,
        } = request;

        let body = match json {
            Some(value) => InvokeBody::Json(value),
            None => InvokeBody::Raw(body.unwrap_or_default().into_bytes()),
        };
        let context = InvokeContext {
            app_handle: Some(self.app.clone()),
            webview_window: window.map(|label| {
                let channels = NativeChannels {
                    window: label.clone(),
                    tx: self.tx.clone(),
                };
                WebviewWindow::with_channel_sink(label, Arc::new(channels))
            }),
        };
        let tx = self.tx.clone();

        tracing::debug!(id, command = %command, "Dispatching request");
        self.handler.handle(Invoke::new(command, body, context, move |response| {
            let _ = tx.send(NativeEvent::Response(Response::from_invoke(id, response)));
        }));
    }
}

fn write_line<W: Write, T: Serialize>(out: &mut W, line: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, line).context("encoding response")?;
    out.write_all(b"\n").context("writing response")?;
    out.flush().context("flushing response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Capabilities, Permissions};
    use ext_ipc::{AppInfo, Commands};
    use ferry_future::{Worker, WorkerConfig};
    use std::io::Cursor;
    use std::sync::Arc;

    fn app() -> AppHandle {
        AppHandle::new(AppInfo {
            name: "Ferry Demo".to_string(),
            identifier: "com.example.ferry-demo".to_string(),
            version: "0.1.0".to_string(),
        })
    }

    fn run_lines(input: &str, handler: InvokeHandler, drain: Duration) -> (LoopStats, Vec<Response>) {
        let (stats, responses, _) = run_with_channels(input, handler, drain);
        (stats, responses)
    }

    /// Run the loop and split its output into responses (sorted by id) and
    /// channel messages (in output order).
    fn run_with_channels(
        input: &str,
        handler: InvokeHandler,
        drain: Duration,
    ) -> (LoopStats, Vec<Response>, Vec<ChannelMessage>) {
        let native = NativeLoop::new(handler, app(), drain);
        native
            .spawn_reader(Cursor::new(input.to_string().into_bytes()))
            .unwrap();
        let mut out = Vec::new();
        let stats = native.run(&mut out).unwrap();

        let mut responses = Vec::new();
        let mut messages = Vec::new();
        for line in String::from_utf8(out).unwrap().lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            if value.get("channel").is_some() {
                messages.push(serde_json::from_value(value).unwrap());
            } else {
                responses.push(serde_json::from_value::<Response>(value).unwrap());
            }
        }
        responses.sort_by_key(|r| r.id);
        (stats, responses, messages)
    }

    fn handler(worker: &Worker) -> InvokeHandler {
        let mut commands = Commands::new();
        crate::commands::register(&mut commands).unwrap();
        commands.generate_handler(worker.runner().clone())
    }

    #[test]
    fn test_requests_round_trip() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let input = concat!(
            r#"{"id":1,"command":"greet","body":"{\"name\":\"World\"}"}"#,
            "\n",
            r#"{"id":2,"command":"window_label","window":"main"}"#,
            "\n",
            r#"{"id":3,"command":"nope"}"#,
            "\n",
            r#"{"id":4,"command":"greet","json":{"name":"World"}}"#,
            "\n",
        );
        let (stats, responses) = run_lines(input, handler(&worker), Duration::from_secs(5));

        assert_eq!(stats.requests, 4);
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.rejected, 2);
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0].ok.as_deref(), Some(r#"{"message":"Hello, World!"}"#));
        assert_eq!(responses[1].ok.as_deref(), Some("main"));
        assert_eq!(
            responses[2].error.as_deref(),
            Some("no command handler `nope` found")
        );
        assert!(responses[3].error.as_deref().unwrap().contains("JSON"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_malformed_line() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let (stats, responses) = run_lines("not json\n", handler(&worker), Duration::from_secs(1));
        assert_eq!(stats.malformed, 1);
        assert_eq!(responses[0].id, 0);
        assert!(responses[0].error.as_deref().unwrap().contains("line 1"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_utf8_line_does_not_stop_reader() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let mut input = b"\xff\n".to_vec();
        input.extend_from_slice(b"{\"id\":2,\"command\":\"echo\",\"body\":\"after\"}\n");

        let native = NativeLoop::new(handler(&worker), app(), Duration::from_secs(5));
        native.spawn_reader(Cursor::new(input)).unwrap();
        let mut out = Vec::new();
        let stats = native.run(&mut out).unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.resolved, 1);
        let responses: Vec<Response> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, 0);
        assert!(responses[0].error.as_deref().unwrap().contains("line 1"));
        assert_eq!(responses[1].id, 2);
        assert_eq!(responses[1].ok.as_deref(), Some("after"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_channel_messages_reach_output() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let input = concat!(
            r#"{"id":1,"command":"progress","body":"{\"channel\":\"__CHANNEL__:9\",\"steps\":3}","window":"main"}"#,
            "\n",
            r#"{"id":2,"command":"progress","body":"{\"channel\":\"__CHANNEL__:9\",\"steps\":1}"}"#,
            "\n",
        );
        let (stats, responses, messages) =
            run_with_channels(input, handler(&worker), Duration::from_secs(5));

        assert_eq!(stats.channel_messages, 3);
        let steps: Vec<&str> = messages.iter().map(|m| m.data.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                r#"{"step":1,"total":3}"#,
                r#"{"step":2,"total":3}"#,
                r#"{"step":3,"total":3}"#
            ]
        );
        assert!(messages.iter().all(|m| m.channel == 9 && m.window == "main"));
        assert_eq!(responses[0].ok.as_deref(), Some(r#"{"sent":3}"#));
        // Channels need the invoking window.
        assert!(responses[1].error.as_deref().unwrap().contains("webview window"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_drain_timeout_cancels() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let input = concat!(
            r#"{"id":1,"command":"sleep","body":"{\"millis\":30000}"}"#,
            "\n",
            r#"{"id":2,"command":"echo","body":"fast"}"#,
            "\n",
        );
        let (stats, responses) = run_lines(input, handler(&worker), Duration::from_millis(200));

        assert_eq!(stats.cancelled, 1);
        assert_eq!(responses[0].id, 1);
        assert!(responses[0].error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(responses[1].ok.as_deref(), Some("fast"));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_capabilities_enforced() {
        let worker = Worker::spawn(WorkerConfig::default()).unwrap();
        let permissions: Permissions = toml::from_str("[ipc]\ndeny = [\"echo\"]\n").unwrap();
        let caps = Capabilities::from_permissions(Some(&permissions), false).unwrap();
        let handler = handler(&worker).with_checker(Arc::new(caps));

        let (_, responses) = run_lines(
            "{\"id\":7,\"command\":\"echo\",\"body\":\"hi\"}\n",
            handler,
            Duration::from_secs(1),
        );
        let error = responses[0].error.as_deref().unwrap();
        assert!(error.contains("7004"));
        assert!(error.contains("Permission denied: ipc for echo"));
        worker.shutdown().unwrap();
    }
}
