//! Native invoke requests and the arguments bound from them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSink;
use crate::IpcError;

// ============================================================================
// Native Context
// ============================================================================

/// Identity of the running application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub identifier: String,
    pub version: String,
}

/// Opaque handle to the native application.
#[derive(Debug, Clone)]
pub struct AppHandle {
    info: Arc<AppInfo>,
}

impl AppHandle {
    pub fn new(info: AppInfo) -> Self {
        Self {
            info: Arc::new(info),
        }
    }

    pub fn info(&self) -> &AppInfo {
        &self.info
    }
}

/// Opaque handle to the webview window an invoke came from.
///
/// Windows compare by label.
#[derive(Clone)]
pub struct WebviewWindow {
    label: String,
    channels: Option<Arc<dyn ChannelSink>>,
}

impl WebviewWindow {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channels: None,
        }
    }

    /// A window whose channel messages are delivered through `sink`.
    pub fn with_channel_sink(label: impl Into<String>, sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            label: label.into(),
            channels: Some(sink),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel_sink(&self) -> Option<&Arc<dyn ChannelSink>> {
        self.channels.as_ref()
    }
}

impl fmt::Debug for WebviewWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebviewWindow")
            .field("label", &self.label)
            .field("channels", &self.channels.is_some())
            .finish()
    }
}

impl PartialEq for WebviewWindow {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl Eq for WebviewWindow {}

impl Hash for WebviewWindow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label.hash(state);
    }
}

/// Native values available to an invoke besides its body.
#[derive(Debug, Clone, Default)]
pub struct InvokeContext {
    pub app_handle: Option<AppHandle>,
    pub webview_window: Option<WebviewWindow>,
}

/// Request payload as received from the webview
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeBody {
    /// `ArrayBuffer` / `Uint8Array` request
    Raw(Vec<u8>),
    /// Plain JSON request
    Json(serde_json::Value),
}

// ============================================================================
// Parameter Vocabulary
// ============================================================================

/// Parameters a command handler may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Parameter {
    Body,
    AppHandle,
    WebviewWindow,
}

impl Parameter {
    pub const ALL: [Parameter; 3] = [
        Parameter::Body,
        Parameter::AppHandle,
        Parameter::WebviewWindow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Parameter::Body => "body",
            Parameter::AppHandle => "app_handle",
            Parameter::WebviewWindow => "webview_window",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn bit(self) -> u8 {
        match self {
            Parameter::Body => 1,
            Parameter::AppHandle => 1 << 1,
            Parameter::WebviewWindow => 1 << 2,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of parameters declared by one handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSet(u8);

impl ParameterSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, parameter: Parameter) -> Self {
        self.insert(parameter);
        self
    }

    /// Add `parameter`. Returns `false` if it was already present.
    pub fn insert(&mut self, parameter: Parameter) -> bool {
        let present = self.contains(parameter);
        self.0 |= parameter.bit();
        !present
    }

    pub fn contains(&self, parameter: Parameter) -> bool {
        self.0 & parameter.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Parameter> + '_ {
        Parameter::ALL.into_iter().filter(|p| self.contains(*p))
    }

    /// Build a set from parameter names, rejecting unknown or repeated names.
    pub fn from_names<'a, I>(names: I) -> Result<Self, IpcError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = Self::empty();
        for name in names {
            let parameter = Parameter::from_name(name)
                .ok_or_else(|| IpcError::unknown_parameter(name))?;
            if !set.insert(parameter) {
                return Err(IpcError::duplicate_parameter(name));
            }
        }
        Ok(set)
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, parameter) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(parameter.name())?;
        }
        f.write_str("}")
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// Binding an invoke onto declared parameters failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("expected a raw `ArrayBuffer` or `Uint8Array` request body, got JSON")]
    JsonBody,

    #[error("no app handle is available for this invoke")]
    AppHandleUnavailable,

    #[error("invoke did not come from a webview window")]
    WebviewWindowUnavailable,
}

/// Values bound for the parameters a handler declared.
#[derive(Debug, Default)]
pub struct Arguments {
    body: Option<Vec<u8>>,
    app_handle: Option<AppHandle>,
    webview_window: Option<WebviewWindow>,
}

impl Arguments {
    /// Bind only the declared parameters; undeclared values are dropped.
    pub fn bind(
        parameters: ParameterSet,
        body: InvokeBody,
        context: InvokeContext,
    ) -> Result<Self, BindError> {
        let mut arguments = Self::default();
        if parameters.contains(Parameter::Body) {
            arguments.body = match body {
                InvokeBody::Raw(bytes) => Some(bytes),
                InvokeBody::Json(_) => return Err(BindError::JsonBody),
            };
        }
        if parameters.contains(Parameter::AppHandle) {
            arguments.app_handle = Some(context.app_handle.ok_or(BindError::AppHandleUnavailable)?);
        }
        if parameters.contains(Parameter::WebviewWindow) {
            arguments.webview_window = Some(
                context
                    .webview_window
                    .ok_or(BindError::WebviewWindowUnavailable)?,
            );
        }
        Ok(arguments)
    }

    pub fn take_body(&mut self) -> Option<Vec<u8>> {
        self.body.take()
    }

    pub fn take_app_handle(&mut self) -> Option<AppHandle> {
        self.app_handle.take()
    }

    pub fn take_webview_window(&mut self) -> Option<WebviewWindow> {
        self.webview_window.take()
    }
}

// ============================================================================
// Invoke / Resolver
// ============================================================================

/// Outcome delivered to the native side: response bytes or a rejection message.
pub type InvokeResponse = Result<Vec<u8>, String>;

type Responder = Box<dyn FnOnce(InvokeResponse) + Send>;

fn deliver(responder: &mut Option<Responder>, response: InvokeResponse) {
    if let Some(responder) = responder.take() {
        responder(response);
    }
}

/// One request from the native side.
///
/// Consumed by exactly one of [`bind_to`](Self::bind_to),
/// [`resolve`](Self::resolve) or [`reject`](Self::reject). An invoke dropped
/// without a response is rejected.
pub struct Invoke {
    command: String,
    body: InvokeBody,
    context: InvokeContext,
    responder: Option<Responder>,
}

impl Invoke {
    pub fn new<F>(command: impl Into<String>, body: InvokeBody, context: InvokeContext, responder: F) -> Self
    where
        F: FnOnce(InvokeResponse) + Send + 'static,
    {
        Self {
            command: command.into(),
            body,
            context,
            responder: Some(Box::new(responder)),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn webview_window(&self) -> Option<&WebviewWindow> {
        self.context.webview_window.as_ref()
    }

    /// Bind the declared parameters and hand the response duty to a resolver.
    ///
    /// Returns `None` when binding failed; the invoke has then been rejected.
    pub fn bind_to(mut self, parameters: ParameterSet) -> Option<InvokeResolver> {
        let body = std::mem::replace(&mut self.body, InvokeBody::Raw(Vec::new()));
        let context = std::mem::take(&mut self.context);
        match Arguments::bind(parameters, body, context) {
            Ok(arguments) => Some(InvokeResolver {
                command: std::mem::take(&mut self.command),
                arguments,
                responder: self.responder.take(),
            }),
            Err(err) => {
                tracing::debug!(command = %self.command, error = %err, "Invoke binding failed");
                self.reject(err.to_string());
                None
            }
        }
    }

    pub fn resolve(mut self, body: Vec<u8>) {
        deliver(&mut self.responder, Ok(body));
    }

    pub fn reject(mut self, message: impl Into<String>) {
        deliver(&mut self.responder, Err(message.into()));
    }
}

impl fmt::Debug for Invoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("command", &self.command)
            .field("body", &self.body)
            .field("context", &self.context)
            .finish()
    }
}

impl Drop for Invoke {
    fn drop(&mut self) {
        if self.responder.is_some() {
            let message = format!("invoke `{}` was dropped without a response", self.command);
            deliver(&mut self.responder, Err(message));
        }
    }
}

/// Bound arguments plus the duty to answer the invoke exactly once.
pub struct InvokeResolver {
    command: String,
    arguments: Arguments,
    responder: Option<Responder>,
}

impl InvokeResolver {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn take_arguments(&mut self) -> Arguments {
        std::mem::take(&mut self.arguments)
    }

    pub fn resolve(mut self, body: Vec<u8>) {
        deliver(&mut self.responder, Ok(body));
    }

    pub fn reject(mut self, message: impl Into<String>) {
        deliver(&mut self.responder, Err(message.into()));
    }
}

impl fmt::Debug for InvokeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeResolver")
            .field("command", &self.command)
            .field("arguments", &self.arguments)
            .finish()
    }
}

impl Drop for InvokeResolver {
    fn drop(&mut self) {
        if self.responder.is_some() {
            let message = format!(
                "command `{}` was cancelled before it produced a response",
                self.command
            );
            deliver(&mut self.responder, Err(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(
        command: &str,
        body: InvokeBody,
        context: InvokeContext,
    ) -> (Invoke, Arc<Mutex<Vec<InvokeResponse>>>) {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&responses);
        let invoke = Invoke::new(command, body, context, move |response| {
            sink.lock().unwrap().push(response);
        });
        (invoke, responses)
    }

    fn window_context() -> InvokeContext {
        InvokeContext {
            app_handle: Some(AppHandle::new(AppInfo {
                name: "Demo".to_string(),
                identifier: "com.example.demo".to_string(),
                version: "0.1.0".to_string(),
            })),
            webview_window: Some(WebviewWindow::new("main")),
        }
    }

    #[test]
    fn test_parameter_names() {
        for parameter in Parameter::ALL {
            assert_eq!(Parameter::from_name(parameter.name()), Some(parameter));
        }
        assert_eq!(Parameter::from_name("window"), None);
    }

    #[test]
    fn test_parameter_set_from_names() {
        let set = ParameterSet::from_names(["webview_window", "body"]).unwrap();
        assert!(set.contains(Parameter::Body));
        assert!(set.contains(Parameter::WebviewWindow));
        assert!(!set.contains(Parameter::AppHandle));
        assert_eq!(set.to_string(), "{body, webview_window}");

        let err = ParameterSet::from_names(["body", "request"]).unwrap_err();
        assert!(err.to_string().contains("request"));
        assert!(matches!(err, IpcError::UnknownParameter { .. }));

        let err = ParameterSet::from_names(["body", "body"]).unwrap_err();
        assert!(matches!(err, IpcError::DuplicateParameter { .. }));
    }

    #[test]
    fn test_bind_declared_parameters_only() {
        let parameters = ParameterSet::empty().with(Parameter::Body);
        let mut arguments =
            Arguments::bind(parameters, InvokeBody::Raw(b"abc".to_vec()), window_context()).unwrap();
        assert_eq!(arguments.take_body(), Some(b"abc".to_vec()));
        assert!(arguments.take_app_handle().is_none());
        assert!(arguments.take_webview_window().is_none());
    }

    #[test]
    fn test_bind_rejects_json_body() {
        let parameters = ParameterSet::empty().with(Parameter::Body);
        let err = Arguments::bind(
            parameters,
            InvokeBody::Json(serde_json::json!({"name": "World"})),
            InvokeContext::default(),
        )
        .unwrap_err();
        assert_eq!(err, BindError::JsonBody);

        // JSON bodies are fine when the handler takes no body
        let parameters = ParameterSet::empty().with(Parameter::WebviewWindow);
        assert!(Arguments::bind(parameters, InvokeBody::Json(serde_json::Value::Null), window_context()).is_ok());
    }

    #[test]
    fn test_bind_to_failure_rejects_once() {
        let (invoke, responses) = recording("info", InvokeBody::Raw(Vec::new()), InvokeContext::default());
        let parameters = ParameterSet::empty().with(Parameter::AppHandle);
        assert!(invoke.bind_to(parameters).is_none());

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0],
            Err("no app handle is available for this invoke".to_string())
        );
    }

    #[test]
    fn test_resolver_answers_once() {
        let (invoke, responses) = recording("echo", InvokeBody::Raw(b"hi".to_vec()), window_context());
        let mut resolver = invoke
            .bind_to(ParameterSet::empty().with(Parameter::Body))
            .unwrap();
        assert_eq!(resolver.command(), "echo");
        let body = resolver.take_arguments().take_body().unwrap();
        resolver.resolve(body);

        assert_eq!(*responses.lock().unwrap(), vec![Ok(b"hi".to_vec())]);
    }

    #[test]
    fn test_dropped_resolver_rejects() {
        let (invoke, responses) = recording("slow", InvokeBody::Raw(Vec::new()), InvokeContext::default());
        let resolver = invoke.bind_to(ParameterSet::empty()).unwrap();
        drop(resolver);

        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].as_ref().unwrap_err().contains("cancelled"));
    }

    #[test]
    fn test_dropped_invoke_rejects() {
        let (invoke, responses) = recording("lost", InvokeBody::Raw(Vec::new()), InvokeContext::default());
        drop(invoke);
        let responses = responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].as_ref().unwrap_err().contains("lost"));
    }
}
