//! Command registry.
//!
//! Handlers are async functions whose arguments are drawn from a fixed
//! vocabulary (see [`Parameter`]):
//!
//! | Argument type | Parameter |
//! |---------------|-----------|
//! | `Vec<u8>`, [`Json<T>`], [`Body<T>`] | `body` |
//! | [`AppHandle`] | `app_handle` |
//! | [`WebviewWindow`] | `webview_window` |
//!
//! A handler returns `CommandResult<R>` where `R` is [`Serializable`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ferry_future::Runner;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::handler::InvokeHandler;
use crate::invoke::{
    AppHandle, Arguments, BindError, InvokeBody, InvokeContext, Parameter, ParameterSet,
    WebviewWindow,
};
use crate::model::{Body, Deserializable, Json, Serializable};
use crate::IpcError;

// ============================================================================
// Command Errors
// ============================================================================

/// Error returned by a command handler.
///
/// [`Reject`](Self::Reject) is the expected way to refuse a request: its
/// message reaches the caller verbatim and nothing is logged as a failure.
/// Anything else is an unexpected failure.
pub enum CommandError {
    Reject(String),
    Failed(anyhow::Error),
}

impl CommandError {
    pub fn reject(message: impl Into<String>) -> Self {
        Self::Reject(message.into())
    }

    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed(error.into())
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject(_))
    }
}

impl<E> From<E> for CommandError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::Failed(anyhow::Error::new(error))
    }
}

impl fmt::Debug for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(message) => f.debug_tuple("Reject").field(message).finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(message) => f.write_str(message),
            Self::Failed(error) => fmt::Display::fmt(error, f),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Handler Arguments
// ============================================================================

/// A handler argument drawn from one [`Parameter`].
pub trait FromArguments: Sized + Send + 'static {
    const PARAMETER: Parameter;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self>;
}

fn unbound(parameter: Parameter) -> CommandError {
    CommandError::failed(anyhow::anyhow!("argument `{}` was not bound", parameter.name()))
}

impl FromArguments for Vec<u8> {
    const PARAMETER: Parameter = Parameter::Body;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self> {
        arguments.take_body().ok_or_else(|| unbound(Self::PARAMETER))
    }
}

impl<T: DeserializeOwned + Send + 'static> FromArguments for Json<T> {
    const PARAMETER: Parameter = Parameter::Body;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self> {
        let bytes = arguments.take_body().ok_or_else(|| unbound(Self::PARAMETER))?;
        Json::from_bytes(bytes).map_err(|e| CommandError::reject(e.to_string()))
    }
}

impl<T: Deserializable + Send + 'static> FromArguments for Body<T> {
    const PARAMETER: Parameter = Parameter::Body;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self> {
        let bytes = arguments.take_body().ok_or_else(|| unbound(Self::PARAMETER))?;
        T::from_bytes(bytes)
            .map(Body)
            .map_err(|e| CommandError::reject(e.to_string()))
    }
}

impl FromArguments for AppHandle {
    const PARAMETER: Parameter = Parameter::AppHandle;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self> {
        arguments
            .take_app_handle()
            .ok_or_else(|| unbound(Self::PARAMETER))
    }
}

impl FromArguments for WebviewWindow {
    const PARAMETER: Parameter = Parameter::WebviewWindow;

    fn from_arguments(arguments: &mut Arguments) -> CommandResult<Self> {
        arguments
            .take_webview_window()
            .ok_or_else(|| unbound(Self::PARAMETER))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Future produced by a wrapped handler: response bytes or a command error.
pub type HandlerFuture = BoxFuture<'static, CommandResult<Vec<u8>>>;

/// Byte-level handler stored in the registry.
pub type HandlerFn = Arc<dyn Fn(Arguments) -> HandlerFuture + Send + Sync>;

/// An async function usable as a command handler.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    /// Parameters declared by the function's arguments.
    fn parameters() -> Result<ParameterSet, IpcError>;

    /// Extract the arguments, run the function and encode its response.
    fn call(&self, arguments: Arguments) -> HandlerFuture;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<Func, Fut, Res, $($arg,)*> Handler<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = CommandResult<Res>> + Send + 'static,
            Res: Serializable + 'static,
            $($arg: FromArguments,)*
        {
            fn parameters() -> Result<ParameterSet, IpcError> {
                #[allow(unused_mut)]
                let mut parameters = ParameterSet::empty();
                $(
                    if !parameters.insert($arg::PARAMETER) {
                        return Err(IpcError::duplicate_parameter($arg::PARAMETER.name()));
                    }
                )*
                Ok(parameters)
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, mut arguments: Arguments) -> HandlerFuture {
                let function = self.clone();
                Box::pin(async move {
                    $(let $arg = $arg::from_arguments(&mut arguments)?;)*
                    let response = function($($arg),*).await?;
                    Ok::<_, CommandError>(response.to_bytes()?)
                })
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);

/// A registered command: its declared parameters and byte-level handler.
#[derive(Clone)]
pub struct CommandEntry {
    parameters: ParameterSet,
    handler: HandlerFn,
}

impl CommandEntry {
    pub fn parameters(&self) -> ParameterSet {
        self.parameters
    }

    pub fn call(&self, arguments: Arguments) -> HandlerFuture {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Dispatch could not produce a handler future.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no command handler `{0}` found")]
    NotFound(String),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Name of a fn item handler, `None` for closures.
fn handler_name<H>() -> Option<&'static str> {
    command_name(std::any::type_name::<H>())
}

/// Last path segment of a fn item type name, without generic arguments.
///
/// `app::greet<alloc::string::String>` → `greet`.
fn command_name(path: &str) -> Option<&str> {
    if path.contains("{{closure}}") {
        return None;
    }
    let mut path = path;
    if path.ends_with('>') {
        let mut depth = 0usize;
        let mut open = None;
        for (index, c) in path.char_indices().rev() {
            match c {
                '>' => depth += 1,
                '<' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        open = Some(index);
                        break;
                    }
                }
                _ => {}
            }
        }
        path = &path[..open?];
    }
    let name = path.rsplit("::").next()?;
    let is_ident = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    is_ident.then_some(name)
}

/// Named command handlers.
///
/// Built before the app runs, then frozen into an [`InvokeHandler`].
#[derive(Clone, Default)]
pub struct Commands {
    data: HashMap<String, CommandEntry>,
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a typed handler into a registry entry.
    pub fn wrap<H, Args>(handler: H) -> Result<CommandEntry, IpcError>
    where
        H: Handler<Args>,
    {
        let parameters = H::parameters()?;
        Ok(CommandEntry {
            parameters,
            handler: Arc::new(move |arguments| handler.call(arguments)),
        })
    }

    /// Validate raw parameter names against the vocabulary.
    pub fn parse_parameters<'a, I>(names: I) -> Result<ParameterSet, IpcError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        ParameterSet::from_names(names)
    }

    /// Register `handler` as `name`. Fails if `name` is already registered.
    pub fn command<H, Args>(&mut self, name: impl Into<String>, handler: H) -> Result<&mut Self, IpcError>
    where
        H: Handler<Args>,
    {
        let name = name.into();
        if self.data.contains_key(&name) {
            return Err(IpcError::duplicate_command(name));
        }
        let entry = Self::wrap(handler)?;
        tracing::debug!(command = %name, parameters = %entry.parameters, "Registered command");
        self.data.insert(name, entry);
        Ok(self)
    }

    /// Register a fn item under its own name.
    pub fn register<H, Args>(&mut self, handler: H) -> Result<&mut Self, IpcError>
    where
        H: Handler<Args>,
    {
        let name = handler_name::<H>()
            .ok_or_else(|| IpcError::unnamed_handler(std::any::type_name::<H>()))?;
        self.command(name, handler)
    }

    /// Low-level registration of a byte-level handler. Overwrites any existing
    /// command of the same name and returns it.
    pub fn set_command<F>(&mut self, name: impl Into<String>, parameters: ParameterSet, handler: F) -> Option<CommandEntry>
    where
        F: Fn(Arguments) -> HandlerFuture + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self.data.insert(
            name.clone(),
            CommandEntry {
                parameters,
                handler: Arc::new(handler),
            },
        );
        if previous.is_some() {
            tracing::debug!(command = %name, "Replaced command");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&CommandEntry> {
        self.data.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.data.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up `name`, bind the payload and return the handler's future.
    pub fn dispatch(
        &self,
        name: &str,
        body: InvokeBody,
        context: InvokeContext,
    ) -> Result<HandlerFuture, DispatchError> {
        let entry = self
            .get(name)
            .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;
        let arguments = Arguments::bind(entry.parameters, body, context)?;
        Ok(entry.call(arguments))
    }

    /// Freeze the registry into an invoke handler scheduling on `runner`.
    pub fn generate_handler(self, runner: Runner) -> InvokeHandler {
        InvokeHandler::new(self, runner)
    }
}

impl fmt::Debug for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commands")
            .field("names", &self.names())
            .finish()
    }
}
