//! Built-in demo commands.

use std::time::Duration;

use ext_ipc::{
    AppHandle, AppInfo, ChannelId, CommandError, CommandResult, Commands, IpcError, Json,
    WebviewWindow,
};
use serde::{Deserialize, Serialize};

/// Longest sleep the `sleep` command accepts
const MAX_SLEEP_MS: u64 = 60_000;

/// Most progress updates one `progress` call may stream
const MAX_PROGRESS_STEPS: u32 = 1_000;

#[derive(Debug, Deserialize)]
pub struct Person {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Greeting {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SleepRequest {
    pub millis: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SleepResponse {
    pub slept_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub channel: ChannelId,
    pub steps: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressDone {
    pub sent: u32,
}

pub async fn greet(Json(person): Json<Person>) -> CommandResult<Json<Greeting>> {
    if person.name.trim().is_empty() {
        return Err(CommandError::reject("name must not be empty"));
    }
    Ok(Json(Greeting {
        message: format!("Hello, {}!", person.name),
    }))
}

pub async fn echo(body: Vec<u8>) -> CommandResult<Vec<u8>> {
    Ok(body)
}

pub async fn app_info(app: AppHandle) -> CommandResult<Json<AppInfo>> {
    Ok(Json(app.info().clone()))
}

pub async fn window_label(window: WebviewWindow) -> CommandResult<Vec<u8>> {
    Ok(window.label().as_bytes().to_vec())
}

pub async fn sleep(Json(request): Json<SleepRequest>) -> CommandResult<Json<SleepResponse>> {
    if request.millis > MAX_SLEEP_MS {
        return Err(CommandError::reject(format!(
            "millis must be at most {MAX_SLEEP_MS}"
        )));
    }
    tokio::time::sleep(Duration::from_millis(request.millis)).await;
    Ok(Json(SleepResponse {
        slept_ms: request.millis,
    }))
}

/// Stream `steps` progress updates over the caller's channel, then answer.
pub async fn progress(
    Json(request): Json<ProgressRequest>,
    window: WebviewWindow,
) -> CommandResult<Json<ProgressDone>> {
    if request.steps > MAX_PROGRESS_STEPS {
        return Err(CommandError::reject(format!(
            "steps must be at most {MAX_PROGRESS_STEPS}"
        )));
    }
    let channel = request
        .channel
        .channel_on(&window)
        .map_err(|e| CommandError::reject(e.to_string()))?;
    for step in 1..=request.steps {
        channel.send_model(Json(Progress {
            step,
            total: request.steps,
        }))?;
        tokio::task::yield_now().await;
    }
    Ok(Json(ProgressDone {
        sent: request.steps,
    }))
}

/// Register every built-in command.
pub fn register(commands: &mut Commands) -> Result<(), IpcError> {
    commands
        .register(greet)?
        .register(echo)?
        .register(app_info)?
        .register(window_label)?
        .register(sleep)?
        .register(progress)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_ipc::{InvokeBody, InvokeContext};

    fn registry() -> Commands {
        let mut commands = Commands::new();
        register(&mut commands).unwrap();
        commands
    }

    fn context() -> InvokeContext {
        InvokeContext {
            app_handle: Some(AppHandle::new(AppInfo {
                name: "Ferry Demo".to_string(),
                identifier: "com.example.ferry-demo".to_string(),
                version: "0.1.0".to_string(),
            })),
            webview_window: Some(WebviewWindow::new("main")),
        }
    }

    async fn call(name: &str, body: &[u8]) -> CommandResult<Vec<u8>> {
        registry()
            .dispatch(name, InvokeBody::Raw(body.to_vec()), context())
            .unwrap()
            .await
    }

    #[test]
    fn test_register_all() {
        assert_eq!(
            registry().names(),
            vec!["app_info", "echo", "greet", "progress", "sleep", "window_label"]
        );
    }

    #[test]
    fn test_register_twice_fails() {
        let mut commands = registry();
        let err = register(&mut commands).unwrap_err();
        assert!(matches!(err, IpcError::DuplicateCommand { .. }));
    }

    #[tokio::test]
    async fn test_greet() {
        let bytes = call("greet", br#"{"name":"World"}"#).await.unwrap();
        let greeting: Greeting = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(greeting.message, "Hello, World!");
    }

    #[tokio::test]
    async fn test_greet_rejects_blank_name() {
        let err = call("greet", br#"{"name":"  "}"#).await.unwrap_err();
        assert!(err.is_reject());
        assert_eq!(err.to_string(), "name must not be empty");
    }

    #[tokio::test]
    async fn test_context_commands() {
        let info: AppInfo = serde_json::from_slice(&call("app_info", b"").await.unwrap()).unwrap();
        assert_eq!(info.name, "Ferry Demo");
        assert_eq!(call("window_label", b"").await.unwrap(), b"main");
        assert_eq!(call("echo", b"\x00\x01raw").await.unwrap(), b"\x00\x01raw");
    }

    #[tokio::test]
    async fn test_progress_streams_over_channel() {
        #[derive(Default)]
        struct Recorder(std::sync::Mutex<Vec<Vec<u8>>>);

        impl ext_ipc::ChannelSink for Recorder {
            fn send(&self, _channel: ChannelId, data: Vec<u8>) -> Result<(), IpcError> {
                self.0.lock().unwrap().push(data);
                Ok(())
            }
        }

        let recorder = std::sync::Arc::new(Recorder::default());
        let mut context = context();
        context.webview_window = Some(WebviewWindow::with_channel_sink("main", recorder.clone()));
        let bytes = registry()
            .dispatch(
                "progress",
                InvokeBody::Raw(br#"{"channel":"__CHANNEL__:1","steps":2}"#.to_vec()),
                context,
            )
            .unwrap()
            .await
            .unwrap();

        let done: ProgressDone = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(done, ProgressDone { sent: 2 });
        let sent = recorder.0.lock().unwrap();
        let updates: Vec<Progress> = sent
            .iter()
            .map(|data| serde_json::from_slice(data).unwrap())
            .collect();
        assert_eq!(
            updates,
            vec![Progress { step: 1, total: 2 }, Progress { step: 2, total: 2 }]
        );
    }

    #[tokio::test]
    async fn test_progress_rejects_bad_channel() {
        // The test window has no channel delivery.
        let err = call("progress", br#"{"channel":"__CHANNEL__:1","steps":2}"#)
            .await
            .unwrap_err();
        assert!(err.is_reject());
        assert!(err.to_string().contains("7006"));

        let err = call("progress", br#"{"channel":"7","steps":2}"#)
            .await
            .unwrap_err();
        assert!(err.is_reject());
        assert!(err.to_string().contains("invalid request body"));
    }

    #[tokio::test]
    async fn test_sleep_limits() {
        let bytes = call("sleep", br#"{"millis":1}"#).await.unwrap();
        let response: SleepResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response, SleepResponse { slept_ms: 1 });

        let err = call("sleep", br#"{"millis":600000}"#).await.unwrap_err();
        assert!(err.is_reject());
    }
}
