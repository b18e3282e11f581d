//! Streaming responses over webview channels.
//!
//! A command receives a [`ChannelId`] from the webview (as its whole body or
//! as a field of a JSON model), opens it on the invoking window with
//! [`ChannelId::channel_on`], and pushes any number of messages back while or
//! after it runs. Delivery is up to the window's [`ChannelSink`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::invoke::WebviewWindow;
use crate::model::{Deserializable, ModelError, Serializable};
use crate::IpcError;

/// Prefix of serialized channel ids, e.g. `__CHANNEL__:42`.
pub const CHANNEL_PREFIX: &str = "__CHANNEL__:";

/// Delivers channel messages to the native side of one window.
pub trait ChannelSink: Send + Sync {
    fn send(&self, channel: ChannelId, data: Vec<u8>) -> Result<(), IpcError>;
}

/// Identifier of a webview-side channel callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// Open this channel on `window`.
    pub fn channel_on(self, window: &WebviewWindow) -> Result<Channel, IpcError> {
        let sink = window
            .channel_sink()
            .ok_or_else(|| IpcError::channel_unavailable(window.label()))?;
        Ok(Channel {
            id: self,
            sink: Arc::clone(sink),
        })
    }
}

impl FromStr for ChannelId {
    type Err = IpcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .strip_prefix(CHANNEL_PREFIX)
            .and_then(|id| id.parse::<u32>().ok())
            .map(ChannelId)
            .ok_or_else(|| IpcError::invalid_channel_id(value))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CHANNEL_PREFIX}{}", self.0)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// A channel id sent as the whole request body (a JSON string).
impl Deserializable for ChannelId {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError> {
        serde_json::from_slice(&bytes).map_err(|e| ModelError::Decode(e.to_string()))
    }
}

/// Sending half of a webview channel.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    sink: Arc<dyn ChannelSink>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.id.id()
    }

    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), IpcError> {
        self.sink.send(self.id, data.into())
    }

    /// Serialize `model` and send it.
    pub fn send_model<M: Serializable>(&self, model: M) -> Result<(), IpcError> {
        let data = model
            .to_bytes()
            .map_err(|e| IpcError::channel_send(self.id(), e.to_string()))?;
        self.send(data)
    }
}
