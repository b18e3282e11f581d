//! Byte-level request/response models.
//!
//! Bodies cross the native boundary as raw bytes. A model parses itself from
//! the request bytes ([`Deserializable`]) and renders itself into response
//! bytes ([`Serializable`]). [`Json`] covers any serde type.

use std::ops::{Deref, DerefMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Model conversion failed.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid request body: {0}")]
    Decode(String),

    #[error("failed to encode response: {0}")]
    Encode(String),
}

/// Parse a request model from raw bytes.
pub trait Deserializable: Sized {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError>;
}

/// Render a response model into raw bytes.
pub trait Serializable {
    fn to_bytes(self) -> Result<Vec<u8>, ModelError>;
}

impl Deserializable for Vec<u8> {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError> {
        Ok(bytes)
    }
}

impl Serializable for Vec<u8> {
    fn to_bytes(self) -> Result<Vec<u8>, ModelError> {
        Ok(self)
    }
}

/// Empty response body.
impl Serializable for () {
    fn to_bytes(self) -> Result<Vec<u8>, ModelError> {
        Ok(Vec::new())
    }
}

/// JSON model backed by serde.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: DeserializeOwned> Deserializable for Json<T> {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError> {
        serde_json::from_slice(&bytes)
            .map(Json)
            .map_err(|e| ModelError::Decode(e.to_string()))
    }
}

impl<T: Serialize> Serializable for Json<T> {
    fn to_bytes(self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(&self.0).map_err(|e| ModelError::Encode(e.to_string()))
    }
}

/// Request body parsed with a custom [`Deserializable`] model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body<T>(pub T);

impl<T> Body<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Body<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
