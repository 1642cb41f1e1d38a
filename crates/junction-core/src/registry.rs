//! Codecs for application message parts.
//!
//! The wire codec only knows the built-in part variants. Application parts
//! are turned into bytes and back by a [`PartCodec`] looked up by type id.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};
use crate::part::{AppPart, FIRST_APPLICATION_TYPE_ID};

pub trait PartCodec: Send + Sync {
    fn encode(&self, value: &(dyn Any + Send + Sync)) -> anyhow::Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Any + Send + Sync>>;
}

/// serde_json codec for any `Serialize + DeserializeOwned` type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PartCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &(dyn Any + Send + Sync)) -> anyhow::Result<Bytes> {
        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow::anyhow!("value is not a {}", std::any::type_name::<T>()))?;
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        let value: T = serde_json::from_slice(bytes)?;
        Ok(Arc::new(value))
    }
}

/// Type id → codec table. Clones share the table.
#[derive(Clone, Default)]
pub struct SerializationRegistry {
    codecs: Arc<DashMap<u32, Arc<dyn PartCodec>>>,
}

impl SerializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` for `type_id`, replacing any previous codec.
    ///
    /// Ids below [`FIRST_APPLICATION_TYPE_ID`] belong to built-in parts.
    pub fn register(&self, type_id: u32, codec: impl PartCodec + 'static) -> Result<()> {
        if type_id < FIRST_APPLICATION_TYPE_ID {
            return Err(TransportError::fault(anyhow::anyhow!(
                "part type id {type_id} is reserved"
            )));
        }
        if self.codecs.insert(type_id, Arc::new(codec)).is_some() {
            tracing::debug!(type_id, "replaced part codec");
        }
        Ok(())
    }

    pub fn register_json<T>(&self, type_id: u32) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(type_id, JsonCodec::<T>::new())
    }

    pub fn unregister(&self, type_id: u32) -> bool {
        self.codecs.remove(&type_id).is_some()
    }

    pub fn contains(&self, type_id: u32) -> bool {
        self.codecs.contains_key(&type_id)
    }

    fn codec(&self, type_id: u32) -> Result<Arc<dyn PartCodec>> {
        self.codecs
            .get(&type_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(TransportError::UnknownPartType(type_id))
    }

    pub fn encode(&self, part: &AppPart) -> Result<Bytes> {
        let type_id = part.type_id();
        self.codec(type_id)?
            .encode(part.value())
            .map_err(|source| TransportError::Codec { type_id, source })
    }

    pub fn decode(&self, type_id: u32, bytes: &[u8]) -> Result<AppPart> {
        let value = self
            .codec(type_id)?
            .decode(bytes)
            .map_err(|source| TransportError::Codec { type_id, source })?;
        Ok(AppPart::from_arc(type_id, value, bytes.len()))
    }
}
