//! The `CacheEntry` record.
//!
//! `CacheEntry` is mostly opaque: a carrier for a key, a JSON `meta` map, and exactly one of an
//! in-memory value or a lazy reader factory. The transient per-entry sidecar-write completion
//! signal is deliberately *not* a field here — it lives in [`crate::sidecar::SidecarManager`]'s
//! side table, keyed by entry identity (the cache key), so completion tracking never requires
//! mutating the entry itself.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde_json::{Map, Value as JsonValue};

use crate::error::StoreError;

pub const META_FILE_KEY: &str = "file";

/// Tri-state carried alongside an entry for consumers; the core preserves but never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deserialized {
    NotApplicable,
    Pending,
    Done,
}

/// A boxed byte stream; callers supply a factory rather than a single exhaustible stream so a
/// value can be read back more than once.
pub type ValueStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Zero-argument factory yielding a fresh [`ValueStream`] on each call.
pub type ReaderFactory = Arc<dyn Fn() -> ValueStream + Send + Sync>;

/// An opaque, user-supplied non-bytes value. Serialized via [`SerializeFn`] when written out.
pub type DynValue = Arc<dyn Any + Send + Sync>;

pub type SerializeFn = Arc<dyn Fn(&DynValue) -> Result<Bytes, StoreError> + Send + Sync>;
pub type DeserializeFn = Arc<dyn Fn(Bytes) -> Result<DynValue, StoreError> + Send + Sync>;
pub type ValidFn = Arc<dyn Fn(&CacheEntry) -> bool + Send + Sync>;

/// The materialized value a caller hands to `put`, before normalization into a [`CacheEntry`].
#[derive(Clone)]
pub enum PutValue {
    Bytes(Bytes),
    Text(String),
    Object(DynValue),
    Reader(ReaderFactory),
}

impl From<Bytes> for PutValue {
    fn from(b: Bytes) -> Self {
        PutValue::Bytes(b)
    }
}

impl From<Vec<u8>> for PutValue {
    fn from(b: Vec<u8>) -> Self {
        PutValue::Bytes(Bytes::from(b))
    }
}

impl From<String> for PutValue {
    fn from(s: String) -> Self {
        PutValue::Text(s)
    }
}

impl From<&str> for PutValue {
    fn from(s: &str) -> Self {
        PutValue::Text(s.to_owned())
    }
}

/// Exactly one of `value` or `reader` must be materially available at any time the entry is
/// written out.
#[derive(Clone)]
pub enum EntryValue {
    Bytes(Bytes),
    Text(String),
    Object(DynValue),
}

#[derive(Clone)]
pub struct CacheEntry {
    pub key: String,
    pub meta: Map<String, JsonValue>,
    pub value: Option<EntryValue>,
    pub reader: Option<ReaderFactory>,
    pub deserialized: Deserialized,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("meta", &self.meta)
            .field("has_value", &self.value.is_some())
            .field("has_reader", &self.reader.is_some())
            .field("deserialized", &self.deserialized)
            .finish()
    }
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<PutValue>) -> Self {
        let key = key.into();
        match value.into() {
            PutValue::Bytes(b) => Self {
                key,
                meta: Map::new(),
                value: Some(EntryValue::Bytes(b)),
                reader: None,
                deserialized: Deserialized::NotApplicable,
            },
            PutValue::Text(s) => Self {
                key,
                meta: Map::new(),
                value: Some(EntryValue::Text(s)),
                reader: None,
                deserialized: Deserialized::NotApplicable,
            },
            PutValue::Object(o) => Self {
                key,
                meta: Map::new(),
                value: Some(EntryValue::Object(o)),
                reader: None,
                deserialized: Deserialized::NotApplicable,
            },
            PutValue::Reader(r) => Self {
                key,
                meta: Map::new(),
                value: None,
                reader: Some(r),
                deserialized: Deserialized::NotApplicable,
            },
        }
    }

    pub fn meta_file(&self) -> Option<&str> {
        self.meta.get(META_FILE_KEY).and_then(JsonValue::as_str)
    }

    pub fn set_meta_file(&mut self, rel: impl Into<String>) {
        self.meta
            .insert(META_FILE_KEY.to_owned(), JsonValue::String(rel.into()));
    }

    /// Looks up an arbitrary `meta` field by name.
    pub fn meta_get(&self, key: &str) -> Option<&JsonValue> {
        self.meta.get(key)
    }

    /// Sets an arbitrary `meta` field, returning the value it replaced, if any.
    pub fn meta_set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.meta.insert(key.into(), value.into())
    }

    pub(crate) fn meta_to_json_bytes(&self) -> Option<Vec<u8>> {
        if self.meta.is_empty() {
            None
        } else {
            serde_json::to_vec(&self.meta).ok()
        }
    }
}
