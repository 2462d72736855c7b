//! Store configuration and its builder.
//!
//! Follows the builder shape of `vector_buffers`'s `DiskBufferConfig`/`DiskBufferConfigBuilder`
//! (`disk_v2/common.rs`): options are `Option`s on the builder, defaulted in `.build()`.
//!
//! Parsing these options from a config file or CLI flags is left to the embedding application;
//! this module only provides the in-process builder API below.

use std::path::PathBuf;

use crate::entry::{DeserializeFn, SerializeFn, ValidFn};
use crate::Mode;

/// Default coalescing window applied when the builder is left unconfigured.
pub const DEFAULT_FLUSH_DELAY_MS: i64 = 1000;

/// Text encoding applied to string values on write, via [`TextEncoding::encode`].
///
/// Rust's `String` is always valid UTF-8, so `Utf8` is presently the only variant; it exists so a
/// second encoding has somewhere to live if one is ever needed. The catalog's wire format carries
/// no value-type tag, so on read a `SINGLE_FILE` value always comes back as raw bytes regardless of
/// which encoding produced it — encoding only ever applies going in, never coming back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
}

impl TextEncoding {
    /// Encodes a string value for storage under this encoding.
    pub(crate) fn encode(self, s: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => s.as_bytes().to_vec(),
        }
    }
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding::Utf8
    }
}

#[derive(Clone)]
pub struct StoreConfig {
    pub(crate) dir: PathBuf,
    pub(crate) mode: Mode,
    pub(crate) flush_delay_ms: i64,
    pub(crate) encoding: TextEncoding,
    pub(crate) serialize: Option<SerializeFn>,
    pub(crate) deserialize: Option<DeserializeFn>,
    pub(crate) is_cache_entry_valid: Option<ValidFn>,
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn flush_delay_ms(&self) -> i64 {
        self.flush_delay_ms
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }
}

/// Builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    dir: Option<PathBuf>,
    mode: Mode,
    flush_delay_ms: i64,
    encoding: TextEncoding,
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
    is_cache_entry_valid: Option<ValidFn>,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self {
            dir: None,
            // Inline values in the catalog by default; `MULTI_FILE` is opt-in.
            mode: Mode::SingleFile,
            flush_delay_ms: DEFAULT_FLUSH_DELAY_MS,
            encoding: TextEncoding::default(),
            serialize: None,
            deserialize: None,
            is_cache_entry_valid: None,
        }
    }
}

impl StoreConfigBuilder {
    /// Root directory; defaults to `<cwd>/.cache`.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Coalescing window in ms. A negative value disables flushing entirely; `0` still goes
    /// through a deferred tick rather than flushing synchronously.
    #[must_use]
    pub fn flush_delay_ms(mut self, ms: i64) -> Self {
        self.flush_delay_ms = ms;
        self
    }

    /// If `false`, use `MULTI_FILE` mode (values externalized to sidecar files); otherwise
    /// `SINGLE_FILE` (values inlined in the catalog).
    #[must_use]
    pub fn single_file(mut self, yes: bool) -> Self {
        self.mode = if yes { Mode::SingleFile } else { Mode::MultiFile };
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn serialize(mut self, f: SerializeFn) -> Self {
        self.serialize = Some(f);
        self
    }

    #[must_use]
    pub fn deserialize(mut self, f: DeserializeFn) -> Self {
        self.deserialize = Some(f);
        self
    }

    #[must_use]
    pub fn is_cache_entry_valid(mut self, f: ValidFn) -> Self {
        self.is_cache_entry_valid = Some(f);
        self
    }

    pub fn build(self) -> StoreConfig {
        let dir = self.dir.unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".cache")
        });

        StoreConfig {
            dir,
            mode: self.mode,
            flush_delay_ms: self.flush_delay_ms,
            encoding: self.encoding,
            serialize: self.serialize,
            deserialize: self.deserialize,
            is_cache_entry_valid: self.is_cache_entry_valid,
        }
    }
}
