//! Sidecar Manager: owns the on-disk half of `MULTI_FILE` mode.
//!
//! Only relevant in `MULTI_FILE` mode: allocates a fresh path per entry value, streams the value
//! out to it, and deletes it on removal. The transient per-write completion signal lives in
//! `in_flight` here, keyed by cache key, rather than on the `CacheEntry` itself.
//!
//! Publishing (stamping `meta.file` onto the live entry once the write completes) is the caller's
//! job, since only [`crate::store`] has access to the live/pending maps; this module only owns the
//! bytes-on-disk half of the contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::config::TextEncoding;
use crate::entry::{EntryValue, ReaderFactory, SerializeFn};
use crate::error::StoreError;
use crate::signal::FallibleSignal;

/// An allocation that hasn't been published to `meta.file` yet: the path it's writing to, plus
/// the signal that resolves once the write lands.
struct InFlightWrite {
    rel: String,
    signal: FallibleSignal,
}

pub(crate) struct SidecarManager {
    dir: PathBuf,
    in_flight: Mutex<HashMap<String, InFlightWrite>>,
}

impl SidecarManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generates a fresh, two-level fan-out relative path: `<first 2 hex chars>/<remaining hex>`.
    /// Collisions are astronomically unlikely (128 bits of randomness); no retry is attempted.
    pub fn allocate_rel_path() -> String {
        let hex = Uuid::new_v4().simple().to_string();
        let (head, tail) = hex.split_at(2);
        format!("{head}/{tail}")
    }

    pub fn has_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn in_flight_signal(&self, key: &str) -> Option<FallibleSignal> {
        self.in_flight.lock().get(key).map(|w| w.signal.clone())
    }

    /// The path a still-in-flight write is headed for, so a concurrent delete can unlink it even
    /// before it's published to `meta.file`.
    pub fn in_flight_rel(&self, key: &str) -> Option<String> {
        self.in_flight.lock().get(key).map(|w| w.rel.clone())
    }

    pub fn insert_in_flight(&self, key: String, rel: String, signal: FallibleSignal) {
        self.in_flight.lock().insert(key, InFlightWrite { rel, signal });
    }

    pub fn clear_in_flight(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }

    /// Builds a reader factory over an on-disk sidecar file. If `wait_on` is set, the stream first
    /// waits for that write's completion signal before opening the file, covering the window where
    /// a caller obtains a reader for an entry whose externalization is still in progress.
    pub fn open_reader_factory(abs_path: PathBuf, wait_on: Option<FallibleSignal>) -> ReaderFactory {
        Arc::new(move || {
            let abs_path = abs_path.clone();
            let wait_on = wait_on.clone();
            Box::pin(async_stream::try_stream! {
                if let Some(signal) = wait_on {
                    signal
                        .await
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                }
                let mut file = tokio::fs::File::open(&abs_path).await?;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    yield Bytes::copy_from_slice(&buf[..n]);
                }
            })
        })
    }

    /// Removes `key`'s sidecar file, waiting out any in-flight write first. Runs in the background
    /// so callers (namely `Store::remove`) never block on it. `rel_hint` is the already-published
    /// `meta.file` path, if any; when a write is still in flight and nothing has been published
    /// yet, the path recorded at allocation time in the in-flight table is used instead, so the
    /// delete still finds the file once the write completes. Unlink failures are swallowed; an
    /// orphaned sidecar file on disk is tolerated rather than treated as fatal.
    pub fn schedule_delete(self: &Arc<Self>, key: String, rel_hint: Option<String>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let signal = manager.in_flight_signal(&key);
            let rel = rel_hint.or_else(|| manager.in_flight_rel(&key));
            if let Some(signal) = signal {
                let _ = signal.await;
            }
            if let Some(rel) = rel {
                let abs = manager.dir.join(rel);
                let _ = tokio::fs::remove_file(&abs).await;
            }
            manager.clear_in_flight(&key);
        });
    }
}

/// Streams `value`/`reader` out to `abs_path`, creating parent directories as needed.
///
/// Bytes are written directly, strings are encoded per `encoding`, objects go through `serialize`,
/// and a bare reader is drained fully into memory before being written out in one shot — the same
/// buffering the Flusher does for inline values.
pub(crate) async fn write_value_to_path(
    abs_path: &Path,
    value: Option<EntryValue>,
    reader: Option<ReaderFactory>,
    serialize: Option<SerializeFn>,
    encoding: TextEncoding,
    key: &str,
) -> Result<(), StoreError> {
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(abs_path).await?;

    match (value, reader) {
        (Some(EntryValue::Bytes(b)), _) => file.write_all(&b).await?,
        (Some(EntryValue::Text(s)), _) => file.write_all(&encoding.encode(&s)).await?,
        (Some(EntryValue::Object(obj)), _) => {
            let f = serialize.ok_or_else(|| StoreError::MissingSerializer {
                key: key.to_owned(),
            })?;
            let bytes = f(&obj)?;
            file.write_all(&bytes).await?;
        }
        (None, Some(make_stream)) => {
            let mut stream = make_stream();
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| StoreError::ReaderFailed {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;
                buf.extend_from_slice(&chunk);
            }
            file.write_all(&buf).await?;
        }
        (None, None) => {
            return Err(StoreError::IllegalState {
                key: key.to_owned(),
            })
        }
    }

    file.flush().await?;
    Ok(())
}
