//! The Flusher: deferred/coalesced scheduling plus the actual catalog write-and-swap.
//!
//! Scheduling is a generation counter rather than a cancellable timer: each call to
//! `schedule_flush` bumps `StoreState::flush_generation` and spawns a task that sleeps, then only
//! proceeds if the generation it captured is still current. A newer mutation (or an explicit
//! `flush()`) bumping the counter again is enough to make an older timer a no-op when it wakes —
//! no handle to cancel, nothing to race against dropping.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::codec::{encode_header, write_record, PROTOCOL_VERSION};
use crate::config::TextEncoding;
use crate::entry::{CacheEntry, EntryValue, SerializeFn};
use crate::error::StoreError;
use crate::store::{StoreInner, StoreState};
use crate::Mode;

/// Arms (or coalesces into) a deferred flush. Called with `state`'s lock already held by the
/// caller, so it never awaits anything itself — the actual delay and flush happen in a spawned
/// task.
pub(crate) fn schedule_flush(inner: &Arc<StoreInner>, state: &mut StoreState) {
    if inner.config.flush_delay_ms < 0 {
        return;
    }
    if state.flush_signal.is_some() {
        // A flush is already running; let `finish_flush` pick this up once it's done instead of
        // racing a second writer against the one in flight.
        state.write_after_flush = true;
        return;
    }

    state.flush_generation = state.flush_generation.wrapping_add(1);
    let generation = state.flush_generation;
    let delay_ms = inner.config.flush_delay_ms.max(0) as u64;
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        } else {
            tokio::task::yield_now().await;
        }
        fire_scheduled_flush(inner, generation).await;
    });
}

async fn fire_scheduled_flush(inner: Arc<StoreInner>, generation: u64) {
    {
        let state = inner.state.lock().await;
        if state.flush_generation != generation {
            return;
        }
    }
    let _ = inner.flush().await;
}

/// Snapshots the live map's keys, serializes each still-present one into a fresh catalog, and
/// swaps it in. Runs on its own spawned task, never inline under `StoreState`'s lock.
pub(crate) async fn perform_flush(inner: Arc<StoreInner>) -> Result<(), StoreError> {
    let keys: Vec<String> = {
        let state = inner.state.lock().await;
        state
            .cache
            .as_ref()
            .expect("perform_flush only runs once the catalog has loaded")
            .keys()
            .cloned()
            .collect()
    };

    let tmp_path = write_catalog(&inner, keys).await?;
    match commit_catalog(&inner, &tmp_path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Err(e)
        }
    }
}

/// Builds the whole catalog body in memory before touching disk; the catalog is assumed to fit in
/// memory the same way the live map it's built from does.
async fn write_catalog(inner: &Arc<StoreInner>, keys: Vec<String>) -> Result<PathBuf, StoreError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_header(PROTOCOL_VERSION, inner.config.mode));

    for key in keys {
        let still_present = {
            let state = inner.state.lock().await;
            state.cache.as_ref().is_some_and(|cache| cache.contains_key(&key))
        };
        if !still_present {
            continue;
        }

        if inner.config.mode == Mode::MultiFile {
            if let Some(signal) = inner.sidecar.in_flight_signal(&key) {
                let _ = signal.await;
            }
        }

        let entry = {
            let state = inner.state.lock().await;
            state.cache.as_ref().and_then(|cache| cache.get(&key).cloned())
        };
        let Some(entry) = entry else { continue };

        let meta_bytes = entry.meta_to_json_bytes();
        let value_bytes = if inner.config.mode == Mode::SingleFile {
            Some(materialize_value(&entry, &inner.config.serialize, inner.config.encoding).await?)
        } else {
            None
        };

        write_record(&mut buf, &key, meta_bytes.as_deref(), value_bytes.as_deref()).await?;
    }

    let tmp_path = inner.dir.join(format!("tmp{}", Uuid::new_v4().simple()));
    let file = tokio::fs::File::create(&tmp_path).await?;
    let mut sink = BufWriter::new(file);
    sink.write_all(&buf).await?;
    sink.flush().await?;
    let file = sink.into_inner();
    file.sync_all().await?;
    drop(file);

    Ok(tmp_path)
}

async fn commit_catalog(inner: &Arc<StoreInner>, tmp_path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(&inner.catalog_file).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(tmp_path, &inner.catalog_file).await?;
    Ok(())
}

/// Produces the inline value bytes for a `SINGLE_FILE` record: bytes as-is, text UTF-8 encoded,
/// objects through `serialize`, a bare reader drained fully into memory.
async fn materialize_value(
    entry: &CacheEntry,
    serialize: &Option<SerializeFn>,
    encoding: TextEncoding,
) -> Result<Vec<u8>, StoreError> {
    if let Some(value) = &entry.value {
        return Ok(match value {
            EntryValue::Bytes(b) => b.to_vec(),
            EntryValue::Text(s) => encoding.encode(s),
            EntryValue::Object(obj) => {
                let f = serialize.clone().ok_or_else(|| StoreError::MissingSerializer {
                    key: entry.key.clone(),
                })?;
                f(obj)?.to_vec()
            }
        });
    }

    if let Some(make_stream) = &entry.reader {
        let mut stream = make_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StoreError::ReaderFailed {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;
            buf.extend_from_slice(&chunk);
        }
        return Ok(buf.to_vec());
    }

    Err(StoreError::IllegalState {
        key: entry.key.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::Store;

    #[tokio::test]
    async fn flush_writes_a_readable_catalog_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder().dir(dir.path()).build();
        let store = Store::open(config).await.unwrap();
        store.put("a", "hello").await;
        store.flush().await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("cache")).await.unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], Mode::SingleFile.as_byte());
    }

    #[tokio::test]
    async fn flush_with_nothing_modified_is_a_cheap_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder().dir(dir.path()).build();
        let store = Store::open(config).await.unwrap();
        store.flush().await.unwrap();
        assert!(tokio::fs::metadata(dir.path().join("cache")).await.is_err());
    }
}
