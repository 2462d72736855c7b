//! The `Store` facade: `StoreInner`'s locked state, and the `get`/`put`/`remove`/`flush` surface
//! built on top of it.
//!
//! A single `tokio::sync::Mutex<StoreState>` guards everything: the live map (once loaded), the
//! staging map used before the first load completes, and the two in-flight signals (`load_signal`,
//! `flush_signal`). Every await that would otherwise happen while holding that lock — waiting on a
//! signal, doing file I/O — is either spawned onto its own task or performed after the guard is
//! dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::StoreConfig;
use crate::entry::{CacheEntry, Deserialized, PutValue};
use crate::error::StoreError;
use crate::sidecar::SidecarManager;
use crate::signal::{spawn_fallible_signal, spawn_load_signal, FallibleSignal, LoadSignal};
use crate::Mode;

/// A mutation staged before the first load completes, replayed onto the live map once it lands.
pub(crate) enum PendingOp {
    Put(CacheEntry),
    Tombstone,
}

#[derive(Default)]
pub(crate) struct StoreState {
    /// `None` until the first load completes; `Some` (possibly empty) afterward.
    pub(crate) cache: Option<HashMap<String, CacheEntry>>,
    /// Mutations that arrived before `cache` was populated, keyed by cache key.
    pub(crate) pending: HashMap<String, PendingOp>,
    pub(crate) load_signal: Option<LoadSignal>,
    pub(crate) flush_signal: Option<FallibleSignal>,
    /// Bumped on every `schedule_flush`; a deferred timer whose generation no longer matches on
    /// waking was superseded by a later mutation or an explicit `flush()` and does nothing.
    pub(crate) flush_generation: u64,
    pub(crate) modified: bool,
    /// Set when a mutation arrives while a flush is already running; tells `finish_flush` to
    /// immediately schedule another one.
    pub(crate) write_after_flush: bool,
}

pub(crate) struct StoreInner {
    pub(crate) dir: PathBuf,
    pub(crate) catalog_file: PathBuf,
    pub(crate) config: StoreConfig,
    pub(crate) state: AsyncMutex<StoreState>,
    pub(crate) sidecar: Arc<SidecarManager>,
}

impl StoreInner {
    /// Starts a load if none is already running, returning its completion signal either way.
    pub(crate) fn ensure_load_started(self: &Arc<Self>, state: &mut StoreState) -> LoadSignal {
        if let Some(signal) = &state.load_signal {
            return signal.clone();
        }
        let inner = Arc::clone(self);
        let signal = spawn_load_signal(async move {
            crate::loader::run_load(inner).await;
        });
        state.load_signal = Some(signal.clone());
        signal
    }

    /// Drains `pending` into the freshly-loaded map and, if anything was staged, marks the store
    /// modified and schedules a flush so those staged mutations actually get persisted.
    pub(crate) async fn complete_load(self: &Arc<Self>, mut map: HashMap<String, CacheEntry>) {
        let mut state = self.state.lock().await;
        let had_pending = !state.pending.is_empty();
        for (key, op) in state.pending.drain() {
            match op {
                PendingOp::Put(entry) => {
                    map.insert(key, entry);
                }
                PendingOp::Tombstone => {
                    map.remove(&key);
                }
            }
        }
        state.cache = Some(map);
        state.load_signal = None;
        if had_pending {
            state.modified = true;
            crate::flusher::schedule_flush(self, &mut state);
        }
    }

    /// Starts externalizing `entry`'s value to a fresh sidecar path, swapping the entry's reader
    /// over to one that reads back the file once the write completes. No-op if a sidecar file is
    /// already attached or a write is already in flight for this key.
    pub(crate) fn begin_sidecar_write(self: &Arc<Self>, key: &str, entry: &mut CacheEntry) {
        if entry.meta_file().is_some() || self.sidecar.has_in_flight(key) {
            return;
        }

        let rel = SidecarManager::allocate_rel_path();
        let abs = self.sidecar.dir().join(&rel);
        let value = entry.value.take();
        let reader = entry.reader.take();
        let serialize = self.config.serialize.clone();
        let encoding = self.config.encoding;

        let inner = Arc::clone(self);
        let task_key = key.to_owned();
        let publish_rel = rel.clone();
        let write_abs = abs.clone();
        let signal = spawn_fallible_signal(async move {
            crate::sidecar::write_value_to_path(
                &write_abs, value, reader, serialize, encoding, &task_key,
            )
            .await?;
            inner.on_sidecar_published(&task_key, publish_rel).await;
            Ok(())
        });

        self.sidecar.insert_in_flight(key.to_owned(), rel, signal.clone());
        entry.reader = Some(SidecarManager::open_reader_factory(abs, Some(signal)));
    }

    /// Stamps `meta.file` onto whichever map currently holds `key` once its sidecar write lands.
    pub(crate) async fn on_sidecar_published(self: &Arc<Self>, key: &str, rel: String) {
        let mut state = self.state.lock().await;
        if let Some(cache) = state.cache.as_mut() {
            if let Some(entry) = cache.get_mut(key) {
                entry.set_meta_file(rel);
            }
        } else if let Some(PendingOp::Put(entry)) = state.pending.get_mut(key) {
            entry.set_meta_file(rel);
        }
        self.sidecar.clear_in_flight(key);
    }

    /// The flush procedure. Blocks on a load if one hasn't happened yet, cancels any pending
    /// deferred timer, and either joins an already-running flush or starts a new one — never both
    /// at once, per the at-most-one-flush-in-flight invariant.
    pub(crate) async fn flush(self: &Arc<Self>) -> Result<(), StoreError> {
        loop {
            let mut state = self.state.lock().await;

            if state.cache.is_none() {
                let signal = self.ensure_load_started(&mut state);
                drop(state);
                signal.await;
                continue;
            }

            // An explicit flush always supersedes whatever deferred timer might be ticking.
            state.flush_generation = state.flush_generation.wrapping_add(1);

            if let Some(signal) = state.flush_signal.clone() {
                if state.modified {
                    // A mutation landed after the running flush took its snapshot; it'll need
                    // its own pass, but join the one already in flight first.
                    drop(state);
                    let _ = signal.await;
                    continue;
                }
                drop(state);
                return signal.await.map_err(|e| (*e).clone());
            }

            if !state.modified {
                return Ok(());
            }

            state.modified = false;
            let inner = Arc::clone(self);
            let signal = spawn_fallible_signal(async move {
                let result = crate::flusher::perform_flush(Arc::clone(&inner)).await;
                inner.finish_flush(result.is_ok()).await;
                result
            });
            state.flush_signal = Some(signal.clone());
            drop(state);
            return signal.await.map_err(|e| (*e).clone());
        }
    }

    /// Clears the running-flush marker and, if a mutation arrived mid-flush, schedules the next
    /// one. A failed flush leaves `modified` set so a later flush retries it.
    pub(crate) async fn finish_flush(self: &Arc<Self>, succeeded: bool) {
        let mut state = self.state.lock().await;
        state.flush_signal = None;
        if !succeeded {
            state.modified = true;
        }
        if state.write_after_flush {
            state.write_after_flush = false;
            crate::flusher::schedule_flush(self, &mut state);
        }
    }
}

/// A persistent, in-memory-backed key/value cache store that durably mirrors itself to disk.
///
/// Cheap to clone: internally an `Arc<StoreInner>`.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (and creates, if absent) the store rooted at `config.dir()`. Does not itself load the
    /// catalog; the first load is triggered lazily by the first `get`, `flush`, or pre-load
    /// mutation.
    pub async fn open(config: StoreConfig) -> Result<Store, StoreError> {
        tokio::fs::create_dir_all(config.dir()).await?;
        let dir = config.dir().to_path_buf();
        let catalog_file = dir.join("cache");
        let sidecar = Arc::new(SidecarManager::new(dir.clone()));
        let inner = Arc::new(StoreInner {
            dir,
            catalog_file,
            config,
            state: AsyncMutex::new(StoreState::default()),
            sidecar,
        });
        Ok(Store { inner })
    }

    /// Inserts or replaces `key`'s entry. In `MULTI_FILE` mode, starts externalizing the value to
    /// a sidecar file in the background; the entry's reader is swapped to one that reads it back.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<PutValue>) {
        let key = key.into();
        assert!(!key.is_empty(), "cache key must not be empty");
        let entry = CacheEntry::new(key.clone(), value.into());
        self.put_entry_under(key, entry).await;
    }

    /// Inserts or replaces a fully-formed [`CacheEntry`] (useful when the caller already built one
    /// via a reader factory or wants to carry existing `meta`).
    pub async fn put_entry(&self, entry: CacheEntry) {
        assert!(!entry.key.is_empty(), "cache key must not be empty");
        let key = entry.key.clone();
        self.put_entry_under(key, entry).await;
    }

    async fn put_entry_under(&self, key: String, mut entry: CacheEntry) {
        if self.inner.config.deserialize.is_some() && entry.deserialized == Deserialized::NotApplicable {
            entry.deserialized = Deserialized::Pending;
        }
        if self.inner.config.mode == Mode::MultiFile {
            self.inner.begin_sidecar_write(&key, &mut entry);
        }

        let mut state = self.inner.state.lock().await;
        if let Some(cache) = state.cache.as_mut() {
            cache.insert(key, entry);
            state.modified = true;
            crate::flusher::schedule_flush(&self.inner, &mut state);
        } else {
            state.pending.insert(key, PendingOp::Put(entry));
            self.inner.ensure_load_started(&mut state);
        }
    }

    /// Looks up `key`, triggering (and waiting on) the first load if it hasn't happened yet.
    pub async fn get(&self, key: impl AsRef<str>) -> Option<CacheEntry> {
        let key = key.as_ref();
        let mut state = self.inner.state.lock().await;
        if let Some(cache) = &state.cache {
            return cache.get(key).cloned();
        }
        if let Some(op) = state.pending.get(key) {
            return match op {
                PendingOp::Put(entry) => Some(entry.clone()),
                PendingOp::Tombstone => None,
            };
        }
        let signal = self.inner.ensure_load_started(&mut state);
        drop(state);
        signal.await;
        let state = self.inner.state.lock().await;
        state.cache.as_ref().and_then(|cache| cache.get(key).cloned())
    }

    /// Removes `key`. If the catalog hasn't loaded yet, stages a tombstone that's replayed once it
    /// does. Idempotent: removing an absent key still marks the store modified, matching `put`.
    pub async fn remove(&self, key: impl AsRef<str>) {
        let key = key.as_ref();
        let mut state = self.inner.state.lock().await;
        if let Some(cache) = state.cache.as_mut() {
            if let Some(entry) = cache.remove(key) {
                if self.inner.config.mode == Mode::MultiFile {
                    let rel = entry.meta_file().map(str::to_owned);
                    self.inner.sidecar.schedule_delete(key.to_owned(), rel);
                }
            }
            state.modified = true;
            crate::flusher::schedule_flush(&self.inner, &mut state);
        } else {
            if self.inner.config.mode == Mode::MultiFile {
                if let Some(PendingOp::Put(entry)) = state.pending.get(key) {
                    let rel = entry.meta_file().map(str::to_owned);
                    self.inner.sidecar.schedule_delete(key.to_owned(), rel);
                }
            }
            state.pending.insert(key.to_owned(), PendingOp::Tombstone);
            self.inner.ensure_load_started(&mut state);
        }
    }

    /// Runs the flush procedure to completion, returning the first error it hit.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await
    }

    /// Runs a final flush, then tears down in-memory state the same way [`Store::free`] does.
    /// The handle remains valid afterward: any subsequent access re-loads from the catalog, the
    /// same as after a process restart. Returns the flush's error, if any, after tearing down.
    pub async fn close(&self) -> Result<(), StoreError> {
        let result = self.flush().await;
        self.free().await;
        result
    }

    /// Resets all in-memory state back to the post-`open` condition — clears the live map,
    /// staged pending mutations, and both signals — without touching the on-disk catalog. Waits
    /// out any load or flush already in progress first rather than racing them.
    pub async fn free(&self) {
        loop {
            let (load_signal, flush_signal) = {
                let state = self.inner.state.lock().await;
                (state.load_signal.clone(), state.flush_signal.clone())
            };
            if let Some(signal) = load_signal {
                signal.await;
                continue;
            }
            if let Some(signal) = flush_signal {
                let _ = signal.await;
                continue;
            }
            break;
        }

        let mut state = self.inner.state.lock().await;
        *state = StoreState::default();
    }

    /// Number of live entries. Triggers a load the same way `get` does only if the catalog state
    /// is already known (loaded or still staging); does not itself force a load.
    pub async fn len(&self) -> usize {
        let state = self.inner.state.lock().await;
        match &state.cache {
            Some(cache) => cache.len(),
            None => state
                .pending
                .values()
                .filter(|op| matches!(op, PendingOp::Put(_)))
                .count(),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of currently-known keys (pre-load staged keys if the catalog hasn't loaded yet).
    pub async fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        match &state.cache {
            Some(cache) => cache.keys().cloned().collect(),
            None => state
                .pending
                .iter()
                .filter_map(|(key, op)| matches!(op, PendingOp::Put(_)).then(|| key.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    async fn open_in(dir: &std::path::Path) -> Store {
        let config = StoreConfig::builder().dir(dir).build();
        Store::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_before_any_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(dir.path()).await;
        store.put("a", "hello").await;
        let entry = store.get("a").await.unwrap();
        assert_eq!(entry.key, "a");
    }

    #[tokio::test]
    async fn remove_of_absent_key_still_marks_modified() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(dir.path()).await;
        store.remove("nope").await;
        store.flush().await.unwrap();
        assert!(tokio::fs::metadata(dir.path().join("cache")).await.is_ok());
    }

    #[tokio::test]
    async fn flush_persists_and_reload_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_in(dir.path()).await;
            store.put("a", "hello").await;
            store.flush().await.unwrap();
        }
        let store = open_in(dir.path()).await;
        let entry = store.get("a").await.unwrap();
        assert_eq!(entry.key, "a");
        assert_eq!(store.len().await, 1);
    }
}
