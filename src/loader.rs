//! The Loader: builds the live map from the on-disk catalog on cold start.
//!
//! Triggered on first `get`, first `flush`, or by a mutation that arrives before the first load
//! completes. At most one load is ever in flight, guarded by `StoreState::load_signal`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::BufReader;

use crate::codec::{decode_catalog, DecodedRecord, PROTOCOL_VERSION};
use crate::entry::{CacheEntry, Deserialized, EntryValue};
use crate::sidecar::SidecarManager;
use crate::store::StoreInner;
use crate::Mode;

/// Runs one full load: opens the catalog, decodes it, builds the live map, drains `pendingCache`
/// into it, and publishes the result.
///
/// A read failure (including file-not-found) completes the load with an empty map — the loader
/// never propagates I/O errors to callers.
pub(crate) async fn run_load(inner: Arc<StoreInner>) {
    let map = match tokio::fs::File::open(&inner.catalog_file).await {
        Ok(file) => {
            let mut reader = BufReader::new(file);
            let decoded = decode_catalog(&mut reader, PROTOCOL_VERSION).await;
            if decoded.version_mismatch {
                trace!(path = %inner.catalog_file.display(), "Catalog version mismatch; treating as empty.");
                HashMap::new()
            } else {
                build_map(&inner, decoded.records)
            }
        }
        Err(e) => {
            debug!(path = %inner.catalog_file.display(), error = %e, "Catalog unreadable; starting from an empty cache.");
            HashMap::new()
        }
    };

    inner.complete_load(map).await;
}

fn build_map(inner: &Arc<StoreInner>, records: Vec<DecodedRecord>) -> HashMap<String, CacheEntry> {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
        let mut entry = decode_entry(inner, record);
        if let Some(predicate) = &inner.config.is_cache_entry_valid {
            if !predicate(&entry) {
                continue;
            }
        }
        if inner.config.deserialize.is_some() {
            entry.deserialized = Deserialized::Pending;
        }
        map.insert(entry.key.clone(), entry);
    }
    map
}

fn decode_entry(inner: &Arc<StoreInner>, record: DecodedRecord) -> CacheEntry {
    let meta = if record.meta_bytes.is_empty() {
        serde_json::Map::new()
    } else {
        serde_json::from_slice(&record.meta_bytes).unwrap_or_default()
    };

    let (value, reader) = match inner.config.mode {
        Mode::SingleFile => (
            record.inline_value.map(|bytes| EntryValue::Bytes(bytes.into())),
            None,
        ),
        Mode::MultiFile => {
            let rel = meta.get(crate::entry::META_FILE_KEY).and_then(|v| v.as_str());
            let reader = rel.map(|rel| {
                SidecarManager::open_reader_factory(inner.sidecar.dir().join(rel), None)
            });
            (None, reader)
        }
    };

    CacheEntry {
        key: record.key,
        meta,
        value,
        reader,
        deserialized: Deserialized::NotApplicable,
    }
}
