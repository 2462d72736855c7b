//! One-shot, multi-subscriber completion handles.
//!
//! A value produced once, with any number of subscribers resolved together once it lands.
//! [`futures::future::Shared`] is exactly that primitive. We always pair it with a `tokio::spawn`,
//! so the underlying work makes progress regardless of whether any subscriber is currently polling
//! the shared future.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::StoreError;

/// Guards the at-most-one-in-flight Loader.
pub type LoadSignal = Shared<BoxFuture<'static, ()>>;

/// Guards the at-most-one-in-flight Flusher and per-entry sidecar writes.
pub type FallibleSignal = Shared<BoxFuture<'static, Result<(), Arc<StoreError>>>>;

pub fn spawn_load_signal<F>(fut: F) -> LoadSignal
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let wrapped: BoxFuture<'static, ()> = Box::pin(async move {
        let _ = handle.await;
    });
    wrapped.shared()
}

pub fn spawn_fallible_signal<F>(fut: F) -> FallibleSignal
where
    F: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let wrapped: BoxFuture<'static, Result<(), Arc<StoreError>>> = Box::pin(async move {
        match handle.await {
            Ok(result) => result.map_err(Arc::new),
            Err(_) => Err(Arc::new(StoreError::TaskJoin {
                key: String::new(),
            })),
        }
    });
    wrapped.shared()
}
