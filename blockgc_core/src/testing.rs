//! Instrumented collaborators for tests.

use crate::blockstore::{Blockstore, MemoryBlockstore};
use crate::datastore::RootStore;
use crate::error::{Error, Result};
use crate::key::normalize;
use crate::pins::PinSource;
use async_trait::async_trait;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Pin source whose listing fails immediately.
pub(crate) struct FailingPins;

#[async_trait]
impl PinSource for FailingPins {
    fn ls(&self) -> BoxStream<'static, Result<Cid>> {
        stream::once(async { Err(Error::task("pin listing failed")) }).boxed()
    }

    async fn internal_blocks(&self) -> Result<Vec<Cid>> {
        Ok(Vec::new())
    }
}

/// Pin source backed by fixed lists.
#[derive(Default)]
pub(crate) struct StaticPins {
    pub pinned: Vec<Cid>,
    pub internal: Vec<Cid>,
}

#[async_trait]
impl PinSource for StaticPins {
    fn ls(&self) -> BoxStream<'static, Result<Cid>> {
        stream::iter(self.pinned.clone().into_iter().map(Ok)).boxed()
    }

    async fn internal_blocks(&self) -> Result<Vec<Cid>> {
        Ok(self.internal.clone())
    }
}

/// Root store whose reads fail with an I/O error.
pub(crate) struct FailingRootStore;

#[async_trait]
impl RootStore for FailingRootStore {
    async fn get(&self, _key: &str) -> Result<Vec<u8>> {
        Err(std::io::Error::other("disk on fire").into())
    }

    async fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Err(std::io::Error::other("disk on fire").into())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(std::io::Error::other("disk on fire").into())
    }
}

/// Blockstore wrapper that records delete concurrency and can fail
/// deletes of chosen blocks.
#[derive(Clone)]
pub(crate) struct InstrumentedBlockstore {
    inner: MemoryBlockstore,
    failing: Arc<HashSet<String>>,
    delete_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
}

impl InstrumentedBlockstore {
    pub fn new(inner: MemoryBlockstore) -> Self {
        Self {
            inner,
            failing: Arc::new(HashSet::new()),
            delete_delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            delete_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_on(mut self, cids: &[Cid]) -> Self {
        self.failing = Arc::new(cids.iter().map(normalize).collect());
        self
    }

    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Blockstore for InstrumentedBlockstore {
    fn query_keys(&self) -> BoxStream<'static, Result<String>> {
        self.inner.query_keys()
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.inner.get(cid).await
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<()> {
        self.inner.put(cid, data).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.inner.has(cid).await
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delete_delay.is_zero() {
            tokio::time::sleep(self.delete_delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let result = if self.failing.contains(&normalize(cid)) {
            Err(std::io::Error::other("delete refused").into())
        } else {
            self.inner.delete(cid).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
