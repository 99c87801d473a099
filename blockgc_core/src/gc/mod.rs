//! Garbage collection.
//!
//! A run is stop-the-world: it takes the exclusive side of the repository's
//! [`GcLock`], computes the set of live blocks, deletes everything else, and
//! only then releases the lock. Results stream to the caller as deletes
//! finish; dropping the stream stops the sweep after the deletes already in
//! flight.

mod mark;
mod sweep;

pub(crate) use mark::mfs_root;

use crate::blockstore::Blockstore;
use crate::config::GcConfig;
use crate::dag::DagWalker;
use crate::datastore::RootStore;
use crate::error::{Error, Result};
use crate::lock::GcLock;
use crate::pins::PinSource;
use cid::Cid;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use sweep::Sweeper;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};

/// Outcome of one sweep decision.
#[derive(Debug)]
pub enum DeletionResult {
    /// The block was deleted (or would have been, in a dry run).
    Deleted { cid: Cid },
    /// The blockstore refused to delete the block.
    DeleteFailed { cid: Cid, error: Error },
    /// A stored key could not be decoded as a CID. Nothing was deleted.
    InvalidKey { key: String, error: Error },
    /// Listing the blockstore failed; the sweep ended early.
    KeyEnumeration { error: Error },
}

impl DeletionResult {
    /// The block this result is about, if it names one.
    pub fn cid(&self) -> Option<&Cid> {
        match self {
            Self::Deleted { cid } | Self::DeleteFailed { cid, .. } => Some(cid),
            Self::InvalidKey { .. } | Self::KeyEnumeration { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Deleted { .. } => None,
            Self::DeleteFailed { error, .. }
            | Self::InvalidKey { error, .. }
            | Self::KeyEnumeration { error } => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

/// Counters for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Size of the marked set.
    pub marked: u64,
    /// Keys enumerated during the sweep.
    pub visited: u64,
    /// Keys kept because they were marked.
    pub skipped: u64,
    /// Blocks deleted.
    pub deleted: u64,
    /// Blocks whose delete failed.
    pub failed: u64,
    /// Keys that did not decode as CIDs.
    pub invalid: u64,
    pub dry_run: bool,
    /// The consumer dropped the result stream before the sweep finished.
    pub cancelled: bool,
    /// Key enumeration failed part way through.
    pub incomplete: bool,
}

/// All results of a run that was driven to the end.
#[derive(Debug)]
pub struct GcReport {
    pub stats: GcStats,
    pub results: Vec<DeletionResult>,
}

impl GcReport {
    /// CIDs of deleted blocks.
    pub fn deleted(&self) -> impl Iterator<Item = &Cid> {
        self.results.iter().filter_map(|r| match r {
            DeletionResult::Deleted { cid } => Some(cid),
            _ => None,
        })
    }

    /// Results that carry an error.
    pub fn errors(&self) -> impl Iterator<Item = &DeletionResult> {
        self.results.iter().filter(|r| r.is_error())
    }
}

/// Stream of results from a running sweep.
///
/// The sweep holds the GC lock until it ends. Dropping this stream (or
/// calling [`GcStream::finish`]) stops new deletes; the lock is released
/// once the deletes already in flight complete.
pub struct GcStream {
    results: ReceiverStream<DeletionResult>,
    stats: oneshot::Receiver<GcStats>,
}

impl GcStream {
    /// Stop consuming and wait for the sweep to wind down.
    ///
    /// Returns the run's counters. If the sweep still had results to hand
    /// over when the stream was dropped, the run is reported as cancelled.
    pub async fn finish(self) -> Result<GcStats> {
        let GcStream { results, stats } = self;
        drop(results);
        stats
            .await
            .map_err(|_| Error::task("gc run ended without reporting stats"))
    }

    /// Drain every remaining result, then return them with the counters.
    pub async fn collect_report(mut self) -> Result<GcReport> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        let stats = self.finish().await?;
        Ok(GcReport { stats, results })
    }
}

impl Stream for GcStream {
    type Item = DeletionResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.results).poll_next(cx)
    }
}

/// Runs garbage collection over a set of collaborators.
///
/// # Example
///
/// ```no_run
/// use blockgc_core::Repo;
/// use futures::StreamExt;
///
/// # async fn demo() -> blockgc_core::Result<()> {
/// let repo = Repo::open("./repo")?;
/// let mut results = repo.gc().await?;
/// while let Some(result) = results.next().await {
///     if let Some(cid) = result.cid() {
///         println!("{cid}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct GarbageCollector {
    blockstore: Arc<dyn Blockstore>,
    pins: Arc<dyn PinSource>,
    roots: Arc<dyn RootStore>,
    walker: Arc<dyn DagWalker>,
    lock: GcLock,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(
        blockstore: Arc<dyn Blockstore>,
        pins: Arc<dyn PinSource>,
        roots: Arc<dyn RootStore>,
        walker: Arc<dyn DagWalker>,
        lock: GcLock,
    ) -> Self {
        Self {
            blockstore,
            pins,
            roots,
            walker,
            lock,
            config: GcConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a run.
    ///
    /// Waits for the GC lock, then builds the marked set before returning.
    /// A failure in the mark phase is returned here, with the lock already
    /// released and nothing deleted. On success the sweep proceeds in the
    /// background, feeding the returned stream.
    pub async fn run(&self) -> Result<GcStream> {
        let started = Instant::now();
        debug!("waiting for gc lock");
        let guard = self.lock.write_lock().await?;
        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            "gc lock acquired"
        );

        let marked = match mark::build_marked_set(
            self.pins.as_ref(),
            self.roots.as_ref(),
            self.walker.as_ref(),
        )
        .await
        {
            Ok(marked) => marked,
            Err(e) => {
                warn!(error = %e, "gc aborted during mark phase");
                return Err(e);
            }
        };

        let (results_tx, results_rx) = mpsc::channel(self.config.result_buffer.max(1));
        let (stats_tx, stats_rx) = oneshot::channel();
        let sweeper = Sweeper::new(Arc::clone(&self.blockstore), marked, &self.config);

        let span = info_span!("gc", dry_run = self.config.dry_run);
        tokio::spawn(
            async move {
                let stats = sweeper.run(results_tx).await;
                drop(guard);

                let duration_ms = started.elapsed().as_millis() as u64;
                if stats.cancelled || stats.incomplete {
                    warn!(
                        marked = stats.marked,
                        visited = stats.visited,
                        deleted = stats.deleted,
                        failed = stats.failed,
                        cancelled = stats.cancelled,
                        incomplete = stats.incomplete,
                        duration_ms,
                        "gc ended early"
                    );
                } else {
                    info!(
                        marked = stats.marked,
                        visited = stats.visited,
                        skipped = stats.skipped,
                        deleted = stats.deleted,
                        failed = stats.failed,
                        invalid = stats.invalid,
                        duration_ms,
                        "gc complete"
                    );
                }
                let _ = stats_tx.send(stats);
            }
            .instrument(span),
        );

        Ok(GcStream {
            results: ReceiverStream::new(results_rx),
            stats: stats_rx,
        })
    }

    /// Run to completion and collect every result.
    pub async fn run_to_end(&self) -> Result<GcReport> {
        self.run().await?.collect_report().await
    }
}
