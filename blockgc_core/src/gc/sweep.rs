//! Sweep phase: delete every stored block that is not marked.

use super::{DeletionResult, GcStats};
use crate::blockstore::Blockstore;
use crate::config::GcConfig;
use crate::key::{MarkedSet, parse_key};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    deleted: AtomicU64,
    failed: AtomicU64,
    // a result could not be handed to the consumer
    undelivered: AtomicBool,
}

/// Deletes unmarked blocks with bounded concurrency.
///
/// Each delete runs as its own task holding a semaphore permit until its
/// result has been handed to the result channel. The number of deletes in
/// flight therefore never exceeds the configured concurrency, and a slow
/// consumer stalls new deletes instead of growing a buffer.
pub(crate) struct Sweeper {
    blockstore: Arc<dyn Blockstore>,
    marked: MarkedSet,
    concurrency: usize,
    dry_run: bool,
}

impl Sweeper {
    pub(crate) fn new(blockstore: Arc<dyn Blockstore>, marked: MarkedSet, config: &GcConfig) -> Self {
        Self {
            blockstore,
            marked,
            concurrency: config.concurrency.max(1),
            dry_run: config.dry_run,
        }
    }

    /// Visit every stored key once, sending a result for each deletion
    /// attempt and each undecodable key.
    ///
    /// Stops admitting new deletes as soon as the result receiver is gone;
    /// deletes already started always run to completion before this returns.
    /// A run whose receiver went away before every result was delivered is
    /// reported as cancelled.
    pub(crate) async fn run(self, results: mpsc::Sender<DeletionResult>) -> GcStats {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let counters = Arc::new(Counters::default());
        let mut tasks = JoinSet::new();
        let mut stats = GcStats {
            marked: self.marked.len() as u64,
            dry_run: self.dry_run,
            ..GcStats::default()
        };

        let mut keys = self.blockstore.query_keys();
        while let Some(entry) = keys.next().await {
            if results.is_closed() {
                stats.cancelled = true;
                break;
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let key = match entry {
                Ok(key) => key,
                Err(error) => {
                    warn!(%error, "block enumeration failed; ending sweep early");
                    stats.incomplete = true;
                    if results
                        .send(DeletionResult::KeyEnumeration { error })
                        .await
                        .is_err()
                    {
                        stats.cancelled = true;
                    }
                    break;
                }
            };
            stats.visited += 1;

            let cid = match parse_key(&key) {
                Ok(cid) => cid,
                Err(error) => {
                    stats.invalid += 1;
                    warn!(key = %key, %error, "stored key is not a CID; skipping");
                    if results
                        .send(DeletionResult::InvalidKey { key, error })
                        .await
                        .is_err()
                    {
                        stats.cancelled = true;
                        break;
                    }
                    continue;
                }
            };

            if self.marked.contains(&cid) {
                stats.skipped += 1;
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            // the wait for a permit can be long; re-check before deleting
            if results.is_closed() {
                stats.cancelled = true;
                break;
            }

            let store = Arc::clone(&self.blockstore);
            let tx = results.clone();
            let counters = Arc::clone(&counters);
            let dry_run = self.dry_run;

            tasks.spawn(async move {
                let outcome = if dry_run {
                    Ok(())
                } else {
                    store.delete(&cid).await
                };

                let item = match outcome {
                    Ok(()) => {
                        counters.deleted.fetch_add(1, Ordering::Relaxed);
                        debug!(cid = %cid, dry_run, "deleted block");
                        DeletionResult::Deleted { cid }
                    }
                    Err(error) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(cid = %cid, %error, "failed to delete block");
                        DeletionResult::DeleteFailed { cid, error }
                    }
                };

                if tx.send(item).await.is_err() {
                    counters.undelivered.store(true, Ordering::Relaxed);
                }
                drop(permit);
            });
        }
        drop(keys);

        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }

        stats.deleted = counters.deleted.load(Ordering::Relaxed);
        stats.failed = counters.failed.load(Ordering::Relaxed);
        if counters.undelivered.load(Ordering::Relaxed) {
            stats.cancelled = true;
        }
        stats
    }
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "delete task did not complete");
    }
}
