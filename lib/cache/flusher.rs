//! Periodic write-back of dirty cache entries.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::store::CacheStore;

/// Default time between two flush cycles.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of contended cycles tolerated before a cycle waits for its locks.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 5;

/// A dedicated thread that flushes dirty entries and evicts expired ones on a fixed interval.
///
/// Cycles only try locks, so a busy filesystem is never held up by write-back. After
/// `escalation_threshold` consecutive cycles that could not make progress, the next cycle blocks
/// on every lock instead, so a constantly busy entry still reaches the backend eventually.
///
/// Dropping the flusher stops the thread and waits for it to exit.
#[derive(Debug)]
pub struct BackgroundFlusher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    /// Starts flushing `store` every `interval`.
    ///
    /// The thread only holds a weak reference and exits on its own once the store is gone.
    pub fn spawn(
        store: &Arc<CacheStore>,
        interval: Duration,
        escalation_threshold: u32,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let store = Arc::downgrade(store);
        let handle = std::thread::Builder::new()
            .name("kvfs-flusher".to_owned())
            .spawn(move || {
                debug!(?interval, escalation_threshold, "background flusher started");
                let mut cycle = FlushCycle::new(store, escalation_threshold);
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !cycle.run() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("background flusher stopped");
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("background flusher panicked");
        }
    }
}

/// State carried from one cycle to the next.
struct FlushCycle {
    store: Weak<CacheStore>,
    escalation_threshold: u32,
    contended: u32,
}

impl FlushCycle {
    fn new(store: Weak<CacheStore>, escalation_threshold: u32) -> Self {
        Self {
            store,
            escalation_threshold,
            contended: 0,
        }
    }

    /// Runs one cycle. Returns `false` once the store is gone.
    fn run(&mut self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let blocking = self.contended >= self.escalation_threshold;
        if blocking {
            debug!(cycles = self.contended, "flush starved, blocking on locks");
        }

        let complete = flush_dirty(&store, blocking);
        let evicted = match store.evict_expired(blocking) {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "background eviction failed");
                true
            }
        };

        if complete && evicted {
            self.contended = 0;
        } else {
            self.contended = self.contended.saturating_add(1);
            trace!(cycles = self.contended, "flush cycle hit contention");
        }
        true
    }
}

/// Flushes every dirty entry. Returns `false` if some entry was skipped because of contention.
fn flush_dirty(store: &CacheStore, blocking: bool) -> bool {
    let mut complete = true;

    match store.directory_snapshot(blocking) {
        Some(directories) => {
            for (path, directory) in directories {
                if !directory.is_dirty() {
                    continue;
                }
                let outcome = if blocking {
                    Some(directory.flush())
                } else {
                    directory.try_flush()
                };
                match outcome {
                    Some(Ok(())) => trace!(path, "flushed directory"),
                    Some(Err(e)) => warn!(path, error = %e, "background flush of directory failed"),
                    None => complete = false,
                }
            }
        }
        None => complete = false,
    }

    match store.metadata_snapshot(blocking) {
        Some(entries) => {
            for (path, metadata) in entries {
                if !metadata.is_dirty() {
                    continue;
                }
                let outcome = if blocking {
                    Some(metadata.flush())
                } else {
                    metadata.try_flush()
                };
                match outcome {
                    Some(Ok(())) => trace!(path, "flushed metadata"),
                    Some(Err(e)) => warn!(path, error = %e, "background flush of metadata failed"),
                    None => complete = false,
                }
            }
        }
        None => complete = false,
    }

    complete
}
