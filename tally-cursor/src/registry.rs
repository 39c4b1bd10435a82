//! Per-broker cursor registry.
//!
//! The registry is an explicit object owned by whoever runs the cursors. It
//! enumerates open cursors for [`crate::MetricsCollector`], owns the
//! prometheus registry their series live in, and drives the periodic flush
//! timer. Cursors never share state through it: each entry is only read.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tally_core::Limits;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cursor::CursorId;
use crate::error::{CursorError, CursorResult};
use crate::metrics::CursorMetrics;
use crate::persist::PersistenceManager;

/// Open cursors of one broker.
#[derive(Debug)]
pub struct CursorRegistry {
    metrics: Arc<CursorMetrics>,
    limits: Limits,
    cursors: Mutex<BTreeMap<CursorId, Arc<PersistenceManager>>>,
}

impl CursorRegistry {
    /// Creates an empty registry with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the metric families cannot be registered.
    pub fn new() -> CursorResult<Self> {
        Self::with_limits(Limits::default())
    }

    /// Creates an empty registry whose cursors decode and accept state
    /// within `limits`.
    ///
    /// # Errors
    ///
    /// Returns an error if `limits` is inconsistent or the metric families
    /// cannot be registered.
    pub fn with_limits(limits: Limits) -> CursorResult<Self> {
        limits.validate()?;
        Ok(Self {
            metrics: Arc::new(CursorMetrics::new()?),
            limits,
            cursors: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the metric families shared by all cursors.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<CursorMetrics> {
        &self.metrics
    }

    /// Returns the limits applied to every cursor.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Returns the ids of all open cursors, in order.
    #[must_use]
    pub fn cursors(&self) -> Vec<CursorId> {
        self.lock().keys().cloned().collect()
    }

    /// Returns true if a cursor with `id` is open.
    #[must_use]
    pub fn contains(&self, id: &CursorId) -> bool {
        self.lock().contains_key(id)
    }

    /// Returns the number of open cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no cursor is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Triggers a flush of every cursor with unpersisted changes and returns
    /// how many were triggered.
    pub fn flush_dirty(&self) -> usize {
        let dirty: Vec<_> = self
            .managers()
            .into_iter()
            .filter(|manager| manager.is_dirty())
            .collect();
        for manager in &dirty {
            manager.trigger_persist();
        }
        dirty.len()
    }

    /// Spawns the periodic flush timer on the current runtime.
    ///
    /// The timer holds only a weak reference and stops on its own once the
    /// registry is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or with a zero `period`.
    #[must_use]
    pub fn spawn_flush_timer(self: &Arc<Self>, period: Duration) -> FlushTimer {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(flush_timer_task(Arc::downgrade(self), period, shutdown_rx));
        FlushTimer {
            shutdown_tx,
            handle,
        }
    }

    pub(crate) fn register(&self, manager: Arc<PersistenceManager>) -> CursorResult<()> {
        let mut cursors = self.lock();
        let id = manager.id().clone();
        if cursors.contains_key(&id) {
            return Err(CursorError::AlreadyOpen {
                cursor: id.to_string(),
            });
        }
        cursors.insert(id, manager);
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &CursorId) {
        self.lock().remove(id);
    }

    pub(crate) fn managers(&self) -> Vec<Arc<PersistenceManager>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<CursorId, Arc<PersistenceManager>>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// -----------------------------------------------------------------------------
// Flush timer
// -----------------------------------------------------------------------------

/// Handle to the background flush timer.
#[derive(Debug)]
pub struct FlushTimer {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Stops the timer and waits for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

async fn flush_timer_task(
    registry: Weak<CursorRegistry>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Cursor flush timer shutting down");
                break;
            }
            _ = interval.tick() => {
                let Some(registry) = registry.upgrade() else {
                    info!("Cursor registry dropped, stopping flush timer");
                    break;
                };
                let triggered = registry.flush_dirty();
                if triggered > 0 {
                    debug!(triggered, "Flush timer triggered dirty cursors");
                }
            }
        }
    }
}
