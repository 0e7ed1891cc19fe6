use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::GuardEvent;
use crate::db::{iso, DbState};
use crate::error::Result;
use crate::flags::{FeatureFlags, PersistenceFlag};

/// Batched, asynchronous writer of guard events into `guard_metrics_events`.
///
/// Events are queued in memory and flushed on a timer or as soon as a full
/// batch is waiting. A failed batch goes back to the front of the queue and
/// is retried on the next cycle. The queue holds at most `max_pending`
/// events; past that the oldest are dropped and counted.
pub struct GuardPersistence {
    db: DbState,
    flags: Arc<FeatureFlags>,
    queue: Mutex<VecDeque<GuardEvent>>,
    max_batch: usize,
    max_pending: usize,
    dropped: AtomicU64,
    flush_interval: Duration,
    flushing: tokio::sync::Mutex<()>,
    wake: Notify,
    last_flush_error: Mutex<Option<String>>,
}

impl GuardPersistence {
    pub fn new(
        db: DbState,
        flags: Arc<FeatureFlags>,
        max_batch: usize,
        max_pending: usize,
        flush_interval: Duration,
    ) -> Self {
        let max_batch = max_batch.max(1);
        Self {
            db,
            flags,
            queue: Mutex::new(VecDeque::new()),
            max_batch,
            max_pending: max_pending.max(max_batch),
            dropped: AtomicU64::new(0),
            flush_interval,
            flushing: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            last_flush_error: Mutex::new(None),
        }
    }

    /// Queues an event; returns how many of the oldest queued events were dropped to make room.
    pub fn enqueue(&self, event: GuardEvent) -> usize {
        if self.flags.guard_metrics_persistence() == PersistenceFlag::Off {
            return 0;
        }
        let (len, dropped) = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(event);
            let dropped = self.trim(&mut queue);
            (queue.len(), dropped)
        };
        if len >= self.max_batch {
            self.wake.notify_one();
        }
        dropped
    }

    fn trim(&self, queue: &mut VecDeque<GuardEvent>) -> usize {
        let excess = queue.len().saturating_sub(self.max_pending);
        if excess > 0 {
            queue.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            warn!(
                dropped = excess,
                capacity = self.max_pending,
                "guard event queue full; oldest events dropped"
            );
        }
        excess
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_flush_error(&self) -> Option<String> {
        self.last_flush_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Flushes everything queued, waiting for an in-flight flush first.
    pub async fn flush_now(&self) -> Result<usize> {
        let _guard = self.flushing.lock().await;
        self.drain().await
    }

    async fn flush_if_idle(&self) -> Result<usize> {
        let Ok(_guard) = self.flushing.try_lock() else {
            return Ok(0);
        };
        self.drain().await
    }

    async fn drain(&self) -> Result<usize> {
        let mut written = 0;
        loop {
            let batch: Vec<GuardEvent> = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                let take = queue.len().min(self.max_batch);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                return Ok(written);
            }
            let count = batch.len();
            match self.write_batch(batch.clone()).await {
                Ok(()) => {
                    written += count;
                    debug!(count, "guard events flushed");
                    self.set_last_error(None);
                }
                Err(err) => {
                    let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                    for event in batch.into_iter().rev() {
                        queue.push_front(event);
                    }
                    self.trim(&mut queue);
                    drop(queue);
                    self.set_last_error(Some(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    async fn write_batch(&self, batch: Vec<GuardEvent>) -> Result<()> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO guard_metrics_events (event_type, level, context, created_at)
                         VALUES (?, ?, ?, ?)",
                    )?;
                    for event in &batch {
                        stmt.execute(params![
                            event.event_type,
                            event.level,
                            serde_json::to_string(&event.context)?,
                            iso(event.timestamp)
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_flush_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Count of persisted events per type within the last `window_minutes`.
    pub async fn summary(&self, window_minutes: i64) -> Result<BTreeMap<String, u64>> {
        let since = iso(Utc::now() - chrono::Duration::minutes(window_minutes));
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_type, COUNT(*) FROM guard_metrics_events
                     WHERE created_at >= ?
                     GROUP BY event_type",
                )?;
                let rows = stmt.query_map(params![since], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;

                let mut summary = BTreeMap::new();
                for row in rows {
                    let (event_type, count) = row?;
                    summary.insert(event_type, count.max(0) as u64);
                }
                Ok(summary)
            })
            .await
    }

    pub async fn multi_window_summary(
        &self,
        windows_minutes: &[i64],
    ) -> Result<BTreeMap<i64, BTreeMap<String, u64>>> {
        let mut result = BTreeMap::new();
        for &window in windows_minutes {
            result.insert(window, self.summary(window).await?);
        }
        Ok(result)
    }

    /// Starts the periodic flusher; it flushes once more when `shutdown` flips.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = this.flush_interval.as_millis() as u64, "guard metrics flusher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.wake.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if let Err(err) = this.flush_now().await {
                                warn!(error = %err, pending = this.pending(), "final guard metrics flush failed");
                            }
                            break;
                        }
                    }
                }
                if let Err(err) = this.flush_if_idle().await {
                    warn!(error = %err, pending = this.pending(), "guard metrics flush failed; will retry");
                }
            }
            info!("guard metrics flusher stopped");
        })
    }
}
