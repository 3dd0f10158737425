//! Periodic location broadcast for one active alert.
//!
//! The relay samples the geolocator on a fixed interval until stopped. Each
//! sample is recorded in a bounded history, pushed to live subscribers,
//! appended to the store's trail and sent to contacts as an update message.
//! A failed sample is logged and skipped; the relay keeps going.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertId, LocationSample};
use crate::error::{Error, Result};
use crate::message;
use crate::outbox::{Outbox, PendingWrite};
use crate::services::{LocationError, Services};
use crate::share::ShareChannel;

/// Default sampling interval.
pub const DEFAULT_RELAY_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of samples kept in memory.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// Default bound on a single location fix.
pub const DEFAULT_FIX_TIMEOUT: Duration = Duration::from_secs(10);

const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Relay timing and buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Time between samples.
    pub interval: Duration,
    /// Ring buffer size.
    pub history_capacity: usize,
    /// Bound on each location request.
    pub fix_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RELAY_INTERVAL,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            fix_timeout: DEFAULT_FIX_TIMEOUT,
        }
    }
}

/// Collaborators a relay uses on every tick.
#[derive(Debug, Clone)]
pub struct RelayContext {
    /// Injected services (geolocator and store).
    pub services: Arc<Services>,
    /// Where update messages go.
    pub share: ShareChannel,
    /// Queue for trail writes the store could not take.
    pub outbox: Arc<Outbox>,
}

/// Point-in-time view of a relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayStatus {
    /// Whether the relay is still sampling.
    pub running: bool,
    /// Samples recorded since start.
    pub samples: u64,
    /// Ticks that failed.
    pub failures: u64,
    /// Most recent sample.
    pub last: Option<LocationSample>,
}

#[derive(Debug)]
struct Track {
    running: bool,
    history: VecDeque<LocationSample>,
}

#[derive(Debug)]
struct RelayShared {
    track: Mutex<Track>,
    capacity: usize,
    updates: broadcast::Sender<LocationSample>,
    samples: AtomicU64,
    failures: AtomicU64,
}

impl RelayShared {
    fn track(&self) -> MutexGuard<'_, Track> {
        self.track.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.track().running
    }

    /// Record a sample unless the relay has been stopped. The running check
    /// and the append happen under one lock so nothing lands after `stop`.
    fn record(&self, sample: &LocationSample) -> bool {
        let mut track = self.track();
        if !track.running {
            return false;
        }
        if track.history.len() == self.capacity {
            track.history.pop_front();
        }
        track.history.push_back(sample.clone());
        self.samples.fetch_add(1, Ordering::SeqCst);
        let _ = self.updates.send(sample.clone());
        true
    }
}

/// A running (or stopped) location relay bound to one alert.
#[derive(Debug)]
pub struct LocationRelay {
    alert_id: AlertId,
    shared: Arc<RelayShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocationRelay {
    /// Start relaying for `alert`. The first sample is taken one interval
    /// after start; the dispatch fix covers time zero.
    #[must_use]
    pub fn start(alert: &Alert, ctx: RelayContext, config: RelayConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let shared = Arc::new(RelayShared {
            track: Mutex::new(Track {
                running: true,
                history: VecDeque::with_capacity(config.history_capacity),
            }),
            capacity: config.history_capacity.max(1),
            updates,
            samples: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let task = tokio::spawn(run(
            Arc::clone(&shared),
            ctx,
            config,
            alert.id,
            alert.originator_name.clone(),
        ));

        info!(alert_id = %alert.id, interval_secs = config.interval.as_secs(), "Location relay started");
        Self {
            alert_id: alert.id,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// The alert this relay serves.
    #[must_use]
    pub fn alert_id(&self) -> AlertId {
        self.alert_id
    }

    /// Stop sampling. Returns `true` only for the call that stopped it.
    pub fn stop(&self) -> bool {
        let was_running = std::mem::replace(&mut self.shared.track().running, false);

        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        if was_running {
            info!(
                alert_id = %self.alert_id,
                samples = self.sample_count(),
                "Location relay stopped"
            );
        }
        was_running
    }

    /// Whether the relay is still sampling.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Samples in the ring buffer, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<LocationSample> {
        self.shared.track().history.iter().cloned().collect()
    }

    /// The most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<LocationSample> {
        self.shared.track().history.back().cloned()
    }

    /// Live sample stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LocationSample> {
        self.shared.updates.subscribe()
    }

    /// Samples recorded since start.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.shared.samples.load(Ordering::SeqCst)
    }

    /// Ticks that failed since start.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Snapshot for status display.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            running: self.is_running(),
            samples: self.sample_count(),
            failures: self.failure_count(),
            last: self.latest(),
        }
    }
}

impl Drop for LocationRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    shared: Arc<RelayShared>,
    ctx: RelayContext,
    config: RelayConfig,
    alert_id: AlertId,
    originator_name: String,
) {
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !shared.is_running() {
            break;
        }

        if let Err(e) = tick(&shared, &ctx, &config, alert_id, &originator_name).await {
            let failures = shared.failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(alert_id = %alert_id, failures, error = %e, "Relay sample skipped");
        }
    }
}

async fn tick(
    shared: &RelayShared,
    ctx: &RelayContext,
    config: &RelayConfig,
    alert_id: AlertId,
    originator_name: &str,
) -> Result<()> {
    let sample = tokio::time::timeout(
        config.fix_timeout,
        ctx.services.geolocator().current_location(),
    )
    .await
    .map_err(|_| LocationError::Timeout)
    .and_then(|fix| fix)
    .and_then(|fix| {
        if fix.is_valid() {
            Ok(fix)
        } else {
            Err(LocationError::PositionUnavailable(format!(
                "invalid coordinates ({}, {})",
                fix.lat, fix.lng
            )))
        }
    })
    .map_err(Error::LocationUnavailable)?;

    if !shared.record(&sample) {
        return Ok(());
    }
    debug!(alert_id = %alert_id, lat = sample.lat, lng = sample.lng, "Relay sample recorded");

    let store = ctx.services.store();
    ctx.outbox.flush(store.as_ref()).await;
    if let Err(e) = store.append_location(alert_id, &sample).await {
        warn!(alert_id = %alert_id, error = %e, "Trail write failed, queued for retry");
        ctx.outbox.push(PendingWrite::Location {
            alert_id,
            sample: sample.clone(),
        });
    }

    if !shared.is_running() {
        return Ok(());
    }
    let outcome = ctx
        .share
        .send(&message::update_message(originator_name, &sample))
        .await;
    debug!(alert_id = %alert_id, outcome = outcome.label(), "Relay update shared");
    Ok(())
}
