//! The alert state machine.
//!
//! ```text
//! idle --arm--> arming --countdown 0, location ok--> active
//! arming --disarm before 0--> idle
//! active --cancel, valid credential--> cancelled --grace--> idle
//! active --resolve or auto-resolve--> resolved --grace--> idle
//! ```
//!
//! The controller keeps one slot per originator, so at most one alert per
//! originator is arming or active. Dispatch resolves a location, composes the
//! message, persists the alert, shares it once, then starts the location relay
//! and opens the response log. Every failure leaves the originator either idle
//! (nothing was sent) or active with a warning (something was sent).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{
    Alert, AlertId, AlertStatus, LocationFix, LocationSample, Originator, Priority,
};
use crate::armer::{ArmHandle, CountdownArmer, DEFAULT_HOLD_SECONDS};
use crate::error::{Error, Result};
use crate::guard::{
    CancellationGuard, CancellationPolicy, StoredCredential, CREDENTIAL_METADATA_KEY,
};
use crate::message;
use crate::outbox::{Outbox, PendingWrite};
use crate::relay::{LocationRelay, RelayConfig, RelayContext, RelayStatus};
use crate::responders::ResponderCoordinator;
use crate::services::{AlertStore, LocationError, Services};
use crate::share::{ShareChannel, ShareOutcome};

/// Default time a cancelled or resolved alert stays visible before archive.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on the reverse-geocoding lookup.
pub const DEFAULT_GEOCODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Countdown length used when `arm` is called without one.
    pub hold_seconds: u32,
    /// Delay between a terminal transition and archiving.
    pub grace_period: Duration,
    /// Priority stamped on new alerts.
    pub priority: Priority,
    /// Trusted contact ids the alert is addressed to.
    pub recipients: Vec<String>,
    /// Bound on the place-name lookup.
    pub geocode_timeout: Duration,
    /// Relay settings; the fix timeout also bounds the dispatch fix.
    pub relay: RelayConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hold_seconds: DEFAULT_HOLD_SECONDS,
            grace_period: DEFAULT_GRACE_PERIOD,
            priority: Priority::default(),
            recipients: Vec::new(),
            geocode_timeout: DEFAULT_GEOCODE_TIMEOUT,
            relay: RelayConfig::default(),
        }
    }
}

/// What the caller gets back from a dispatch.
#[derive(Debug, Clone)]
pub struct AlertHandle {
    /// The dispatched alert.
    pub alert: Alert,
    /// How the alert message left the device.
    pub share: ShareOutcome,
    /// Degraded-path notes (store down, no contacts, manual share needed).
    pub warnings: Vec<String>,
}

impl AlertHandle {
    /// The alert id.
    #[must_use]
    pub fn id(&self) -> AlertId {
        self.alert.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveReason {
    Manual,
    Timeout,
}

struct Session {
    alert: Alert,
    relay: LocationRelay,
    auto_resolve: Option<JoinHandle<()>>,
    warnings: Vec<String>,
}

enum Slot {
    Arming(CountdownArmer),
    Dispatching,
    Active(Box<Session>),
    Closing {
        alert: Alert,
        timer: Option<JoinHandle<()>>,
    },
}

impl Slot {
    fn status(&self) -> AlertStatus {
        match self {
            Self::Arming(_) | Self::Dispatching => AlertStatus::Arming,
            Self::Active(_) => AlertStatus::Active,
            Self::Closing { alert, .. } => alert.status,
        }
    }

    fn alert_id(&self) -> Option<AlertId> {
        match self {
            Self::Active(session) => Some(session.alert.id),
            Self::Closing { alert, .. } => Some(alert.id),
            Self::Arming(_) | Self::Dispatching => None,
        }
    }

    /// Abort every task the slot owns.
    fn teardown(self) {
        match self {
            Self::Arming(armer) => {
                armer.cancel();
            }
            Self::Dispatching => {}
            Self::Active(session) => {
                session.relay.stop();
                if let Some(timer) = session.auto_resolve {
                    timer.abort();
                }
            }
            Self::Closing { timer, .. } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
        }
    }
}

/// Clears a `Dispatching` slot if dispatch bails out before installing the
/// active session.
struct DispatchClaim<'a> {
    slots: &'a Mutex<HashMap<String, Slot>>,
    originator_id: String,
    done: bool,
}

impl DispatchClaim<'_> {
    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for DispatchClaim<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(&self.originator_id), Some(Slot::Dispatching)) {
            slots.remove(&self.originator_id);
        }
    }
}

/// Owns alert lifecycles for any number of originators.
pub struct AlertController {
    services: Arc<Services>,
    share: ShareChannel,
    guard: CancellationGuard,
    responders: Arc<ResponderCoordinator>,
    outbox: Arc<Outbox>,
    config: ControllerConfig,
    slots: Mutex<HashMap<String, Slot>>,
    me: Weak<Self>,
}

impl std::fmt::Debug for AlertController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertController")
            .field("config", &self.config)
            .field("slots", &self.slots().len())
            .finish_non_exhaustive()
    }
}

impl AlertController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        services: Arc<Services>,
        share: ShareChannel,
        guard: CancellationGuard,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let outbox = Arc::new(Outbox::new());
        let responders = Arc::new(ResponderCoordinator::new(
            Arc::clone(services.store()),
            Arc::clone(&outbox),
        ));

        Arc::new_cyclic(|me| Self {
            services,
            share,
            guard,
            responders,
            outbox,
            config,
            slots: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Build a guard from the credential persisted in the store.
    ///
    /// When nothing is stored and `initial_password` is given, it becomes the
    /// credential and is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written, or the initial
    /// password is too short.
    pub async fn restore_guard(
        store: &dyn AlertStore,
        policy: CancellationPolicy,
        initial_password: Option<&str>,
    ) -> Result<CancellationGuard> {
        let stored = match store.metadata(CREDENTIAL_METADATA_KEY).await? {
            Some(json) => Some(serde_json::from_str::<StoredCredential>(&json)?),
            None => None,
        };

        let guard = CancellationGuard::from_stored(policy, stored);
        if !guard.is_configured() {
            if let Some(password) = initial_password {
                let credential = guard.set_initial_password(password)?;
                persist_credential(store, &credential).await?;
                info!("Initial cancellation password installed from configuration");
            }
        }
        Ok(guard)
    }

    /// The response coordinator.
    #[must_use]
    pub fn responders(&self) -> &Arc<ResponderCoordinator> {
        &self.responders
    }

    /// The cancellation guard.
    #[must_use]
    pub fn guard(&self) -> &CancellationGuard {
        &self.guard
    }

    /// The controller's write-ahead outbox.
    #[must_use]
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// The controller's settings.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status for an originator.
    #[must_use]
    pub fn status(&self, originator_id: &str) -> AlertStatus {
        self.slots()
            .get(originator_id)
            .map_or(AlertStatus::Idle, Slot::status)
    }

    /// The originator's active alert with its current responses.
    #[must_use]
    pub fn active_alert(&self, originator_id: &str) -> Option<Alert> {
        let alert = match self.slots().get(originator_id) {
            Some(Slot::Active(session)) => session.alert.clone(),
            _ => return None,
        };
        Some(self.with_responses(alert))
    }

    /// Any alert still held by the controller (active or in its grace period).
    #[must_use]
    pub fn alert(&self, alert_id: AlertId) -> Option<Alert> {
        let alert = self.slots().values().find_map(|slot| match slot {
            Slot::Active(session) if session.alert.id == alert_id => Some(session.alert.clone()),
            Slot::Closing { alert, .. } if alert.id == alert_id => Some(alert.clone()),
            _ => None,
        })?;
        Some(self.with_responses(alert))
    }

    /// Warnings recorded when the alert was dispatched.
    #[must_use]
    pub fn warnings(&self, alert_id: AlertId) -> Vec<String> {
        self.slots()
            .values()
            .find_map(|slot| match slot {
                Slot::Active(session) if session.alert.id == alert_id => {
                    Some(session.warnings.clone())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Relay status for an active alert.
    #[must_use]
    pub fn relay_status(&self, alert_id: AlertId) -> Option<RelayStatus> {
        self.with_session(alert_id, |session| session.relay.status())
    }

    /// Relay sample history for an active alert, oldest first.
    #[must_use]
    pub fn relay_history(&self, alert_id: AlertId) -> Vec<LocationSample> {
        self.with_session(alert_id, |session| session.relay.history())
            .unwrap_or_default()
    }

    /// Subscribe to live relay samples for an active alert.
    #[must_use]
    pub fn relay_updates(
        &self,
        alert_id: AlertId,
    ) -> Option<tokio::sync::broadcast::Receiver<LocationSample>> {
        self.with_session(alert_id, |session| session.relay.subscribe())
    }

    fn with_session<R>(&self, alert_id: AlertId, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let slots = self.slots();
        let session = slots.values().find_map(|slot| match slot {
            Slot::Active(session) if session.alert.id == alert_id => Some(session),
            _ => None,
        })?;
        Some(f(session))
    }

    fn with_responses(&self, mut alert: Alert) -> Alert {
        let responses = self.responders.responses(alert.id);
        if !responses.is_empty() {
            alert.responses = responses;
        }
        alert
    }

    /// Start the countdown for an originator. Dispatch follows automatically
    /// unless [`Self::disarm`] is called first.
    ///
    /// # Errors
    ///
    /// Returns an error if the originator already has an arming or active
    /// alert, or the services are shut down.
    pub fn arm(
        &self,
        originator: Originator,
        hold_seconds: Option<u32>,
    ) -> Result<ArmHandle<AlertHandle>> {
        self.services.ensure_running()?;
        let hold = hold_seconds.unwrap_or(self.config.hold_seconds);

        let mut slots = self.slots();
        self.take_slot_for_new_alert(&mut slots, &originator.id)?;

        let armer = CountdownArmer::new();
        let me = self.me.clone();
        let originator_id = originator.id.clone();
        let handle = armer.arm(hold, move || async move {
            let this = me.upgrade().ok_or(Error::ShutDown)?;
            this.dispatch_armed(originator).await
        })?;

        slots.insert(originator_id.clone(), Slot::Arming(armer));
        info!(originator = %originator_id, hold_seconds = hold, "Alert arming");
        Ok(handle)
    }

    /// Skip the rest of the countdown. Returns `false` if not arming.
    pub fn trigger_now(&self, originator_id: &str) -> bool {
        match self.slots().get(originator_id) {
            Some(Slot::Arming(armer)) => armer.trigger_now(),
            _ => false,
        }
    }

    /// Cancel a countdown before it reaches zero. Returns `false` if nothing
    /// was counting (including when dispatch already started).
    pub fn disarm(&self, originator_id: &str) -> bool {
        let mut slots = self.slots();
        let cancelled = match slots.get(originator_id) {
            Some(Slot::Arming(armer)) => armer.cancel(),
            _ => false,
        };
        if cancelled {
            slots.remove(originator_id);
            info!(originator = %originator_id, "Alert disarmed before dispatch");
        }
        cancelled
    }

    /// Dispatch immediately, without a countdown.
    ///
    /// `location` is used when given and valid; otherwise a live fix is
    /// requested, falling back to the provider's last known fix.
    ///
    /// # Errors
    ///
    /// Returns an error, and creates no alert, when no location can be
    /// resolved. Also fails if the originator already has a live alert.
    pub async fn dispatch(
        &self,
        originator: &Originator,
        location: Option<LocationSample>,
    ) -> Result<AlertHandle> {
        self.services.ensure_running()?;
        {
            let mut slots = self.slots();
            self.take_slot_for_new_alert(&mut slots, &originator.id)?;
            slots.insert(originator.id.clone(), Slot::Dispatching);
        }
        self.perform_dispatch(originator, location).await
    }

    async fn dispatch_armed(&self, originator: Originator) -> Result<AlertHandle> {
        {
            let mut slots = self.slots();
            if !matches!(slots.get(&originator.id), Some(Slot::Arming(_))) {
                debug!(originator = %originator.id, "Countdown slot gone, not dispatching");
                return Err(Error::ShutDown);
            }
            slots.insert(originator.id.clone(), Slot::Dispatching);
        }
        self.perform_dispatch(&originator, None).await
    }

    /// Make room for a new alert: fail on a live slot, archive one that is
    /// only waiting out its grace period.
    fn take_slot_for_new_alert(
        &self,
        slots: &mut HashMap<String, Slot>,
        originator_id: &str,
    ) -> Result<()> {
        match slots.get(originator_id) {
            None => Ok(()),
            Some(Slot::Closing { alert, .. }) => {
                let alert_id = alert.id;
                if let Some(slot) = slots.remove(originator_id) {
                    slot.teardown();
                }
                self.responders.close(alert_id);
                debug!(alert_id = %alert_id, "Archived early for a new alert");
                Ok(())
            }
            Some(_) => Err(Error::AlertAlreadyActive {
                originator: originator_id.to_string(),
            }),
        }
    }

    async fn perform_dispatch(
        &self,
        originator: &Originator,
        location: Option<LocationSample>,
    ) -> Result<AlertHandle> {
        let claim = DispatchClaim {
            slots: &self.slots,
            originator_id: originator.id.clone(),
            done: false,
        };

        let sample = match self.resolve_location(location).await {
            Ok(sample) => sample,
            Err(e) => {
                error!(originator = %originator.id, error = %e, "Dispatch aborted: no location");
                return Err(e);
            }
        };
        if !self.still_dispatching(&originator.id) {
            debug!(originator = %originator.id, "Dispatch slot released while locating");
            return Err(Error::ShutDown);
        }

        let place = tokio::time::timeout(
            self.config.geocode_timeout,
            self.services.geocoder().place_name(sample.lat, sample.lng),
        )
        .await
        .unwrap_or_else(|_| {
            debug!("Reverse geocoding timed out, using coordinates");
            None
        });

        let mut fix = LocationFix::from(&sample);
        fix.place_name = place;

        let mut warnings = Vec::new();
        if self.config.recipients.is_empty() {
            let err = Error::config("no trusted contacts configured");
            warn!(originator = %originator.id, "{err}; the alert is still shared");
            warnings.push(err.to_string());
        }

        let alert = Alert {
            id: AlertId::new(),
            originator_id: originator.id.clone(),
            originator_name: originator.name.clone(),
            message: message::alert_message(&originator.name, &fix),
            location: fix,
            status: AlertStatus::Active,
            priority: self.config.priority,
            created_at: Utc::now(),
            resolved_at: None,
            recipients: self.config.recipients.clone(),
            responses: Vec::new(),
        };

        let store = self.services.store();
        if let Err(e) = store.save_alert(&alert).await {
            warn!(alert_id = %alert.id, error = %e, "Alert not stored yet, queued for retry");
            self.outbox.push(PendingWrite::Alert(Box::new(alert.clone())));
            warnings.push(format!("alert not saved yet: {e}"));
        }

        let share = self.share.send(&alert.message).await;
        if !share.is_delivered() {
            warnings.push("message could not be shared automatically; send it manually".to_string());
        }
        self.services.notifier().show_alert(&alert);

        self.responders.open(&alert);
        if let Err(e) = self.responders.attach(alert.id) {
            warn!(alert_id = %alert.id, error = %e, "Could not attach response feed");
        }

        // The relay only starts into a slot that is still ours.
        let mut slots = self.slots();
        let still_claimed = matches!(slots.get(&originator.id), Some(Slot::Dispatching));
        if self.services.ensure_running().is_err() || !still_claimed {
            drop(slots);
            self.responders.close(alert.id);
            warn!(alert_id = %alert.id, "Controller shut down during dispatch, relay not started");
            return Err(Error::ShutDown);
        }

        let relay = LocationRelay::start(
            &alert,
            RelayContext {
                services: Arc::clone(&self.services),
                share: self.share.clone(),
                outbox: Arc::clone(&self.outbox),
            },
            self.config.relay,
        );
        let auto_resolve = self.schedule_auto_resolve(alert.id);

        slots.insert(
            originator.id.clone(),
            Slot::Active(Box::new(Session {
                alert: alert.clone(),
                relay,
                auto_resolve,
                warnings: warnings.clone(),
            })),
        );
        drop(slots);
        claim.complete();

        info!(
            alert_id = %alert.id,
            originator = %originator.id,
            outcome = share.label(),
            "Alert dispatched"
        );
        Ok(AlertHandle {
            alert,
            share,
            warnings,
        })
    }

    fn still_dispatching(&self, originator_id: &str) -> bool {
        self.services.is_running()
            && matches!(self.slots().get(originator_id), Some(Slot::Dispatching))
    }

    async fn resolve_location(&self, given: Option<LocationSample>) -> Result<LocationSample> {
        if let Some(sample) = given {
            if sample.is_valid() {
                return Ok(sample);
            }
            warn!(lat = sample.lat, lng = sample.lng, "Ignoring invalid supplied location");
        }

        let geolocator = self.services.geolocator();
        let live_error = match tokio::time::timeout(
            self.config.relay.fix_timeout,
            geolocator.current_location(),
        )
        .await
        {
            Ok(Ok(sample)) if sample.is_valid() => return Ok(sample),
            Ok(Ok(sample)) => {
                warn!(lat = sample.lat, lng = sample.lng, "Provider returned an invalid fix");
                LocationError::PositionUnavailable(format!(
                    "invalid coordinates ({}, {})",
                    sample.lat, sample.lng
                ))
            }
            Ok(Err(e)) => e,
            Err(_) => LocationError::Timeout,
        };

        match geolocator.last_known() {
            Some(sample) if sample.is_valid() => {
                warn!(error = %live_error, "Live fix failed, using last known location");
                Ok(sample)
            }
            Some(sample) => {
                warn!(lat = sample.lat, lng = sample.lng, "Ignoring invalid last known location");
                Err(Error::LocationUnavailable(live_error))
            }
            None => Err(Error::LocationUnavailable(live_error)),
        }
    }

    fn schedule_auto_resolve(&self, alert_id: AlertId) -> Option<JoinHandle<()>> {
        let minutes = self.guard.policy().auto_resolve_after_minutes;
        if minutes == 0 {
            return None;
        }
        let me = self.me.clone();
        let after = Duration::from_secs(u64::from(minutes) * 60);

        Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(this) = me.upgrade() else { return };
            info!(alert_id = %alert_id, minutes, "Auto-resolving alert");
            if let Err(e) = this.resolve_with(alert_id, ResolveReason::Timeout).await {
                debug!(alert_id = %alert_id, error = %e, "Auto-resolve skipped");
            }
        }))
    }

    /// Cancel an active alert.
    ///
    /// When the policy requires it, the credential must verify. On refusal
    /// the alert stays active and the relay keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on a refused credential, and an error when the
    /// alert is unknown or no longer active.
    pub async fn cancel(&self, alert_id: AlertId, credential: Option<&str>) -> Result<Alert> {
        self.ensure_active(alert_id, "cancel")?;

        if let Err(e) = self.guard.authorize(credential) {
            warn!(alert_id = %alert_id, reason = %e, "Cancellation refused; alert stays active");
            self.services
                .notifier()
                .show_update(alert_id, "Cancellation refused. Your alert is still active.");
            return Err(e.into());
        }

        let alert = self.close_session(alert_id, AlertStatus::Cancelled, true)?;
        let follow_up = message::cancellation_message(&alert.originator_name);
        Ok(self.finish(alert, follow_up).await)
    }

    /// Resolve an active alert manually.
    ///
    /// # Errors
    ///
    /// Returns an error when the alert is unknown or no longer active.
    pub async fn resolve(&self, alert_id: AlertId) -> Result<Alert> {
        self.resolve_with(alert_id, ResolveReason::Manual).await
    }

    async fn resolve_with(&self, alert_id: AlertId, reason: ResolveReason) -> Result<Alert> {
        // The auto-resolve task must not abort itself.
        let alert =
            self.close_session(alert_id, AlertStatus::Resolved, reason == ResolveReason::Manual)?;
        let follow_up = message::resolution_message(&alert.originator_name);
        Ok(self.finish(alert, follow_up).await)
    }

    fn ensure_active(&self, alert_id: AlertId, action: &'static str) -> Result<()> {
        let slots = self.slots();
        match slots.values().find(|slot| slot.alert_id() == Some(alert_id)) {
            Some(Slot::Active(_)) => Ok(()),
            Some(slot) => Err(Error::InvalidTransition {
                from: slot.status(),
                action,
            }),
            None => Err(Error::UnknownAlert(alert_id)),
        }
    }

    /// Move an active session to `Closing`, stopping its relay. Exactly one
    /// caller wins; the rest get an error.
    fn close_session(
        &self,
        alert_id: AlertId,
        status: AlertStatus,
        abort_auto_resolve: bool,
    ) -> Result<Alert> {
        let action = if status == AlertStatus::Cancelled {
            "cancel"
        } else {
            "resolve"
        };

        let mut slots = self.slots();
        let originator_id = slots
            .iter()
            .find(|(_, slot)| slot.alert_id() == Some(alert_id))
            .map(|(originator, _)| originator.clone())
            .ok_or(Error::UnknownAlert(alert_id))?;

        let session = match slots.remove(&originator_id) {
            Some(Slot::Active(session)) => session,
            Some(other) => {
                let from = other.status();
                slots.insert(originator_id, other);
                return Err(Error::InvalidTransition { from, action });
            }
            None => return Err(Error::UnknownAlert(alert_id)),
        };

        let Session {
            mut alert,
            relay,
            auto_resolve,
            ..
        } = *session;
        relay.stop();
        if abort_auto_resolve {
            if let Some(timer) = auto_resolve {
                timer.abort();
            }
        }

        alert.status = status;
        alert.resolved_at = Some(Utc::now());
        slots.insert(
            originator_id,
            Slot::Closing {
                alert: alert.clone(),
                timer: None,
            },
        );
        info!(alert_id = %alert_id, %status, "Alert closed");
        Ok(alert)
    }

    async fn finish(&self, alert: Alert, follow_up: String) -> Alert {
        let store = self.services.store();
        let at = alert.resolved_at.unwrap_or_else(Utc::now);

        self.outbox.flush(store.as_ref()).await;
        if let Err(e) = store.update_status(alert.id, alert.status, at).await {
            warn!(alert_id = %alert.id, error = %e, "Status not stored yet, queued for retry");
            self.outbox.push(PendingWrite::Status {
                alert_id: alert.id,
                status: alert.status,
                at,
            });
        }

        let outcome = self.share.send(&follow_up).await;
        debug!(alert_id = %alert.id, outcome = outcome.label(), "Follow-up shared");
        self.services
            .notifier()
            .show_update(alert.id, &format!("Alert {}", alert.status));

        let me = self.me.clone();
        let alert_id = alert.id;
        let grace = self.config.grace_period;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(this) = me.upgrade() {
                this.archive(alert_id);
            }
        });

        let mut slots = self.slots();
        let slot = slots.values_mut().find_map(|slot| match slot {
            Slot::Closing { alert, timer } if alert.id == alert_id => Some(timer),
            _ => None,
        });
        match slot {
            Some(slot) => *slot = Some(timer),
            // Replaced by a newer alert while the follow-up was in flight.
            None => timer.abort(),
        }
        drop(slots);

        self.with_responses(alert)
    }

    fn archive(&self, alert_id: AlertId) {
        let mut slots = self.slots();
        let originator = slots
            .iter()
            .find(|(_, slot)| matches!(slot, Slot::Closing { alert, .. } if alert.id == alert_id))
            .map(|(originator, _)| originator.clone());

        if let Some(originator) = originator {
            slots.remove(&originator);
            drop(slots);
            self.responders.close(alert_id);
            info!(alert_id = %alert_id, originator = %originator, "Alert archived");
        }
    }

    /// Set the first cancellation password and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if a password already exists, the new one is too
    /// short, or it cannot be persisted.
    pub async fn set_password(&self, new: &str) -> Result<()> {
        let credential = self.guard.set_initial_password(new)?;
        persist_credential(self.services.store().as_ref(), &credential).await
    }

    /// Change the cancellation password and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if `old` does not verify, `new` is too short, or the
    /// credential cannot be persisted.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<()> {
        let credential = self.guard.change_password(old, new)?;
        persist_credential(self.services.store().as_ref(), &credential).await
    }

    /// Stop every relay, countdown and timer. Alerts keep their stored status.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Slot)> = self.slots().drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            if let Some(alert_id) = slot.alert_id() {
                self.responders.close(alert_id);
            }
            slot.teardown();
        }
        info!(sessions = count, "Alert controller shut down");
    }
}

async fn persist_credential(store: &dyn AlertStore, credential: &StoredCredential) -> Result<()> {
    let json = serde_json::to_string(credential)?;
    store.set_metadata(CREDENTIAL_METADATA_KEY, &json).await?;
    Ok(())
}
