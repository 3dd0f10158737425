//! Notifier that writes to the tracing log.

use tracing::{info, warn};

use super::Notifier;
use crate::alert::{Alert, AlertId};

/// Logs notifications instead of raising desktop popups.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_alert(&self, alert: &Alert) {
        warn!(
            alert_id = %alert.id,
            originator = %alert.originator_name,
            priority = %alert.priority,
            location = %alert.location.place_or_coordinates(),
            "Emergency alert dispatched"
        );
    }

    fn show_update(&self, alert_id: AlertId, text: &str) {
        info!(alert_id = %alert_id, "{text}");
    }
}
