//! Alert lifecycle: arming, dispatch, cancellation and resolution.

mod common;

use std::time::Duration;

use common::{sam, san_francisco, Harness, ScriptedLocator, PASSWORD};
use safewatch::alert::AlertStatus;
use safewatch::armer::ArmOutcome;
use safewatch::guard::CancellationPolicy;
use safewatch::message::ALERT_HEADER;
use safewatch::services::LocationError;
use safewatch::Error;

#[tokio::test(start_paused = true)]
async fn test_armed_alert_dispatches_after_hold() {
    let h = Harness::new();
    let handle = h.controller.arm(sam(), Some(3)).unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(h.controller.status("sam"), AlertStatus::Active);

    let ArmOutcome::Dispatched(alert) = handle.outcome().await else {
        panic!("alert was not dispatched");
    };
    assert!(alert
        .alert
        .message
        .contains("Coordinates: 37.774900, -122.419400"));
    assert!(alert.share.is_delivered());
    assert!(alert.warnings.is_empty());
    assert_eq!(h.native.count_containing(ALERT_HEADER), 1);
    assert_eq!(h.notifier.alert_count(), 1);

    let stored = h.stored(alert.id()).unwrap();
    assert_eq!(stored.status, AlertStatus::Active);
    assert_eq!(stored.recipients, vec!["alex".to_string(), "blair".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_countdown_has_no_side_effects() {
    let h = Harness::new();
    let handle = h.controller.arm(sam(), Some(3)).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.controller.disarm("sam"));
    assert!(matches!(handle.outcome().await, ArmOutcome::Cancelled));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.controller.status("sam"), AlertStatus::Idle);
    assert!(h.native.sent().is_empty());
    assert_eq!(h.notifier.alert_count(), 0);
    assert!(h.store.inner.load_recent(10).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disarm_before_zero_prevents_dispatch_for_any_hold() {
    for hold in [1_u32, 2, 5, 10] {
        let h = Harness::new();
        let handle = h.controller.arm(sam(), Some(hold)).unwrap();

        tokio::time::sleep(Duration::from_millis(u64::from(hold) * 1000 - 500)).await;
        assert!(h.controller.disarm("sam"), "hold {hold}");
        assert!(!handle.outcome().await.is_dispatched(), "hold {hold}");
        assert!(h.native.sent().is_empty(), "hold {hold}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_disarm_after_dispatch_is_a_no_op() {
    let h = Harness::new();
    let handle = h.controller.arm(sam(), Some(2)).unwrap();
    let outcome = handle.outcome().await;
    assert!(outcome.is_dispatched());

    assert!(!h.controller.disarm("sam"));
    assert_eq!(h.controller.status("sam"), AlertStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_trigger_dispatches_once() {
    let h = Harness::new();
    let handle = h.controller.arm(sam(), Some(30)).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for _ in 0..5 {
        h.controller.trigger_now("sam");
    }
    assert!(handle.outcome().await.is_dispatched());

    for _ in 0..5 {
        h.controller.trigger_now("sam");
    }
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.native.count_containing(ALERT_HEADER), 1);
    assert_eq!(h.store.inner.load_recent(10).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_live_alert_per_originator() {
    let h = Harness::new();
    h.controller.dispatch(&sam(), None).await.unwrap();

    let err = h.controller.arm(sam(), None).unwrap_err();
    assert!(matches!(err, Error::AlertAlreadyActive { .. }));
    let err = h.controller.dispatch(&sam(), None).await.unwrap_err();
    assert!(matches!(err, Error::AlertAlreadyActive { .. }));

    // Another originator is independent.
    let other = safewatch::Originator::new("kim", "Kim");
    h.controller.dispatch(&other, None).await.unwrap();
    assert_eq!(h.controller.status("kim"), AlertStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_password_is_rejected_and_alert_stays_active() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();

    let err = h
        .controller
        .cancel(handle.id(), Some("wrong"))
        .await
        .unwrap_err();
    assert!(err.is_auth_error());
    assert_eq!(h.controller.status("sam"), AlertStatus::Active);
    assert_eq!(h.stored(handle.id()).unwrap().status, AlertStatus::Active);
    assert!(h
        .notifier
        .updates()
        .iter()
        .any(|text| text.contains("refused")));

    let err = h.controller.cancel(handle.id(), None).await.unwrap_err();
    assert!(err.is_auth_error());
    assert_eq!(h.controller.guard().failed_attempts(), 2);

    // The relay keeps running.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.controller.relay_status(handle.id()).unwrap().samples, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_password_closes_alert() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();

    let alert = h.controller.cancel(handle.id(), Some(PASSWORD)).await.unwrap();
    assert_eq!(alert.status, AlertStatus::Cancelled);

    let stored = h.stored(handle.id()).unwrap();
    assert_eq!(stored.status, AlertStatus::Cancelled);
    assert!(stored.resolved_at.is_some());
    assert_eq!(h.native.count_containing("cancelled their emergency alert"), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.controller.status("sam"), AlertStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_password_when_not_required() {
    let h = Harness::builder()
        .policy(CancellationPolicy {
            require_password_on_cancel: false,
            ..CancellationPolicy::default()
        })
        .build();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();

    let alert = h.controller.cancel(handle.id(), None).await.unwrap();
    assert_eq!(alert.status, AlertStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_resolve_is_terminal() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();

    h.controller.resolve(handle.id()).await.unwrap();
    assert_eq!(h.stored(handle.id()).unwrap().status, AlertStatus::Resolved);
    assert_eq!(h.native.count_containing("marked safe"), 1);

    let err = h.controller.resolve(handle.id()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: AlertStatus::Resolved,
            ..
        }
    ));
    let err = h
        .controller
        .cancel(handle.id(), Some(PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_auto_resolve_after_configured_minutes() {
    let h = Harness::builder()
        .policy(CancellationPolicy {
            auto_resolve_after_minutes: 5,
            ..CancellationPolicy::default()
        })
        .build();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();

    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    assert_eq!(h.controller.status("sam"), AlertStatus::Active);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.stored(handle.id()).unwrap().status, AlertStatus::Resolved);
}

#[tokio::test(start_paused = true)]
async fn test_no_location_means_no_alert() {
    let h = Harness::builder()
        .locator(ScriptedLocator::failing(LocationError::PermissionDenied))
        .build();

    let err = h.controller.dispatch(&sam(), None).await.unwrap_err();
    assert!(err.is_permission_error());
    assert_eq!(h.controller.status("sam"), AlertStatus::Idle);
    assert!(h.native.sent().is_empty());
    assert!(h.store.inner.load_recent(10).unwrap().is_empty());

    // An armed alert fails the same way and frees the slot.
    let handle = h.controller.arm(sam(), Some(1)).unwrap();
    assert!(matches!(handle.outcome().await, ArmOutcome::Failed(_)));
    assert_eq!(h.controller.status("sam"), AlertStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_last_known_location() {
    let h = Harness::builder()
        .locator(
            ScriptedLocator::failing(LocationError::Timeout).with_last_known(san_francisco()),
        )
        .build();

    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    assert!(handle
        .alert
        .message
        .contains("Coordinates: 37.774900, -122.419400"));
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_degrades_to_warning() {
    let h = Harness::new();
    h.store.set_offline(true);

    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    assert_eq!(handle.alert.status, AlertStatus::Active);
    assert!(handle.warnings.iter().any(|w| w.contains("not saved")));
    assert_eq!(h.native.count_containing(ALERT_HEADER), 1);
    assert!(h.controller.outbox().pending_for(handle.id()) > 0);

    h.store.set_offline(false);
    h.controller.cancel(handle.id(), Some(PASSWORD)).await.unwrap();

    let stored = h.stored(handle.id()).unwrap();
    assert_eq!(stored.status, AlertStatus::Cancelled);
    assert_eq!(h.controller.outbox().pending_for(handle.id()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_contacts_is_a_warning() {
    let h = Harness::builder()
        .config(|config| config.recipients.clear())
        .build();

    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    assert_eq!(handle.alert.status, AlertStatus::Active);
    assert!(handle.warnings.iter().any(|w| w.contains("trusted contacts")));
}

#[tokio::test(start_paused = true)]
async fn test_password_change_persists() {
    let h = Harness::new();
    h.controller.change_password(PASSWORD, "new-secret").await.unwrap();

    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    assert!(h.controller.cancel(handle.id(), Some(PASSWORD)).await.is_err());
    h.controller
        .cancel(handle.id(), Some("new-secret"))
        .await
        .unwrap();

    let json = h
        .store
        .inner
        .get_metadata(safewatch::guard::CREDENTIAL_METADATA_KEY)
        .unwrap()
        .unwrap();
    assert!(!json.contains("new-secret"));
}
