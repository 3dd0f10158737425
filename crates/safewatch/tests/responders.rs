//! Responder coordination across the controller, store and subscribers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{sam, Harness, PASSWORD};
use safewatch::alert::{Responder, Response, ResponseKind};

fn recorder() -> (
    Arc<Mutex<Vec<Vec<ResponseKind>>>>,
    impl Fn(&[Response]) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = move |responses: &[Response]| {
        sink.lock()
            .unwrap()
            .push(responses.iter().map(|r| r.kind).collect());
    };
    (seen, callback)
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_sees_responses_in_order() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    let (seen, callback) = recorder();
    let (initial, _subscription) = h
        .controller
        .responders()
        .subscribe(handle.id(), callback)
        .unwrap();
    assert!(initial.is_empty());

    let alex = Responder::new("alex", "Alex");
    let blair = Responder::new("blair", "Blair");
    let responders = h.controller.responders();
    responders
        .respond(handle.id(), &alex, ResponseKind::Acknowledged, None, None)
        .await
        .unwrap();
    responders
        .respond(
            handle.id(),
            &blair,
            ResponseKind::EnRoute,
            Some("10 min".into()),
            None,
        )
        .await
        .unwrap();

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last, vec![ResponseKind::Acknowledged, ResponseKind::EnRoute]);

    let alert = h.controller.active_alert("sam").unwrap();
    assert_eq!(alert.responses.len(), 2);
    assert_eq!(alert.responses[1].responder_name, "Blair");
}

#[tokio::test(start_paused = true)]
async fn test_interleaved_responders_keep_invocation_order() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    let responders = h.controller.responders();

    let people: Vec<Responder> = (0..4)
        .map(|i| Responder::new(format!("r{i}"), format!("Responder {i}")))
        .collect();
    let mut expected = Vec::new();
    for round in 0..3 {
        for person in &people {
            let kind = ResponseKind::ALL[round];
            responders
                .respond(handle.id(), person, kind, None, None)
                .await
                .unwrap();
            expected.push((person.id.clone(), kind));
        }
    }

    let got: Vec<_> = responders
        .responses(handle.id())
        .into_iter()
        .map(|r| (r.responder_id, r.kind))
        .collect();
    assert_eq!(got, expected);

    let stored: Vec<_> = h
        .store
        .inner
        .load_responses(handle.id())
        .unwrap()
        .into_iter()
        .map(|r| (r.responder_id, r.kind))
        .collect();
    assert_eq!(stored, expected);
}

#[tokio::test(start_paused = true)]
async fn test_remote_response_reaches_subscriber() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    let (seen, callback) = recorder();
    let _subscription = h
        .controller
        .responders()
        .subscribe(handle.id(), callback)
        .unwrap();

    // Written by another device straight into the shared store.
    let remote = Response::new(
        handle.id(),
        &Responder::new("kim", "Kim"),
        ResponseKind::Arrived,
        None,
        None,
    );
    h.store.inner.write_response(&remote).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        seen.lock().unwrap().last().cloned().unwrap(),
        vec![ResponseKind::Arrived]
    );
}

#[tokio::test(start_paused = true)]
async fn test_response_while_offline_is_kept_and_synced() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    let alex = Responder::new("alex", "Alex");

    h.store.set_offline(true);
    h.controller
        .responders()
        .respond(handle.id(), &alex, ResponseKind::Acknowledged, None, None)
        .await
        .unwrap();
    assert_eq!(h.controller.responders().responses(handle.id()).len(), 1);
    assert!(h.store.inner.load_responses(handle.id()).unwrap().is_empty());

    h.store.set_offline(false);
    let merged = h.controller.responders().reconcile(handle.id()).await.unwrap();
    assert_eq!(merged, 0);
    assert_eq!(h.store.inner.load_responses(handle.id()).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_callback_is_not_called() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    let (seen, callback) = recorder();
    let (_, subscription) = h
        .controller
        .responders()
        .subscribe(handle.id(), callback)
        .unwrap();

    assert!(subscription.unsubscribe());
    assert!(!subscription.unsubscribe());

    h.controller
        .responders()
        .respond(
            handle.id(),
            &Responder::new("alex", "Alex"),
            ResponseKind::Safe,
            None,
            None,
        )
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_responses_rejected_after_archive() {
    let h = Harness::new();
    let handle = h.controller.dispatch(&sam(), None).await.unwrap();
    h.controller.cancel(handle.id(), Some(PASSWORD)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    let err = h
        .controller
        .responders()
        .respond(
            handle.id(),
            &Responder::new("alex", "Alex"),
            ResponseKind::Acknowledged,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, safewatch::Error::UnknownAlert(_)));
}
