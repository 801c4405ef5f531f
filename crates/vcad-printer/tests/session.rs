mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use vcad_printer::{
    params, ConnError, Error, PrintState, ReportEnvelope, SendError, SubError, TlsPolicy,
};

use common::{deadline, printer, EchoTransport, StalledTransport, DEVICE_ID};

const REPORT_TOPIC: &str = "device/01P00C490700226/report";
const REQUEST_TOPIC: &str = "device/01P00C490700226/request";

fn collector() -> (Arc<Mutex<Vec<ReportEnvelope>>>, impl Fn(ReportEnvelope) + Send + Sync) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    (reports, move |report| sink.lock().push(report))
}

#[tokio::test]
async fn test_round_trip_through_echoing_broker() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);

    printer.connect(deadline()).await.unwrap();
    assert!(printer.is_connected());

    let (reports, handler) = collector();
    printer.subscribe_reports(handler, deadline()).await.unwrap();
    assert_eq!(broker.subscriptions(), vec![REPORT_TOPIC.to_string()]);

    for _ in 0..3 {
        printer
            .send("print", "pause", params! { "param" => "" }, deadline())
            .await
            .unwrap();
    }

    let reports = reports.lock().clone();
    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.category, "print");
        assert_eq!(report.command, "pause");
        assert_eq!(report.sequence_id, i.to_string());
        assert!(report.succeeded());
        assert_eq!(report.field("param"), Some(&serde_json::json!("")));
    }

    let published = broker.published();
    assert!(published.iter().all(|(topic, _)| topic == REQUEST_TOPIC));
}

#[tokio::test]
async fn test_session_uses_lan_credentials_and_pinned_root() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    let opened = broker.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].username, "bblp");
    assert_eq!(opened[0].password, "74462393");
    assert_eq!(opened[0].port, 8883);
    match &opened[0].tls {
        TlsPolicy::Pinned(verifier) => assert_eq!(verifier.device_id(), DEVICE_ID),
        TlsPolicy::PublicRoots => panic!("LAN session must pin its root"),
    }
}

#[tokio::test]
async fn test_connect_deadline_reports_timeout() {
    let printer = printer(Arc::new(StalledTransport));

    let started = Instant::now();
    let err = printer
        .connect(Instant::now() + Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conn(ConnError::Timeout)));
    assert!(!printer.is_connected());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_malformed_report_is_dropped_and_subscription_survives() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    let (reports, handler) = collector();
    printer.subscribe_reports(handler, deadline()).await.unwrap();

    broker.inject(REPORT_TOPIC, b"not json");
    broker.inject(REPORT_TOPIC, b"[1, 2, 3]");
    assert!(reports.lock().is_empty());

    printer.pause(deadline()).await.unwrap();
    assert_eq!(reports.lock().len(), 1);
}

#[tokio::test]
async fn test_unsolicited_report_reaches_handler() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    let (reports, handler) = collector();
    printer.subscribe_reports(handler, deadline()).await.unwrap();

    broker.inject(
        REPORT_TOPIC,
        br#"{"print":{"command":"push_status","sequence_id":"2021","mc_percent":50}}"#,
    );

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].command, "push_status");
    assert_eq!(reports[0].field("mc_percent"), Some(&serde_json::json!(50)));
}

#[tokio::test]
async fn test_reconnect_continues_sequence_and_drops_subscriptions() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);

    printer.connect(deadline()).await.unwrap();
    printer.pause(deadline()).await.unwrap();
    printer.disconnect().await;
    printer.disconnect().await;
    assert!(!printer.is_connected());

    assert!(matches!(
        printer.resume(deadline()).await,
        Err(Error::Send(SendError::NotConnected))
    ));

    printer.connect(deadline()).await.unwrap();
    let (reports, handler) = collector();
    printer.subscribe_reports(handler, deadline()).await.unwrap();
    printer.resume(deadline()).await.unwrap();

    let ids: Vec<_> = broker
        .published()
        .iter()
        .map(|(_, request)| request["print"]["sequence_id"].clone())
        .collect();
    assert_eq!(ids, vec![serde_json::json!("0"), serde_json::json!("1")]);
    // Only the handler bound after reconnecting saw the second request.
    assert_eq!(reports.lock().len(), 1);
}

#[tokio::test]
async fn test_subscribe_requires_connection() {
    let (transport, _broker) = EchoTransport::new();
    let printer = printer(transport);

    let (_, handler) = collector();
    let err = printer.subscribe_reports(handler, deadline()).await.unwrap_err();
    assert!(matches!(err, Error::Sub(SubError::NotConnected)));
}

#[tokio::test]
async fn test_status_after_full_push() {
    let (transport, _broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    let status = printer.status(deadline()).await.unwrap();
    assert_eq!(status.state, PrintState::Idle);
    assert_eq!(status.bed_temp, 22.5);
    assert_eq!(printer.last_status(), Some(status));
}

#[tokio::test]
async fn test_watch_status_streams_deltas() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    let mut updates = printer.watch_status(deadline()).await.unwrap();
    // A second watcher shares the same subscription.
    let _second = printer.watch_status(deadline()).await.unwrap();
    assert_eq!(broker.subscriptions().len(), 1);

    broker.inject(
        REPORT_TOPIC,
        br#"{"print":{"command":"push_status","gcode_state":"RUNNING","mc_percent":"12"}}"#,
    );
    broker.inject(
        REPORT_TOPIC,
        br#"{"print":{"command":"pause","result":"success"}}"#,
    );
    broker.inject(
        REPORT_TOPIC,
        br#"{"print":{"command":"push_status","mc_percent":13}}"#,
    );

    let first = updates.recv().await.unwrap();
    assert_eq!(first.state, PrintState::Printing);
    assert_eq!(first.progress_percent, 12.0);

    let second = updates.recv().await.unwrap();
    assert_eq!(second.state, PrintState::Printing);
    assert_eq!(second.progress_percent, 13.0);
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn test_typed_requests_on_the_wire() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();

    printer.set_speed(9, deadline()).await.unwrap();
    printer.set_light(true, deadline()).await.unwrap();
    printer.set_nozzle_temp(220, deadline()).await.unwrap();

    let published = broker.published();
    assert_eq!(published[0].1["print"]["command"], "print_speed");
    assert_eq!(published[0].1["print"]["param"], "4");
    assert_eq!(published[1].1["system"]["led_mode"], "on");
    assert_eq!(published[2].1["print"]["param"], "M104 S220");
    assert_eq!(published[2].1["print"]["sequence_id"], "2");
}

#[tokio::test]
async fn test_status_feed_resumes_after_lost_connection() {
    let (transport, broker) = EchoTransport::new();
    let printer = printer(transport);
    printer.connect(deadline()).await.unwrap();
    let _first = printer.watch_status(deadline()).await.unwrap();

    broker.drop_connection();
    assert!(!printer.is_connected());
    assert!(matches!(
        printer.pause(deadline()).await,
        Err(Error::Send(SendError::NotConnected))
    ));

    printer.connect(deadline()).await.unwrap();
    let mut updates = printer.watch_status(deadline()).await.unwrap();
    assert_eq!(broker.subscriptions().len(), 2);

    broker.inject(
        REPORT_TOPIC,
        br#"{"print":{"command":"push_status","gcode_state":"PAUSE"}}"#,
    );
    assert_eq!(updates.recv().await.unwrap().state, PrintState::Paused);
}
