use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use signaling_transport::mux::CongestionControl;
use signaling_transport::mux::mock::{MockConnector, MockStream};
use signaling_transport::test_utils::{RecordingListener, TransportEvent, next_event};
use signaling_transport::{ConnectOptions, QuicTransport, SignalTransport};
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

const TIMEOUT: Duration = Duration::from_millis(500);
const SETTLE: Duration = Duration::from_millis(100);

const URL: &str = "wss://host:1234/path?a=b&c=d";

fn transport_with(
    connector: &Arc<MockConnector>,
    send_on_open: Option<Bytes>,
) -> (
    QuicTransport,
    Arc<RecordingListener>,
    tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) {
    let transport = QuicTransport::new(42, send_on_open, connector.clone());
    let (recorder, rx) = RecordingListener::new();
    transport.connect(URL, "tok", &ConnectOptions::default(), recorder.clone());
    (transport, recorder, rx)
}

#[test(tokio::test)]
async fn connect_fixes_protocol_parameters() {
    let connector = MockConnector::new();
    let (_transport, _recorder, _rx) = transport_with(&connector, None);

    let config = connector.config();
    assert_eq!(config.hostname, "host");
    assert_eq!(config.port, 1234);
    assert_eq!(config.idle_timeout, Duration::from_secs(20));
    assert_eq!(config.max_connections, 1);
    assert_eq!(config.congestion_control, CongestionControl::Bbr2);
    assert!(config.ping_on);
    assert_eq!(config.alpn, "h3");

    let calls = connector.connection().connect_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://host:1234/path?a%3Db%26c%3Dd");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&calls[0].auth).unwrap(),
        json!({ "Authorization": "Bearer tok" })
    );
}

#[test(tokio::test)]
async fn connect_defaults_to_port_443() {
    let connector = MockConnector::new();
    let transport = QuicTransport::new(43, None, connector.clone());
    let (recorder, _rx) = RecordingListener::new();
    transport.connect(
        "wss://signal.example.com/rtc",
        "tok",
        &ConnectOptions::default(),
        recorder,
    );

    assert_eq!(connector.config().port, 443);
}

#[test(tokio::test)]
async fn auth_payload_contains_only_user_agent_without_token() {
    let connector = MockConnector::new();
    let transport = QuicTransport::new(44, None, connector.clone());
    let (recorder, _rx) = RecordingListener::new();
    let options = ConnectOptions {
        user_agent: Some("agentX".to_string()),
    };
    transport.connect(URL, "", &options, recorder);

    let calls = connector.connection().connect_calls();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&calls[0].auth).unwrap(),
        json!({ "User-Agent": "agentX" })
    );
}

#[test(tokio::test)]
async fn invalid_url_reports_failure() {
    let connector = MockConnector::new();
    let transport = QuicTransport::new(45, None, connector.clone());
    let (recorder, mut rx) = RecordingListener::new();
    transport.connect("not a url", "tok", &ConnectOptions::default(), recorder);

    match next_event(&mut rx, TIMEOUT).await {
        Some(TransportEvent::Failure { message, .. }) => {
            assert!(message.contains("invalid url"), "unexpected: {message}");
        }
        other => panic!("expected failure event, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn connector_rejection_reports_failure() {
    let connector = MockConnector::rejecting(-1);
    let (_transport, _recorder, mut rx) = transport_with(&connector, None);

    match next_event(&mut rx, TIMEOUT).await {
        Some(TransportEvent::Failure { code, .. }) => assert_eq!(code, Some(-1)),
        other => panic!("expected failure event, got {other:?}"),
    }
}

#[test(tokio::test)]
async fn send_reports_false_when_stream_rejects_payload() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::rejecting(1, 3));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    assert!(!transport.send(Bytes::from_static(b"rejected")));
}

#[test(tokio::test)]
async fn open_waits_for_connect_result_and_stream() {
    let connector = MockConnector::new();
    let (transport, recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    tokio::time::sleep(SETTLE).await;
    assert_eq!(recorder.events(), vec![]);
    assert!(!transport.send(Bytes::from_static(b"too early")));

    let stream = MockStream::new(1);
    handler.on_stream_created(stream.clone());
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    assert!(transport.send(Bytes::from_static(b"payload")));
    assert_eq!(stream.sent(), vec![Bytes::from_static(b"payload")]);
}

#[test(tokio::test)]
async fn connect_failure_reports_code_and_message() {
    let connector = MockConnector::new();
    let (transport, recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(7, "timeout".to_string());
    match next_event(&mut rx, TIMEOUT).await {
        Some(TransportEvent::Failure { message, code }) => {
            assert_eq!(code, Some(7));
            assert!(message.contains("timeout"), "unexpected: {message}");
        }
        other => panic!("expected failure event, got {other:?}"),
    }

    // the failure was terminal: later native events are dropped
    handler.on_stream_created(MockStream::new(1));
    handler.on_recv_data(Bytes::from_static(b"late"));
    tokio::time::sleep(SETTLE).await;
    assert_eq!(recorder.events().len(), 1);
    assert!(!transport.send(Bytes::from_static(b"dead")));
    assert!(!recorder
        .events()
        .iter()
        .any(|event| *event == TransportEvent::Open));
}

#[test(tokio::test)]
async fn send_on_open_is_transmitted_exactly_once_and_first() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) =
        transport_with(&connector, Some(Bytes::from_static(b"hello-first")));
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    let stream = MockStream::new(1);
    handler.on_stream_created(stream.clone());
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    assert!(transport.send(Bytes::from_static(b"from-caller")));
    assert_eq!(
        stream.sent(),
        vec![
            Bytes::from_static(b"hello-first"),
            Bytes::from_static(b"from-caller"),
        ]
    );

    // a replacement stream does not replay the payload or re-open
    let replacement = MockStream::new(2);
    handler.on_stream_created(replacement.clone());
    tokio::time::sleep(SETTLE).await;
    assert!(replacement.sent().is_empty());
    assert_eq!(next_event(&mut rx, Duration::from_millis(50)).await, None);
}

#[test(tokio::test)]
async fn stream_close_is_matched_by_identity() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    // a close notification for a stream we do not hold is ignored
    handler.on_stream_closed(MockStream::new(2));
    tokio::time::sleep(SETTLE).await;
    assert!(transport.send(Bytes::from_static(b"still open")));

    // matching identity clears the held stream without terminating
    handler.on_stream_closed(MockStream::new(1));
    tokio::time::sleep(SETTLE).await;
    assert!(!transport.send(Bytes::from_static(b"stream gone")));
    assert_eq!(next_event(&mut rx, Duration::from_millis(50)).await, None);
}

#[test(tokio::test)]
async fn recv_data_is_forwarded_and_cmd_is_not() {
    let connector = MockConnector::new();
    let (_transport, recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    handler.on_recv_cmd(Bytes::from_static(b"stats"));
    handler.on_recv_data(Bytes::from_static(b"application bytes"));
    assert_eq!(
        next_event(&mut rx, TIMEOUT).await,
        Some(TransportEvent::Message(Bytes::from_static(
            b"application bytes"
        )))
    );
    assert_eq!(
        recorder.events(),
        vec![
            TransportEvent::Open,
            TransportEvent::Message(Bytes::from_static(b"application bytes")),
        ]
    );
}

#[test(tokio::test)]
async fn native_close_reports_closed_with_reason() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    handler.on_closed(Some("bye".to_string()));
    assert_eq!(
        next_event(&mut rx, TIMEOUT).await,
        Some(TransportEvent::Closed {
            code: 1000,
            reason: "bye".to_string()
        })
    );
    assert!(!transport.send(Bytes::from_static(b"closed")));
}

#[test(tokio::test)]
async fn native_close_without_reason_uses_default() {
    let connector = MockConnector::new();
    let (_transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    handler.on_closed(None);
    assert_eq!(
        next_event(&mut rx, TIMEOUT).await,
        Some(TransportEvent::Closed {
            code: 1000,
            reason: "connection closed".to_string()
        })
    );
}

#[test(tokio::test)]
async fn exception_reports_failure() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    handler.on_exception("boom".to_string());
    match next_event(&mut rx, TIMEOUT).await {
        Some(TransportEvent::Failure { message, code }) => {
            assert_eq!(code, None);
            assert!(message.contains("boom"), "unexpected: {message}");
        }
        other => panic!("expected failure event, got {other:?}"),
    }
    assert!(!transport.send(Bytes::from_static(b"failed")));
}

#[test(tokio::test)]
async fn close_releases_handles_but_still_delivers_closed() {
    let connector = MockConnector::new();
    let (transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    transport.close(1000, "done");
    assert_eq!(connector.connection().close_count(), 1);
    assert!(!transport.send(Bytes::from_static(b"closing")));

    // the library's terminal callback still reaches the listener
    handler.on_closed(Some("closed by client".to_string()));
    assert_eq!(
        next_event(&mut rx, TIMEOUT).await,
        Some(TransportEvent::Closed {
            code: 1000,
            reason: "closed by client".to_string()
        })
    );

    // a second close is a safe no-op
    transport.close(1000, "again");
    assert_eq!(connector.connection().close_count(), 1);
}

#[test(tokio::test)]
async fn cancel_drops_queued_events_and_is_idempotent() {
    let connector = MockConnector::new();
    let (transport, recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    transport.cancel();
    assert_eq!(connector.connection().close_count(), 1);

    handler.on_recv_data(Bytes::from_static(b"late"));
    handler.on_closed(Some("late".to_string()));
    handler.on_exception("late".to_string());
    tokio::time::sleep(SETTLE).await;
    assert_eq!(recorder.events(), vec![TransportEvent::Open]);

    transport.cancel();
    transport.close(1000, "late close");
    assert_eq!(connector.connection().close_count(), 1);
    assert!(!transport.send(Bytes::from_static(b"cancelled")));
}

#[test(tokio::test)]
async fn concurrent_native_events_are_delivered_in_order() {
    let connector = MockConnector::new();
    let (_transport, _recorder, mut rx) = transport_with(&connector, None);
    let handler = connector.handler();

    handler.on_connect_result(0, "ok".to_string());
    handler.on_stream_created(MockStream::new(1));
    assert_eq!(next_event(&mut rx, TIMEOUT).await, Some(TransportEvent::Open));

    const THREADS: usize = 4;
    const PER_THREAD: u8 = 25;
    let barrier = Arc::new(std::sync::Barrier::new(THREADS));
    let mut injectors = Vec::new();
    for thread in 0..THREADS as u8 {
        let handler = handler.clone();
        let barrier = barrier.clone();
        injectors.push(std::thread::spawn(move || {
            barrier.wait();
            for seq in 0..PER_THREAD {
                handler.on_recv_data(Bytes::from(vec![thread, seq]));
            }
        }));
    }
    for injector in injectors {
        injector.join().unwrap();
    }

    // every event arrives exactly once, and each producer's submission order
    // is preserved in the single delivered sequence
    let mut next_seq = [0u8; THREADS];
    for _ in 0..THREADS * PER_THREAD as usize {
        match next_event(&mut rx, TIMEOUT).await {
            Some(TransportEvent::Message(data)) => {
                let thread = data[0] as usize;
                assert_eq!(data[1], next_seq[thread]);
                next_seq[thread] += 1;
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }
    assert_eq!(next_seq, [PER_THREAD; THREADS]);
}
