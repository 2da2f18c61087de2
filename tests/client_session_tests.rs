//! End-to-end session behaviour against local mock servers.

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, mpsc},
    thread,
    time::Duration,
};

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use telemetry_uplink::{
    AddEventsRequest, ClientSession, DEFAULT_MAX_REQUEST_SIZE, JsonMap, RequestError, SendStatus,
    SessionConfig, TimestampGenerator, session::SecondsProvider,
};

#[fixture]
fn tcp_listener() -> TcpListener {
    TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener")
}

fn object(value: Value) -> JsonMap {
    value.as_object().cloned().expect("JSON object literal")
}

fn mock_clock(start: f64) -> (Arc<Mutex<f64>>, SecondsProvider) {
    let state = Arc::new(Mutex::new(start));
    let reader = Arc::clone(&state);
    (state, Box::new(move || *reader.lock().expect("clock lock")))
}

fn set_clock(state: &Arc<Mutex<f64>>, now: f64) {
    *state.lock().expect("clock lock") = now;
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Vec<u8>> {
    let mut captured = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        captured.extend_from_slice(line.as_bytes());
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().ok()?;
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).ok()?;
    captured.extend_from_slice(&body);
    Some(captured)
}

/// Serve one `Vec<response>` per accepted connection, capturing every
/// request's raw bytes.
fn spawn_server(
    listener: TcpListener,
    connections: Vec<Vec<Vec<u8>>>,
) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
    let addr = listener.local_addr().expect("listener has address");
    let (request_tx, request_rx) = mpsc::channel();
    thread::spawn(move || {
        for responses in connections {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            for response in responses {
                let Some(request) = read_request(&mut reader) else {
                    break;
                };
                if request_tx.send(request).is_err() {
                    return;
                }
                if reader.get_mut().write_all(&response).is_err() {
                    return;
                }
            }
        }
    });
    (addr, request_rx)
}

fn http_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn success_body() -> Vec<u8> {
    http_response(r#"{"status":"success"}"#)
}

fn empty_body() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
}

/// Session against `addr` with a controllable clock and a deterministic
/// timestamp generator.
fn session_at(addr: SocketAddr, start: f64) -> (ClientSession, Arc<Mutex<f64>>) {
    let (state, clock) = mock_clock(start);
    let config = SessionConfig::new(format!("http://{addr}"), "fakeToken")
        .with_agent_version("2.1.4")
        .with_request_timeout(Duration::from_secs(2))
        .quiet();
    let timestamps = Arc::new(TimestampGenerator::with_provider(Box::new(|| 0)));
    let session = ClientSession::with_clock(config, timestamps, clock).expect("valid address");
    (session, state)
}

fn seeded_request(session: &ClientSession) -> AddEventsRequest {
    let mut request = session
        .new_request(None, DEFAULT_MAX_REQUEST_SIZE)
        .expect("base fields are valid");
    request
        .add_event(&object(json!({"message": "disk usage at 81%"})), None)
        .expect("open request");
    request
}

fn split_request(raw: &[u8]) -> (String, Value) {
    let pos = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8(raw[..pos + 4].to_vec()).expect("headers are UTF-8");
    let body = serde_json::from_slice(&raw[pos + 4..]).expect("body is JSON");
    (head, body)
}

#[rstest]
fn successful_sends_reuse_one_connection(tcp_listener: TcpListener) {
    let (addr, request_rx) = spawn_server(tcp_listener, vec![vec![success_body(), success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    for _ in 0..2 {
        let mut request = seeded_request(&session);
        let result = session.send(&mut request).expect("send is well-formed");
        assert_eq!(result.status, SendStatus::Success);
        assert_eq!(result.response, r#"{"status":"success"}"#);
        assert!(result.bytes_sent > 0);
    }

    let stats = session.stats();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.requests_failed, 0);
    assert_eq!(stats.connections_created, 1);
    assert_eq!(session.last_success(), Some(1_000.0));
    assert_eq!(request_rx.iter().take(2).count(), 2);
}

#[rstest]
fn requests_carry_identity_headers_and_stamped_events(tcp_listener: TcpListener) {
    let (addr, request_rx) = spawn_server(tcp_listener, vec![vec![success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let info = object(json!({"serverHost": "frontend-1"}));
    let mut request = session
        .new_request(Some(&info), DEFAULT_MAX_REQUEST_SIZE)
        .expect("base fields are valid");
    request
        .add_event(&object(json!({"message": "disk usage at 81%"})), None)
        .expect("open request");
    session.send(&mut request).expect("send is well-formed");

    let raw = request_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("request captured");
    let (head, body) = split_request(&raw);
    assert!(head.starts_with("POST /addEvents HTTP/1.1\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("Accept: application/json\r\n"));
    let user_agent = head
        .lines()
        .find(|line| line.starts_with("User-Agent: "))
        .expect("User-Agent header present");
    assert!(user_agent.contains(";agent-2.1.4;"));
    assert!(user_agent.ends_with(";nossllib;"));

    assert_eq!(body["token"], "fakeToken");
    assert_eq!(body["session"], session.session_id());
    assert_eq!(body["sessionInfo"]["serverHost"], "frontend-1");
    assert_eq!(body["client_time"], 1_000);
    assert_eq!(body["threads"], json!([]));
    assert_eq!(body["events"][0]["message"], "disk usage at 81%");
    assert_eq!(body["events"][0]["ts"], "1");
}

#[rstest]
fn empty_response_fails_the_send_and_arms_the_cooldown(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(tcp_listener, vec![vec![empty_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::EmptyResponse);
    assert!(result.response.is_empty());
    assert!(result.bytes_sent > 0);

    let stats = session.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.requests_failed, 1);

    let mut retry = seeded_request(&session);
    let result = session.send(&mut retry).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ConnectionClosed);
    assert_eq!(result.bytes_sent, 0);
    assert_eq!(session.stats().requests_sent, 1);
}

#[rstest]
fn unparseable_response_is_classified(tcp_listener: TcpListener) {
    let (addr, _request_rx) =
        spawn_server(tcp_listener, vec![vec![http_response("<html>oops</html>")]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ParseResponseFailed);
    assert_eq!(result.response, "<html>oops</html>");
    assert_eq!(session.last_success(), None);
}

#[rstest]
fn response_without_a_status_field_is_unknown(tcp_listener: TcpListener) {
    let (addr, _request_rx) =
        spawn_server(tcp_listener, vec![vec![http_response(r#"{"message":"hi"}"#)]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::UnknownError);
    assert_eq!(session.last_success(), Some(1_000.0));
}

#[rstest]
fn server_status_codes_pass_through_verbatim(tcp_listener: TcpListener) {
    let body = r#"{"status":"error/client/badParam","message":"bad api key"}"#;
    let (addr, _request_rx) = spawn_server(tcp_listener, vec![vec![http_response(body)]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(
        result.status,
        SendStatus::ServerError("error/client/badParam".to_string())
    );
    assert_eq!(result.status.as_str(), "error/client/badParam");
    assert!(!result.status.is_success());
    assert_eq!(session.stats().requests_failed, 1);
    assert_eq!(session.last_success(), Some(1_000.0));
}

#[rstest]
fn cooldown_expires_after_thirty_seconds(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(
        tcp_listener,
        vec![vec![empty_body()], vec![success_body()]],
    );
    let (mut session, clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::EmptyResponse);

    set_clock(&clock, 1_029.0);
    let mut blocked = seeded_request(&session);
    let result = session.send(&mut blocked).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ConnectionClosed);

    set_clock(&clock, 1_030.1);
    let mut retry = seeded_request(&session);
    let result = session.send(&mut retry).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::Success);
    assert_eq!(session.stats().connections_created, 2);
}

#[rstest]
fn explicit_close_arms_the_cooldown(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(
        tcp_listener,
        vec![vec![success_body()], vec![success_body()]],
    );
    let (mut session, clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::Success);

    session.close();
    set_clock(&clock, 1_010.0);
    let mut blocked = seeded_request(&session);
    let result = session.send(&mut blocked).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ConnectionClosed);

    set_clock(&clock, 1_041.0);
    let mut retry = seeded_request(&session);
    let result = session.send(&mut retry).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::Success);
    assert_eq!(session.stats().connections_created, 2);
    assert_eq!(session.stats().requests_failed, 0);
}

#[rstest]
fn closing_a_disconnected_session_is_a_noop(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(tcp_listener, vec![vec![success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    session.close();
    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::Success);
}

#[rstest]
fn connect_failure_is_classified_and_arms_the_cooldown(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener has address");
    drop(tcp_listener);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ConnectionFailed);
    assert_eq!(result.bytes_sent, 0);

    let stats = session.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.connections_created, 0);
    assert_eq!(stats.request_bytes_sent, 0);

    let mut retry = seeded_request(&session);
    let result = session.send(&mut retry).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::ConnectionClosed);
    assert_eq!(session.stats().requests_sent, 1);
}

#[rstest]
fn peer_disconnect_fails_the_request_without_redialling(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(tcp_listener, vec![vec![success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    let result = session.send(&mut request).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::Success);

    let mut retry = seeded_request(&session);
    let result = session.send(&mut retry).expect("send is well-formed");
    assert_eq!(result.status, SendStatus::RequestFailed);
    assert!(result.bytes_sent > 0);

    let stats = session.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.requests_failed, 1);
}

#[rstest]
fn ping_sends_an_empty_request(tcp_listener: TcpListener) {
    let (addr, request_rx) = spawn_server(tcp_listener, vec![vec![success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let status = session.ping().expect("ping is well-formed");
    assert_eq!(status, SendStatus::Success);

    let raw = request_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("request captured");
    let (_, body) = split_request(&raw);
    assert_eq!(body["events"], json!([]));
    assert_eq!(body["client_time"], 1_000);
}

#[rstest]
fn sending_a_closed_request_is_misuse(tcp_listener: TcpListener) {
    let (addr, _request_rx) = spawn_server(tcp_listener, vec![vec![success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut request = seeded_request(&session);
    request.close();
    let error = session.send(&mut request).expect_err("closed request");
    assert!(matches!(error, RequestError::Closed));
    assert_eq!(session.stats().requests_sent, 0);
}

#[rstest]
fn byte_and_latency_counters_accumulate(tcp_listener: TcpListener) {
    let (addr, _request_rx) =
        spawn_server(tcp_listener, vec![vec![success_body(), success_body()]]);
    let (mut session, _clock) = session_at(addr, 1_000.0);

    let mut sent = 0u64;
    for _ in 0..2 {
        let mut request = seeded_request(&session);
        let result = session.send(&mut request).expect("send is well-formed");
        sent += result.bytes_sent as u64;
    }

    let stats = session.stats();
    assert_eq!(stats.request_bytes_sent, sent);
    assert_eq!(
        stats.response_bytes_received,
        2 * r#"{"status":"success"}"#.len() as u64
    );
    assert!(stats.request_latency > Duration::ZERO);
}

#[rstest]
fn sessions_sharing_a_generator_never_reuse_timestamps() {
    let timestamps = Arc::new(TimestampGenerator::with_provider(Box::new(|| 0)));
    let build = |key: &str| {
        let config = SessionConfig::new("http://127.0.0.1:9", key).quiet();
        ClientSession::with_timestamps(config, Arc::clone(&timestamps)).expect("valid address")
    };
    let first = build("key-one");
    let second = build("key-two");

    let mut request_a = first
        .new_request(None, DEFAULT_MAX_REQUEST_SIZE)
        .expect("base fields are valid");
    let mut request_b = second
        .new_request(None, DEFAULT_MAX_REQUEST_SIZE)
        .expect("base fields are valid");
    for _ in 0..3 {
        request_a
            .add_event(&object(json!({"source": "a"})), None)
            .expect("open request");
        request_b
            .add_event(&object(json!({"source": "b"})), None)
            .expect("open request");
    }

    let mut stamps = Vec::new();
    for request in [&mut request_a, &mut request_b] {
        let parsed: Value =
            serde_json::from_slice(request.payload().expect("payload")).expect("valid JSON");
        let series: Vec<i64> = parsed["events"]
            .as_array()
            .expect("events array")
            .iter()
            .map(|event| {
                event["ts"]
                    .as_str()
                    .expect("ts string")
                    .parse()
                    .expect("ts is numeric")
            })
            .collect();
        assert!(series.windows(2).all(|pair| pair[0] < pair[1]));
        stamps.extend(series);
    }
    let total = stamps.len();
    stamps.sort_unstable();
    stamps.dedup();
    assert_eq!(stamps.len(), total);
}
