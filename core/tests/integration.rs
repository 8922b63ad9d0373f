//! End-to-end tests over real sockets.
//!
//! # Design
//! Most tests start the mock server on a random port and drive a `Client`
//! through `BlockingDriver`, so requests, keep-alive and reconnects go over
//! real TCP against hyper. Behaviour hyper will not produce on demand
//! (switching protocols, hanging up mid-request) comes from a raw
//! `std::net` peer scripted inside the test.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;

use http_conn::{BlockingDriver, Client, ConnState, ConnectOptions, ErrorClass, Event, HttpMethod, RequestId};
use mock_server::Inspection;

fn start_mock_server() -> SocketAddr {
    let std_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    addr
}

/// Accept one connection, read one request head, then hand the stream to
/// `respond`.
fn scripted_peer<F>(respond: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        respond(stream);
    });
    (addr, handle)
}

fn driver(addr: SocketAddr) -> BlockingDriver {
    BlockingDriver::new(Client::new(ConnectOptions::new("127.0.0.1", addr.port())))
}

fn get(driver: &mut BlockingDriver, url: &str) -> RequestId {
    driver.client_mut().request(HttpMethod::Get, url, Vec::new()).unwrap()
}

fn responses_ended(count: usize) -> impl FnMut(&Event) -> bool {
    let mut seen = 0;
    move |event| {
        if matches!(event, Event::ResponseEnd(_)) {
            seen += 1;
        }
        seen == count
    }
}

fn body_of(events: &[Event], id: RequestId) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Body { request, chunk } if *request == id => Some(chunk.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn status_of(events: &[Event], id: RequestId) -> Option<u16> {
    events.iter().find_map(|event| match event {
        Event::Response { request, head } if *request == id => Some(head.status),
        _ => None,
    })
}

#[test]
fn keep_alive_serves_queue_in_order_on_one_connection() {
    let mut d = driver(start_mock_server());
    let ids: Vec<RequestId> = (0..3).map(|_| get(&mut d, "/inspect")).collect();

    let events = d.run_until(responses_ended(3)).unwrap();

    let sequences: Vec<u64> = ids
        .iter()
        .map(|id| {
            assert_eq!(status_of(&events, *id), Some(200));
            let seen: Inspection = serde_json::from_slice(&body_of(&events, *id)).unwrap();
            assert_eq!(seen.method, "GET");
            assert_eq!(seen.path, "/inspect");
            seen.sequence
        })
        .collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "out of order: {sequences:?}");

    let ended: Vec<RequestId> = events
        .iter()
        .filter_map(|e| match e {
            Event::ResponseEnd(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(ended, ids);
    assert_eq!(d.connects(), 1);
    assert_eq!(d.client().state(), ConnState::Closed);
}

#[test]
fn server_close_leaves_next_request_for_a_new_connection() {
    let mut d = driver(start_mock_server());
    let closing = get(&mut d, "/close");
    let orphan = get(&mut d, "/hello");

    let events = d.run_until(responses_ended(1)).unwrap();
    assert_eq!(body_of(&events, closing), b"bye");
    assert_eq!(d.client().state(), ConnState::Closed);
    assert_eq!(d.client().queued(), 1);
    assert_eq!(d.client().peek_head().map(|h| h.id()), Some(orphan));

    let next = get(&mut d, "/hello");
    let events = d.run_until(responses_ended(2)).unwrap();
    assert_eq!(body_of(&events, orphan), b"hello");
    assert_eq!(body_of(&events, next), b"hello");
    assert_eq!(d.connects(), 2);
}

#[test]
fn head_response_body_is_not_read() {
    let mut d = driver(start_mock_server());
    let head = d.client_mut().request(HttpMethod::Head, "/hello", Vec::new()).unwrap();
    let after = get(&mut d, "/hello");

    let events = d.run_until(responses_ended(2)).unwrap();
    assert_eq!(status_of(&events, head), Some(200));
    assert!(body_of(&events, head).is_empty());
    assert_eq!(body_of(&events, after), b"hello");
    assert_eq!(d.connects(), 1);
}

#[test]
fn bodyless_status_keeps_connection() {
    let mut d = driver(start_mock_server());
    let empty = get(&mut d, "/status/204");
    let after = get(&mut d, "/hello");

    let events = d.run_until(responses_ended(2)).unwrap();
    assert_eq!(status_of(&events, empty), Some(204));
    assert_eq!(body_of(&events, after), b"hello");
    assert_eq!(d.connects(), 1);
}

#[test]
fn expect_continue_round_trip() {
    let mut d = driver(start_mock_server());
    let id = d
        .client_mut()
        .request(
            HttpMethod::Post,
            "/echo",
            vec![
                ("Expect".to_string(), "100-continue".to_string()),
                ("Content-Length".to_string(), "5".to_string()),
            ],
        )
        .unwrap();

    let events = d.run_until(|e| matches!(e, Event::Continue(_))).unwrap();
    assert!(matches!(events.last(), Some(Event::Continue(r)) if *r == id));
    assert!(status_of(&events, id).is_none());

    d.client_mut().write(id, b"hello").unwrap();
    let events = d.run_until(responses_ended(1)).unwrap();
    assert_eq!(status_of(&events, id), Some(200));
    assert_eq!(body_of(&events, id), b"hello");
}

#[test]
fn upgrade_detaches_socket() {
    let (addr, peer) = scripted_peer(|mut stream| {
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: upgrade\r\n\r\nhi")
            .unwrap();
        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).unwrap();
        assert_eq!(&ping, b"ping");
        stream.write_all(b"pong").unwrap();
    });

    let mut d = driver(addr);
    d.client_mut().accept_upgrades(true);
    let id = d
        .client_mut()
        .request(
            HttpMethod::Get,
            "/",
            vec![
                ("Connection".to_string(), "upgrade".to_string()),
                ("Upgrade".to_string(), "echo".to_string()),
            ],
        )
        .unwrap();

    let events = d.run_until(|e| matches!(e, Event::Upgrade(_))).unwrap();
    let Some(Event::Upgrade(upgrade)) = events.last() else {
        panic!("expected upgrade, got {events:?}");
    };
    assert_eq!(upgrade.request.id(), id);
    assert_eq!(upgrade.response.header("upgrade"), Some("echo"));
    assert!(b"hi".starts_with(&upgrade.head));
    assert_eq!(d.client().state(), ConnState::Closed);

    let mut socket = d.take_upgraded_socket().unwrap();
    let mut rest = vec![0u8; 2 - upgrade.head.len()];
    socket.read_exact(&mut rest).unwrap();
    socket.write_all(b"ping").unwrap();
    let mut pong = [0u8; 4];
    socket.read_exact(&mut pong).unwrap();
    assert_eq!(&pong, b"pong");
    peer.join().unwrap();
}

#[test]
fn hang_up_after_request_sent_stalls() {
    let (addr, peer) = scripted_peer(drop);

    let mut d = driver(addr);
    let id = get(&mut d, "/");
    let events = d.run_until(|e| matches!(e, Event::Stalled(_))).unwrap();

    assert!(matches!(events.last(), Some(Event::Stalled(r)) if *r == id));
    assert_eq!(d.client().state(), ConnState::Open);
    assert_eq!(d.client().queued(), 1);
    assert_eq!(d.connects(), 1);
    peer.join().unwrap();
}

#[test]
fn refused_connection_is_dead() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut d = BlockingDriver::new(Client::new(ConnectOptions::new("127.0.0.1", port)));
    get(&mut d, "/");
    let events = d.run_until(|e| matches!(e, Event::Error(_))).unwrap();

    assert!(matches!(events.last(), Some(Event::Error(err)) if err.class() == ErrorClass::Fatal));
    assert_eq!(d.client().state(), ConnState::Dead);
    assert!(d.client_mut().request(HttpMethod::Get, "/", Vec::new()).is_err());
}
