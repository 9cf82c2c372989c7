//! End-to-end tests: a live server on a scratch socket, raw unix-stream
//! clients speaking MessagePack-RPC.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rmpv::Value;

use prise::{Config, Frame, Message, MessageDecoder, Server};

const STEP: Duration = Duration::from_millis(25);
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    socket: PathBuf,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a server on a scratch socket with an empty script.
    fn start() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("prise.sock");
        let script = dir.path().join("init.lua");
        std::fs::write(&script, "-- test: no script policy\n").unwrap();

        let config = Config {
            socket_path: socket.clone(),
            script_path: Some(script),
            log_file: None,
        };
        let handle = std::thread::spawn(move || {
            let mut server = Server::new(&config)?;
            server.run()
        });

        // Wait for the socket to accept connections.
        let deadline = Instant::now() + WAIT;
        loop {
            match UnixStream::connect(&socket) {
                Ok(_) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(STEP),
                Err(e) => panic!("server never came up: {e}"),
            }
        }

        Self {
            socket,
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn client(&self) -> TestClient {
        TestClient::connect(&self.socket)
    }

    /// Ask the server to quit and join its thread.
    fn quit(mut self) {
        let mut client = self.client();
        let reply = client.request("quit", vec![]);
        match reply {
            Message::Response { error, .. } => assert_eq!(error, Value::Nil),
            other => panic!("expected quit response, got {other:?}"),
        }
        let handle = self.handle.take().unwrap();
        handle.join().unwrap().unwrap();
        assert!(!self.socket.exists(), "socket not unlinked on shutdown");
    }
}

struct TestClient {
    stream: UnixStream,
    decoder: MessageDecoder,
    inbox: VecDeque<Message>,
    next_id: u32,
}

impl TestClient {
    fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).expect("connect");
        stream.set_read_timeout(Some(STEP)).unwrap();
        Self {
            stream,
            decoder: MessageDecoder::new(),
            inbox: VecDeque::new(),
            next_id: 1,
        }
    }

    fn send(&mut self, message: &Message) {
        self.stream.write_all(&message.encode()).unwrap();
    }

    /// Pump the socket into the inbox until `pred` matches or `WAIT`
    /// elapses.
    fn wait_for(&mut self, mut pred: impl FnMut(&Message) -> bool) -> Message {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(pos) = self.inbox.iter().position(&mut pred) {
                return self.inbox.remove(pos).unwrap();
            }
            assert!(Instant::now() < deadline, "timed out; inbox: {:?}", self.inbox);

            let mut buf = [0u8; 64 * 1024];
            match self.stream.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => {
                    for message in self.decoder.feed(&buf[..n]).unwrap() {
                        self.inbox.push_back(message);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// Read whatever arrives for `duration`, into the inbox.
    fn pump(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut buf = [0u8; 64 * 1024];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    for message in self.decoder.feed(&buf[..n]).unwrap() {
                        self.inbox.push_back(message);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// True if the server closed this connection within `WAIT`.
    fn closed(&mut self) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => {
                    if let Ok(messages) = self.decoder.feed(&buf[..n]) {
                        self.inbox.extend(messages);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return true,
            }
        }
        false
    }

    fn request(&mut self, method: &str, params: Vec<Value>) -> Message {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&Message::request(id, method, params));
        self.wait_for(|m| matches!(m, Message::Response { id: got, .. } if *got == id))
    }

    fn request_ok(&mut self, method: &str, params: Vec<Value>) -> Value {
        match self.request(method, params) {
            Message::Response { error, result, .. } => {
                assert_eq!(error, Value::Nil, "{method} failed");
                result
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn spawn(&mut self, argv: &[&str]) -> u64 {
        let argv_value =
            Value::Array(argv.iter().map(|a| Value::from(*a)).collect());
        let opts = Value::Map(vec![
            (Value::from("argv"), argv_value),
            (Value::from("cols"), Value::from(80u64)),
            (Value::from("rows"), Value::from(24u64)),
        ]);
        self.request_ok("spawn", vec![opts])
            .as_u64()
            .expect("spawn returns a session id")
    }

    /// Next redraw for `session`, decoded.
    fn wait_redraw(&mut self, session: u64) -> Frame {
        let message = self.wait_for(|m| {
            matches!(m, Message::Notification { method, params }
                if method == "redraw" && params.first().and_then(Value::as_u64) == Some(session))
        });
        let Message::Notification { mut params, .. } = message else {
            unreachable!()
        };
        rmpv::ext::from_value(params.remove(1)).expect("valid frame payload")
    }

    /// Wait for a redraw of `session` whose text satisfies `pred`.
    fn wait_redraw_text(&mut self, session: u64, pred: impl Fn(&str) -> bool) -> Frame {
        let deadline = Instant::now() + WAIT;
        loop {
            let frame = self.wait_redraw(session);
            if pred(&frame_text(&frame)) {
                return frame;
            }
            assert!(Instant::now() < deadline, "no matching redraw");
        }
    }
}

fn frame_text(frame: &Frame) -> String {
    let mut text = String::new();
    for row in &frame.cells {
        for cell in row {
            text.push_str(&cell.ch);
        }
        text.push('\n');
    }
    text
}

fn key_event(key: &str) -> Value {
    Value::Map(vec![
        (Value::from("key"), Value::from(key)),
        (Value::from("ctrlKey"), Value::from(false)),
        (Value::from("shiftKey"), Value::from(false)),
        (Value::from("altKey"), Value::from(false)),
        (Value::from("metaKey"), Value::from(false)),
    ])
}

#[test]
fn test_spawn_renders_output_then_reports_exit() {
    let server = TestServer::start();
    let mut client = server.client();

    let session = client.spawn(&["/bin/echo", "hi"]);

    let frame = client.wait_redraw_text(session, |text| text.contains("hi"));
    assert_eq!(frame.kind, "full");
    assert_eq!(frame.cols, 80);
    assert_eq!(frame.rows, 24);

    let exited = client.wait_for(|m| {
        matches!(m, Message::Notification { method, params }
            if method == "pty_exited" && params.first().and_then(Value::as_u64) == Some(session))
    });
    let Message::Notification { params, .. } = exited else {
        unreachable!()
    };
    assert_eq!(params[1].as_u64(), Some(0), "echo exits cleanly");

    server.quit();
}

#[test]
fn test_key_passthrough_echoes_on_screen() {
    let server = TestServer::start();
    let mut client = server.client();

    // cat never writes on its own; anything on screen is tty echo.
    let session = client.spawn(&["/bin/cat"]);

    client.request_ok("key", vec![Value::from(session), key_event("a")]);
    let frame = client.wait_redraw_text(session, |text| text.contains('a'));
    assert!(frame.cursor.col >= 1, "cursor advanced past the echo");

    server.quit();
}

#[test]
fn test_multi_client_broadcast_is_identical() {
    let server = TestServer::start();
    let mut first = server.client();
    let mut second = server.client();

    let session = first.spawn(&["/bin/cat"]);
    second.request_ok("attach", vec![Value::from(session)]);

    first.request_ok(
        "write",
        vec![Value::from(session), Value::from("broadcast-check")],
    );

    let seen_first = first.wait_redraw_text(session, |t| t.contains("broadcast-check"));
    let seen_second = second.wait_redraw_text(session, |t| t.contains("broadcast-check"));
    assert_eq!(seen_first, seen_second, "both clients see the same frame");

    server.quit();
}

#[test]
fn test_detach_stops_redraws() {
    let server = TestServer::start();
    let mut watcher = server.client();
    let mut driver = server.client();

    let session = driver.spawn(&["/bin/cat"]);
    watcher.request_ok("attach", vec![Value::from(session)]);
    // Attach delivers the current screen at once.
    watcher.wait_redraw(session);

    watcher.request_ok("detach", vec![Value::from(session)]);
    driver.request_ok("write", vec![Value::from(session), Value::from("after-detach")]);

    // The driver still sees frames...
    driver.wait_redraw_text(session, |t| t.contains("after-detach"));
    // ...while nothing further reaches the detached watcher.
    watcher.pump(Duration::from_millis(300));
    assert!(
        !watcher
            .inbox
            .iter()
            .any(|m| matches!(m, Message::Notification { method, .. } if method == "redraw")),
        "no redraw after detach"
    );

    server.quit();
}

#[test]
fn test_client_crash_leaves_session_and_others_running() {
    let server = TestServer::start();
    let mut survivor = server.client();

    let session = survivor.spawn(&["/bin/cat"]);

    // A second client attaches, then dies mid-stream.
    let mut doomed = server.client();
    doomed.request_ok("attach", vec![Value::from(session)]);
    drop(doomed);

    survivor.request_ok(
        "write",
        vec![Value::from(session), Value::from("still-alive")],
    );
    survivor.wait_redraw_text(session, |t| t.contains("still-alive"));

    server.quit();
}

#[test]
fn test_protocol_violation_closes_only_offender() {
    let server = TestServer::start();
    let mut violator = server.client();
    let mut bystander = server.client();

    let session = bystander.spawn(&["/bin/cat"]);

    // [7, ...] is not a valid message type tag.
    let bad = Value::Array(vec![
        Value::from(7u64),
        Value::from(1u64),
        Value::from("nope"),
        Value::Array(vec![]),
    ]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &bad).unwrap();
    violator.stream.write_all(&bytes).unwrap();

    assert!(violator.closed(), "violator must be disconnected");

    // The bystander and its PTY are unaffected.
    bystander.request_ok(
        "write",
        vec![Value::from(session), Value::from("unaffected")],
    );
    bystander.wait_redraw_text(session, |t| t.contains("unaffected"));

    server.quit();
}

#[test]
fn test_unknown_method_is_an_error_reply_not_a_disconnect() {
    let server = TestServer::start();
    let mut client = server.client();

    match client.request("frobnicate", vec![]) {
        Message::Response { error, result, .. } => {
            assert_eq!(result, Value::Nil);
            let text = error.as_str().unwrap_or_default().to_string();
            assert!(text.contains("unknown method"), "got: {text}");
        }
        other => panic!("expected response, got {other:?}"),
    }

    // Still connected and usable.
    let sessions = client.request_ok("list_sessions", vec![]);
    assert_eq!(sessions, Value::Array(vec![]));

    server.quit();
}

#[test]
fn test_list_sessions_and_resize() {
    let server = TestServer::start();
    let mut client = server.client();

    let session = client.spawn(&["/bin/cat"]);

    let listed = client.request_ok("list_sessions", vec![]);
    let Value::Array(rows) = listed else {
        panic!("list_sessions returns an array");
    };
    assert_eq!(rows.len(), 1);
    let Value::Map(fields) = &rows[0] else {
        panic!("row is a map");
    };
    let title = fields
        .iter()
        .find(|(k, _)| k.as_str() == Some("title"))
        .and_then(|(_, v)| v.as_str().map(str::to_string))
        .unwrap();
    assert_eq!(title, "cat");

    client.request_ok(
        "resize",
        vec![Value::from(session), Value::from(100u64), Value::from(30u64)],
    );
    let frame = client.wait_redraw_text(session, |_| true);
    // The next frame reflects the new geometry (possibly after one
    // stale frame already in flight).
    let resized = if frame.cols == 100 {
        frame
    } else {
        client.wait_redraw(session)
    };
    assert_eq!((resized.cols, resized.rows), (100, 30));

    server.quit();
}
