//! Connection behavior over in-memory duplex streams: dispatch order,
//! personalities, deferred actions, pings, and closing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use loomwire_protocol::{
    Deferred, Dispatch, Frame, FrameCodec, FrameEncoder, Handle, HandlerError, Inbound, Message,
    MessageRegistry, ProtocolError, SystemMessage, WireReader, WireWriter,
};
use loomwire_session::{
    AsyncSettings, Connection, ConnectionListener, Personality, PersonalityState, PingStatus,
    SessionError, SyncSettings,
};
use loomwire_transport::ConnectionId;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::{FramedRead, FramedWrite};

// =========================================================================
// Test messages and context
// =========================================================================

#[derive(Default)]
struct Chat {
    heard: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Say {
    text: String,
}

impl Message for Say {
    const CATEGORY: u8 = 2;
    const TYPE: u8 = 1;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        w.put_str(&self.text)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            text: r.get_string()?,
        })
    }
}

impl Handle<Chat> for Say {
    fn handle(self, ctx: &Chat) -> Result<Dispatch<Chat>, HandlerError> {
        if self.text == "bad" {
            return Err(HandlerError::new("refused"));
        }
        ctx.heard.lock().unwrap().push(self.text.clone());
        if self.text.starts_with("later:") {
            return Ok(Dispatch::Defer(Deferred::new("apply", move |c: &Chat| {
                c.applied.lock().unwrap().push(self.text);
            })));
        }
        Ok(Dispatch::Done)
    }
}

fn registry() -> Arc<MessageRegistry<Chat>> {
    let mut reg = MessageRegistry::new();
    reg.register::<Say>().unwrap();
    Arc::new(reg)
}

fn say(text: &str) -> Say {
    Say { text: text.into() }
}

/// A connection plus the raw far end of its stream.
fn connection() -> (Connection<Chat>, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(ConnectionId::next(), "duplex", Box::new(near), registry());
    conn.set_context(Chat::default());
    (conn, far)
}

/// Two connections wired to each other.
fn pair() -> (Connection<Chat>, Connection<Chat>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let left = Connection::new(ConnectionId::next(), "left", Box::new(a), registry());
    let right = Connection::new(ConnectionId::next(), "right", Box::new(b), registry());
    left.set_context(Chat::default());
    right.set_context(Chat::default());
    (left, right)
}

async fn write_frames(far: &mut DuplexStream, frames: &[Frame]) {
    for f in frames {
        far.write_all(f.as_bytes()).await.unwrap();
    }
}

fn heard(conn: &Connection<Chat>) -> Vec<String> {
    conn.context().unwrap().heard.lock().unwrap().clone()
}

fn applied(conn: &Connection<Chat>) -> Vec<String> {
    conn.context().unwrap().applied.lock().unwrap().clone()
}

struct CloseCounter(AtomicU32);

impl ConnectionListener<Chat> for CloseCounter {
    fn connection_closed(&self, _conn: &Connection<Chat>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// =========================================================================
// Synchronous personality
// =========================================================================

#[tokio::test]
async fn test_sync_receive_dispatches_in_arrival_order() {
    let (conn, mut far) = connection();
    conn.activate(Personality::synchronous()).unwrap();

    let frames: Vec<Frame> = ["a", "b", "c"]
        .iter()
        .map(|t| Frame::encode(&say(t)).unwrap())
        .collect();
    write_frames(&mut far, &frames).await;

    conn.wait_for_message().await.unwrap();
    let mut total = 0;
    while total < 3 {
        total += conn.receive_available().await.unwrap();
        tokio::task::yield_now().await;
    }
    assert_eq!(heard(&conn), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_sync_receive_respects_budget() {
    let (conn, mut far) = connection();
    conn.activate(Personality::Synchronous(SyncSettings { max_per_receive: 2 }))
        .unwrap();

    let frames: Vec<Frame> = (0..5)
        .map(|i| Frame::encode(&say(&i.to_string())).unwrap())
        .collect();
    write_frames(&mut far, &frames).await;

    conn.wait_for_message().await.unwrap();
    assert_eq!(conn.receive_available().await.unwrap(), 2);
    assert_eq!(heard(&conn).len(), 2);
}

#[tokio::test]
async fn test_receive_available_without_data_returns_zero() {
    let (conn, _far) = connection();
    assert_eq!(conn.receive_available().await.unwrap(), 0);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_send_queued_preserves_fifo() {
    let (conn, far) = connection();
    for t in ["one", "two", "three"] {
        conn.queue_message(&say(t)).unwrap();
    }
    assert_eq!(conn.queued_len(), 3);
    assert_eq!(conn.send_queued().await.unwrap(), 3);
    assert_eq!(conn.queued_len(), 0);

    let mut reader = FramedRead::new(far, FrameCodec::new(registry()));
    let ctx = Chat::default();
    for _ in 0..3 {
        match reader.next().await.unwrap().unwrap() {
            Inbound::Handler(_, h) => {
                h.run(&ctx).unwrap();
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(*ctx.heard.lock().unwrap(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_deferred_applied_after_receive() {
    let (conn, mut far) = connection();
    conn.activate(Personality::synchronous()).unwrap();

    write_frames(&mut far, &[Frame::encode(&say("later:x")).unwrap()]).await;
    conn.wait_for_message().await.unwrap();
    conn.receive_available().await.unwrap();

    assert_eq!(heard(&conn), vec!["later:x"]);
    assert_eq!(applied(&conn), vec!["later:x"]);
    assert_eq!(conn.deferred_len(), 0);
}

#[tokio::test]
async fn test_handler_error_keeps_connection_open() {
    let (conn, mut far) = connection();
    let frames = [
        Frame::encode(&say("bad")).unwrap(),
        Frame::encode(&say("good")).unwrap(),
    ];
    write_frames(&mut far, &frames).await;

    conn.wait_for_message().await.unwrap();
    while heard(&conn).is_empty() {
        conn.receive_available().await.unwrap();
        tokio::task::yield_now().await;
    }
    assert_eq!(heard(&conn), vec!["good"]);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_unknown_message_is_skipped() {
    let (conn, mut far) = connection();
    far.write_all(&[9, 9, 1, 2, 3]).await.unwrap();

    conn.wait_for_message().await.unwrap();
    assert_eq!(conn.receive_available().await.unwrap(), 1);
    assert!(heard(&conn).is_empty());
    assert!(!conn.is_closed());

    write_frames(&mut far, &[Frame::encode(&say("after")).unwrap()]).await;
    conn.wait_for_message().await.unwrap();
    conn.receive_available().await.unwrap();
    assert_eq!(heard(&conn), vec!["after"]);
}

// =========================================================================
// Asynchronous personality
// =========================================================================

#[tokio::test]
async fn test_async_pair_delivers_both_ways() {
    let (left, right) = pair();
    left.activate(Personality::asynchronous()).unwrap();
    right.activate(Personality::asynchronous()).unwrap();

    for i in 0..30 {
        left.queue_message(&say(&format!("l{i}"))).unwrap();
    }
    right.queue_message(&say("hello")).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while heard(&right).len() < 30 || heard(&left).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages should arrive");

    let expected: Vec<String> = (0..30).map(|i| format!("l{i}")).collect();
    assert_eq!(heard(&right), expected);
    assert_eq!(heard(&left), vec!["hello"]);
}

#[tokio::test]
async fn test_async_small_window_flushes_promptly() {
    let (left, right) = pair();
    let settings = AsyncSettings {
        aggregation_window_ms: 1,
        ..AsyncSettings::default()
    };
    left.activate(Personality::Asynchronous(settings)).unwrap();
    right.activate(Personality::asynchronous()).unwrap();

    left.queue_message(&say("later:go")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while applied(&right).is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("deferred action should run on the receiver");
}

#[tokio::test]
async fn test_activate_twice_fails() {
    let (conn, _far) = connection();
    conn.activate(Personality::synchronous()).unwrap();
    assert_eq!(conn.personality_state(), PersonalityState::Active);
    let err = conn.activate(Personality::asynchronous()).unwrap_err();
    assert!(matches!(err, SessionError::AlreadyActive(_)));
}

#[tokio::test]
async fn test_activate_after_close_fails() {
    let (conn, _far) = connection();
    conn.close();
    assert_eq!(conn.personality_state(), PersonalityState::Closed);
    assert!(matches!(
        conn.activate(Personality::synchronous()),
        Err(SessionError::Closed(_))
    ));
}

// =========================================================================
// Handshake helpers
// =========================================================================

#[tokio::test]
async fn test_next_system_message_reads_register() {
    let (conn, far) = connection();
    let mut writer = FramedWrite::new(far, FrameEncoder);
    let register = SystemMessage::ClientRegister {
        version: 3,
        key: "ann:pw".into(),
    };
    writer.send(Frame::encode(&register).unwrap()).await.unwrap();

    let msg = conn.next_system_message(Duration::from_secs(1)).await.unwrap();
    assert_eq!(msg, register);
}

#[tokio::test]
async fn test_next_system_message_rejects_application_message() {
    let (conn, mut far) = connection();
    write_frames(&mut far, &[Frame::encode(&say("hi")).unwrap()]).await;
    let err = conn
        .next_system_message(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnexpectedMessage(id) if id == Say::id()));
}

#[tokio::test(start_paused = true)]
async fn test_next_system_message_times_out() {
    let (conn, _far) = connection();
    let err = conn
        .next_system_message(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert!(!conn.is_closed());
}

// =========================================================================
// Closing
// =========================================================================

#[tokio::test]
async fn test_end_of_connection_closes_and_notifies() {
    let (left, right) = pair();
    let counter = Arc::new(CloseCounter(AtomicU32::new(0)));
    right.add_listener(counter.clone());
    right.activate(Personality::asynchronous()).unwrap();

    left.shutdown().await;
    assert!(left.is_closed());

    tokio::time::timeout(Duration::from_secs(5), right.closed())
        .await
        .expect("peer should close");
    assert!(right.is_closed());
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_peer_drop_closes_async_connection() {
    let (conn, far) = connection();
    let counter = Arc::new(CloseCounter(AtomicU32::new(0)));
    conn.add_listener(counter.clone());
    conn.activate(Personality::asynchronous()).unwrap();

    drop(far);
    tokio::time::timeout(Duration::from_secs(5), conn.closed())
        .await
        .expect("stream end should close the connection");
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert!(matches!(
        conn.queue_message(&say("x")),
        Err(SessionError::Closed(_))
    ));
}

#[tokio::test]
async fn test_close_drops_unsent_frames() {
    let (conn, _far) = connection();
    conn.queue_message(&say("never")).unwrap();
    conn.close();
    assert_eq!(conn.queued_len(), 0);
}

// =========================================================================
// Ping
// =========================================================================

#[tokio::test]
async fn test_ping_measures_round_trip() {
    let (left, right) = pair();
    left.activate(Personality::asynchronous()).unwrap();
    right.activate(Personality::asynchronous()).unwrap();

    let mut status = left.enable_ping(Duration::from_millis(50));
    let measured = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s, PingStatus::Measured(_))),
    )
    .await
    .expect("ping should be answered");
    assert!(measured.is_ok());
}

#[tokio::test]
async fn test_ping_without_answer_fails() {
    let (conn, _far) = connection();
    conn.activate(Personality::asynchronous()).unwrap();

    let mut status = conn.enable_ping(Duration::from_millis(20));
    let failed = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == PingStatus::Failed),
    )
    .await
    .expect("unanswered ping should be reported");
    assert!(failed.is_ok());
}

#[tokio::test]
async fn test_ping_status_closed_after_close() {
    let (conn, _far) = connection();
    let status = conn.ping_status();
    conn.close();
    assert_eq!(*status.borrow(), PingStatus::Closed);
}
