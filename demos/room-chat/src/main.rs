//! Two chat clients and a server in one process, over real TCP.
//!
//! Run with `RUST_LOG=debug cargo run -p room-chat` to see the protocol
//! at work.

use std::sync::Arc;
use std::time::Duration;

use loomwire::prelude::*;
use loomwire::session::WeakConnection;
use loomwire::telemetry::init_tracing;

type Room = GroupRouter<String, Connection<ChatSession>>;

// =========================================================================
// Messages
// =========================================================================

/// Client → server: enter the room.
struct JoinRoom;

impl Message for JoinRoom {
    const CATEGORY: u8 = 2;
    const TYPE: u8 = 3;

    fn encode(&self, _w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode(_r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Client → server: say something to the room.
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

/// Server → client: someone said something.
struct ChatLine {
    from: String,
    text: String,
}

impl Message for ChatLine {
    const CATEGORY: u8 = 2;
    const TYPE: u8 = 2;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        w.put_str(&self.from)?;
        w.put_str(&self.text)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            from: r.get_string()?,
            text: r.get_string()?,
        })
    }
}

// =========================================================================
// Server side
// =========================================================================

struct ChatSession {
    name: String,
    conn: WeakConnection<ChatSession>,
    room: Arc<Room>,
}

impl Handle<ChatSession> for JoinRoom {
    fn handle(self, ctx: &ChatSession) -> Result<Dispatch<ChatSession>, HandlerError> {
        let conn = ctx
            .conn
            .upgrade()
            .ok_or_else(|| HandlerError::new("connection gone"))?;
        ctx.room
            .add(ctx.name.clone(), Arc::new(conn))
            .map_err(|e| HandlerError::new(e.to_string()))?;
        let line = ChatLine {
            from: "room".into(),
            text: format!("{} joined", ctx.name),
        };
        ctx.room
            .send(&line, Some(&ctx.name), Scope::Local)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        Ok(Dispatch::Done)
    }
}

impl Handle<ChatSession> for Say {
    fn handle(self, ctx: &ChatSession) -> Result<Dispatch<ChatSession>, HandlerError> {
        let line = ChatLine {
            from: ctx.name.clone(),
            text: self.text,
        };
        ctx.room
            .send(&line, Some(&ctx.name), Scope::Local)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        Ok(Dispatch::Done)
    }
}

fn server_messages(reg: &mut MessageRegistry<ChatSession>) -> Result<(), ProtocolError> {
    reg.register::<JoinRoom>()?.register::<Say>()?;
    Ok(())
}

const SERVER_MESSAGES: MessagePackage<ChatSession> = MessagePackage {
    name: "chat-server",
    register: server_messages,
};

/// Removes a member from the room when its connection closes.
struct LeaveRoom {
    name: String,
    room: Arc<Room>,
}

impl ConnectionListener<ChatSession> for LeaveRoom {
    fn connection_closed(&self, _conn: &Connection<ChatSession>) {
        if self.room.remove(&self.name).is_ok() {
            let line = ChatLine {
                from: "room".into(),
                text: format!("{} left", self.name),
            };
            let _ = self.room.send(&line, None, Scope::Local);
        }
    }
}

/// `name:chat` gets in, once per name.
struct ChatAccess {
    room: Arc<Room>,
}

impl AccessControl<ChatSession> for ChatAccess {
    async fn authorize(&self, conn: &Connection<ChatSession>, key: &str) -> AccessDecision<ChatSession> {
        let (name, password) = match split_key(key) {
            Ok(parts) => parts,
            Err(code) => return AccessDecision::reject(code, "expected name:password"),
        };
        if password != "chat" {
            return AccessDecision::reject(ErrorCode::BadKeyValue, "wrong password");
        }
        if self.room.contains(&name.to_string()) {
            return AccessDecision::reject(ErrorCode::AlreadyConnected, format!("{name} is already here"));
        }

        AccessDecision::accept(ChatSession {
            name: name.to_string(),
            conn: conn.downgrade(),
            room: Arc::clone(&self.room),
        })
        .with_listener(Arc::new(LeaveRoom {
            name: name.to_string(),
            room: Arc::clone(&self.room),
        }))
    }
}

// =========================================================================
// Client side
// =========================================================================

struct ChatView {
    name: String,
}

impl Handle<ChatView> for ChatLine {
    fn handle(self, ctx: &ChatView) -> Result<Dispatch<ChatView>, HandlerError> {
        tracing::info!(to = %ctx.name, from = %self.from, text = %self.text, "chat");
        Ok(Dispatch::Done)
    }
}

fn client_messages(reg: &mut MessageRegistry<ChatView>) -> Result<(), ProtocolError> {
    reg.register::<ChatLine>()?;
    Ok(())
}

const CLIENT_MESSAGES: MessagePackage<ChatView> = MessagePackage {
    name: "chat-client",
    register: client_messages,
};

fn view(name: &str) -> ChatView {
    ChatView { name: name.into() }
}

// =========================================================================
// Main
// =========================================================================

#[tokio::main]
async fn main() -> Result<(), LoomwireError> {
    init_tracing();

    let room: Arc<Room> = Arc::new(GroupRouter::new("lobby"));
    let server = NetServerBuilder::new()
        .bind("127.0.0.1:0")
        .package(&SERVER_MESSAGES)
        .build_tcp(ChatAccess {
            room: Arc::clone(&room),
        })
        .await?;
    let endpoint = server.local_endpoint().to_string();
    let handle = server.handle();
    let server_task = tokio::spawn(server.run());

    let client = NetClient::with_packages(ClientConfig::default(), &[&CLIENT_MESSAGES])?;
    let ann = client.connect(&TcpConnector, &endpoint, "ann:chat", view("ann")).await?;
    let bob = client.connect(&TcpConnector, &endpoint, "bob:chat", view("bob")).await?;

    match client.connect(&TcpConnector, &endpoint, "eve:guess", view("eve")).await {
        Ok(_) => tracing::warn!("eve got in with a wrong password"),
        Err(e) => tracing::info!(code = ?e.code, reason = %e.message, "eve refused"),
    }

    ann.queue_message(&JoinRoom)?;
    bob.queue_message(&JoinRoom)?;
    while room.len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ann.queue_message(&Say {
        text: "hi bob".into(),
    })?;
    bob.queue_message(&Say {
        text: "hi ann".into(),
    })?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    ann.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.shutdown().await;

    handle.stop();
    match server_task.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "server task failed"),
    }
    Ok(())
}
