//! Per-socket lifecycle.
//!
//! Each connection runs two loops:
//! - the **reader** decodes inbound frames, stamps them with the
//!   connection's identity and dispatches them (operations to the applier,
//!   cursors straight to the hub);
//! - the **writer** drains the outbound queue onto the socket and pings on
//!   every heartbeat tick.
//!
//! Whichever loop notices the peer is gone first ends the connection. The
//! reader then unregisters from the hub exactly once; the hub closing the
//! outbound queue is what stops the writer.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::hub::{ConnectionId, Frame, Hub, Peer};
use crate::operation::OperationApplier;
use crate::protocol::{Envelope, NoteId, ParticipantId};
use crate::storage::Access;

/// Who is on the other end of a socket, as established by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub note_id: NoteId,
    pub participant: ParticipantId,
    pub access: Access,
}

/// Shared services and tunables handed to every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub hub: Hub,
    pub applier: OperationApplier,
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub echo_cursor_to_sender: bool,
}

impl ConnectionContext {
    pub fn new(hub: Hub, applier: OperationApplier, config: &ServerConfig) -> Self {
        Self {
            hub,
            applier,
            outbound_capacity: config.outbound_capacity,
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            echo_cursor_to_sender: config.echo_cursor_to_sender,
        }
    }
}

/// Drive one upgraded socket until either side goes away.
pub async fn run_connection<S>(ws: WebSocketStream<S>, identity: Identity, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (peer, queue) = Peer::new(
        identity.note_id.clone(),
        identity.participant,
        ctx.outbound_capacity,
    );
    let id = peer.id;
    ctx.hub.register(peer).await;

    let (sink, stream) = ws.split();
    let mut writer = tokio::spawn(write_loop(sink, queue, ctx.heartbeat_interval, id));

    let handler = InboundHandler {
        id,
        identity,
        ctx: ctx.clone(),
    };
    let writer_done = read_loop(stream, &handler, ctx.idle_timeout, &mut writer).await;

    ctx.hub.unregister(id).await;
    if !writer_done {
        let _ = writer.await;
    }
    log::debug!("Connection {id} finished");
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    handler: &InboundHandler,
    idle_timeout: Duration,
    writer: &mut JoinHandle<()>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = handler.id;
    loop {
        tokio::select! {
            _ = &mut *writer => {
                log::debug!("Writer of {id} stopped, closing reader");
                return true;
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                Err(_) => {
                    log::info!("Connection {id} idle for {idle_timeout:?}, disconnecting");
                    return false;
                }
                Ok(None) => return false,
                Ok(Some(Err(e))) => {
                    log::debug!("Read error on {id}: {e}");
                    return false;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => handler.handle(text.as_str()).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handler.handle(text).await,
                        Err(_) => log::warn!("Non UTF-8 binary frame from {id} dropped"),
                    },
                    Message::Close(_) => return false,
                    // Pings are answered by tungstenite; pongs only prove liveness.
                    _ => {}
                },
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::Receiver<Frame>,
    heartbeat: Duration,
    id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::text(frame.to_string())).await {
                        log::debug!("Write error on {id}: {e}");
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    return;
                }
            }
        }
    }
}

struct InboundHandler {
    id: ConnectionId,
    identity: Identity,
    ctx: ConnectionContext,
}

impl InboundHandler {
    async fn handle(&self, frame: &str) {
        let mut envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", self.id);
                return;
            }
        };
        let Identity {
            note_id,
            participant,
            access,
        } = &self.identity;
        envelope.stamp(note_id, *participant);

        match envelope {
            Envelope::Operation { operation, .. } => {
                if !access.can_write() {
                    log::warn!("Participant {participant} may not edit note {note_id}, operation dropped");
                    return;
                }
                if let Err(e) = self.ctx.applier.apply(note_id, *participant, operation).await {
                    log::error!("Operation from participant {participant} dropped: {e}");
                }
            }
            cursor @ Envelope::Cursor { .. } => match cursor.encode() {
                Ok(frame) => {
                    let exclude = (!self.ctx.echo_cursor_to_sender).then_some(self.id);
                    self.ctx.hub.broadcast(frame, exclude).await;
                }
                Err(e) => log::warn!("Failed to relay cursor from {}: {e}", self.id),
            },
            Envelope::Sync { .. } => {
                log::debug!("Ignoring client sync from {}", self.id);
            }
        }
    }
}
