//! Room registry: which connections view which document.
//!
//! A single worker task owns every room. Membership changes and fan-out
//! arrive as [`Command`]s over one mpsc queue, so they are applied in one
//! total order without any lock around the room map.
//!
//! ```text
//!  Connection ─┐                      ┌──► Peer A queue ──► writer A
//!  Applier ────┼──► Command queue ──► │    Hub worker
//!  Bootstrap ──┘        ▲             └──► Peer B queue ──► writer B
//!                       │
//!            SnapshotReady (spawned store load)
//! ```
//!
//! Every outbound queue is bounded. A peer whose queue is full at broadcast
//! time is a slow consumer: it is removed and its queue closed, the rest of
//! the room still receives the frame.
//!
//! The snapshot load races with the applier, so it may already contain edits
//! whose `operation` frames reach the joiner afterwards. Operation frames at
//! or below the snapshot's version are not delivered to that joiner.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{self, Envelope, NoteId, ParticipantId};
use crate::storage::DocumentStore;

/// An encoded envelope, shared between every recipient.
pub type Frame = Arc<str>;

/// Ephemeral per-socket identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection ready to join a room. The receiving half of its outbound
/// queue goes to the connection's writer loop.
#[derive(Debug)]
pub struct Peer {
    pub id: ConnectionId,
    pub note_id: NoteId,
    pub participant: ParticipantId,
    sender: mpsc::Sender<Frame>,
}

impl Peer {
    pub fn new(
        note_id: NoteId,
        participant: ParticipantId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let peer = Self {
            id: ConnectionId::new(),
            note_id,
            participant,
            sender,
        };
        (peer, receiver)
    }
}

/// Counters reported by [`Hub::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub slow_consumers_dropped: u64,
    pub malformed_frames: u64,
}

enum Command {
    Register(Peer),
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        frame: Frame,
        exclude: Option<ConnectionId>,
    },
    SnapshotReady {
        id: ConnectionId,
        note_id: NoteId,
        snapshot: Option<Snapshot>,
    },
    Stats(oneshot::Sender<HubStats>),
    Members {
        note_id: NoteId,
        reply: oneshot::Sender<Vec<ParticipantId>>,
    },
    Shutdown,
}

/// Cloneable handle to the hub worker.
///
/// Every method only enqueues a request. Requests sent after the worker
/// has stopped are dropped.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn DocumentStore>, request_capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(request_capacity.max(1));
        let worker = HubWorker {
            store,
            rooms: HashMap::new(),
            index: HashMap::new(),
            stats: HubStats::default(),
            loopback: commands.downgrade(),
        };
        tokio::spawn(worker.run(receiver));
        Self { commands }
    }

    /// Join the peer's room and schedule its `sync` snapshot.
    pub async fn register(&self, peer: Peer) {
        self.send(Command::Register(peer)).await;
    }

    /// Leave the room and close the outbound queue. Idempotent.
    pub async fn unregister(&self, id: ConnectionId) {
        self.send(Command::Unregister { id }).await;
    }

    /// Fan an encoded envelope out to the room named by its `note_id`.
    pub async fn broadcast(&self, frame: impl Into<Frame>, exclude: Option<ConnectionId>) {
        let frame = frame.into();
        self.send(Command::Broadcast { frame, exclude }).await;
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// Participants currently in a room, sorted. Empty if the room does not exist.
    pub async fn room_members(&self, note_id: &NoteId) -> Vec<ParticipantId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Members {
            note_id: note_id.clone(),
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    /// Stop the worker and close every outbound queue.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            log::debug!("Hub worker stopped, request dropped");
        }
    }
}

/// Encoded `sync` envelope and the document version it carries.
struct Snapshot {
    frame: Frame,
    version: u64,
}

struct Member {
    participant: ParticipantId,
    sender: mpsc::Sender<Frame>,
    /// Frames held back until the snapshot has been queued, with their
    /// operation version if they are `operation` envelopes.
    pending: Option<Vec<(Frame, Option<u64>)>>,
    /// Version of the delivered snapshot. Operations up to it are already applied.
    synced_version: Option<u64>,
}

impl Member {
    /// Queue a frame, buffering while the snapshot is outstanding.
    fn deliver(&mut self, frame: Frame, op_version: Option<u64>) -> Delivery {
        if let Some(pending) = &mut self.pending {
            if pending.len() >= self.sender.max_capacity() {
                return Delivery::Full;
            }
            pending.push((frame, op_version));
            return Delivery::Buffered;
        }
        if let (Some(op), Some(synced)) = (op_version, self.synced_version) {
            if op <= synced {
                return Delivery::Skipped;
            }
        }
        match self.sender.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

enum Delivery {
    Sent,
    Buffered,
    /// Operation already contained in the member's snapshot.
    Skipped,
    Full,
    Closed,
}

struct HubWorker {
    store: Arc<dyn DocumentStore>,
    rooms: HashMap<NoteId, HashMap<ConnectionId, Member>>,
    /// Connection → room, so unregister needs only the connection id.
    index: HashMap<ConnectionId, NoteId>,
    stats: HubStats,
    loopback: mpsc::WeakSender<Command>,
}

impl HubWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        log::info!("Hub worker started");
        while let Some(command) = commands.recv().await {
            match command {
                Command::Register(peer) => self.register(peer),
                Command::Unregister { id } => self.unregister(id),
                Command::Broadcast { frame, exclude } => self.broadcast(frame, exclude),
                Command::SnapshotReady {
                    id,
                    note_id,
                    snapshot,
                } => self.snapshot_ready(id, &note_id, snapshot),
                Command::Stats(reply) => {
                    let _ = reply.send(self.snapshot_stats());
                }
                Command::Members { note_id, reply } => {
                    let mut members: Vec<ParticipantId> = self
                        .rooms
                        .get(&note_id)
                        .map(|room| room.values().map(|m| m.participant).collect())
                        .unwrap_or_default();
                    members.sort_unstable();
                    let _ = reply.send(members);
                }
                Command::Shutdown => break,
            }
        }
        let connections = self.index.len();
        self.rooms.clear();
        self.index.clear();
        log::info!("Hub worker stopped ({connections} connections closed)");
    }

    fn register(&mut self, peer: Peer) {
        if self.index.contains_key(&peer.id) {
            log::warn!("Connection {} registered twice, ignoring", peer.id);
            return;
        }

        let Peer {
            id,
            note_id,
            participant,
            sender,
        } = peer;

        self.index.insert(id, note_id.clone());
        self.rooms.entry(note_id.clone()).or_default().insert(
            id,
            Member {
                participant,
                sender,
                pending: Some(Vec::new()),
                synced_version: None,
            },
        );
        log::info!("Participant {participant} joined note {note_id} ({id})");

        self.spawn_snapshot(id, note_id, participant);
    }

    /// Load the document off the worker and report back with `SnapshotReady`.
    fn spawn_snapshot(&self, id: ConnectionId, note_id: NoteId, participant: ParticipantId) {
        let store = Arc::clone(&self.store);
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            let snapshot = match store.load(&note_id).await {
                Ok(state) => {
                    let version = state.version;
                    match Envelope::sync(note_id.clone(), participant, state.content, version)
                        .encode()
                    {
                        Ok(encoded) => Some(Snapshot {
                            frame: Frame::from(encoded),
                            version,
                        }),
                        Err(e) => {
                            log::error!("Failed to encode snapshot of note {note_id}: {e}");
                            None
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Snapshot of note {note_id} skipped: {e}");
                    None
                }
            };
            if let Some(commands) = loopback.upgrade() {
                let _ = commands
                    .send(Command::SnapshotReady {
                        id,
                        note_id,
                        snapshot,
                    })
                    .await;
            }
        });
    }

    fn snapshot_ready(&mut self, id: ConnectionId, note_id: &NoteId, snapshot: Option<Snapshot>) {
        let Some(member) = self.rooms.get_mut(note_id).and_then(|room| room.get_mut(&id)) else {
            log::debug!("Snapshot for departed connection {id} discarded");
            return;
        };

        let pending = member.pending.take().unwrap_or_default();
        let mut outcome = Delivery::Sent;
        if let Some(snapshot) = snapshot {
            outcome = member.deliver(snapshot.frame, None);
            member.synced_version = Some(snapshot.version);
        }
        if matches!(outcome, Delivery::Sent) {
            for (frame, op_version) in pending {
                outcome = member.deliver(frame, op_version);
                match outcome {
                    Delivery::Full | Delivery::Closed => break,
                    Delivery::Skipped => {
                        log::debug!("Operation already in snapshot of {id}, not replayed");
                    }
                    Delivery::Sent | Delivery::Buffered => {}
                }
            }
        }

        match outcome {
            Delivery::Full => {
                log::warn!("Connection {id} overflowed while syncing, dropping");
                self.stats.slow_consumers_dropped += 1;
                self.unregister(id);
            }
            Delivery::Closed => self.unregister(id),
            Delivery::Sent | Delivery::Buffered | Delivery::Skipped => {}
        }
    }

    fn unregister(&mut self, id: ConnectionId) {
        let Some(note_id) = self.index.remove(&id) else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&note_id) {
            if let Some(member) = room.remove(&id) {
                log::info!(
                    "Participant {} left note {note_id} ({id})",
                    member.participant
                );
            }
            if room.is_empty() {
                self.rooms.remove(&note_id);
                log::debug!("Room {note_id} closed");
            }
        }
    }

    fn broadcast(&mut self, frame: Frame, exclude: Option<ConnectionId>) {
        let route = match protocol::route(&frame) {
            Ok(route) => route,
            Err(e) => {
                self.stats.malformed_frames += 1;
                log::warn!("Dropping malformed broadcast frame: {e}");
                return;
            }
        };
        self.stats.broadcasts += 1;
        let op_version = route.operation_version();
        let note_id = route.note_id;

        let Some(room) = self.rooms.get_mut(&note_id) else {
            log::trace!("Broadcast to empty note {note_id}");
            return;
        };

        let mut dropped = Vec::new();
        for (id, member) in room.iter_mut() {
            if Some(*id) == exclude {
                continue;
            }
            match member.deliver(Arc::clone(&frame), op_version) {
                Delivery::Sent => self.stats.deliveries += 1,
                Delivery::Buffered | Delivery::Skipped => {}
                Delivery::Full => {
                    log::warn!(
                        "Slow consumer {id} (participant {}) dropped from note {note_id}",
                        member.participant
                    );
                    self.stats.slow_consumers_dropped += 1;
                    dropped.push(*id);
                }
                Delivery::Closed => dropped.push(*id),
            }
        }

        for id in dropped {
            self.unregister(id);
        }
    }

    fn snapshot_stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.len(),
            connections: self.index.len(),
            ..self.stats.clone()
        }
    }
}
