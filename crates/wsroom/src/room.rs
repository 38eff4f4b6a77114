//! Broadcast rooms.
//!
//! A [`Room`] owns a named group of peers and one coordinating thread. Enter,
//! leave and message events go through a single bounded queue and are
//! processed strictly in submission order:
//!
//! ```text
//! enter(peer, payload)   -> add peer,    broadcast payload, on_enter
//! leave(peer, payload)   -> remove peer, broadcast payload, on_leave
//! message(peer, payload) ->              broadcast payload, on_message
//! ```
//!
//! Membership lives behind a short-held lock. Broadcasts snapshot the member
//! list in insertion order, release the lock, then write to each peer in turn,
//! so a slow peer never blocks `add`/`remove`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::close::CloseCode;
use crate::config::RoomConfig;
use crate::connection::{Connection, ConnectionId, Transport};
use crate::error::{Result, RoomError, WsError};
use crate::frame::Opcode;

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// The room's view of a member.
pub trait Peer: Send + Sync {
    fn id(&self) -> ConnectionId;
    /// Send one complete message.
    fn send(&self, payload: &[u8], opcode: Opcode) -> Result<()>;
    fn close(&self, code: CloseCode, reason: &str) -> Result<()>;
}

impl<T: Transport> Peer for Connection<T> {
    fn id(&self) -> ConnectionId {
        Connection::id(self)
    }

    fn send(&self, payload: &[u8], opcode: Opcode) -> Result<()> {
        self.write_message(payload, opcode)
    }

    fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        Connection::close(self, code, reason)
    }
}

// ---------------------------------------------------------------------------
// Events and hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enter,
    Leave,
    Message,
}

/// One queued room event.
#[derive(Clone)]
pub struct RoomEvent {
    pub kind: EventKind,
    pub peer: Arc<dyn Peer>,
    pub payload: Vec<u8>,
    /// Opcode the payload is broadcast with.
    pub opcode: Opcode,
}

impl RoomEvent {
    pub fn new(kind: EventKind, peer: Arc<dyn Peer>, payload: impl Into<Vec<u8>>) -> RoomEvent {
        RoomEvent {
            kind,
            peer,
            payload: payload.into(),
            opcode: Opcode::Text,
        }
    }

    pub fn with_opcode(mut self, opcode: Opcode) -> RoomEvent {
        self.opcode = opcode;
        self
    }
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomEvent")
            .field("kind", &self.kind)
            .field("peer", &self.peer.id())
            .field("payload_len", &self.payload.len())
            .field("opcode", &self.opcode)
            .finish()
    }
}

/// Callbacks run on the room's coordinating thread, after the event's
/// membership change and broadcast.
pub trait RoomHooks: Send + Sync {
    /// A member write or close failed.
    fn on_error(&self, error: &WsError) {
        warn!(error = %error, "room error");
    }

    fn on_enter(&self, _event: &RoomEvent) {}

    fn on_leave(&self, _event: &RoomEvent) {}

    fn on_message(&self, _event: &RoomEvent) {}
}

/// Hooks that only log errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl RoomHooks for LoggingHooks {}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

struct Member {
    seq: u64,
    peer: Arc<dyn Peer>,
}

struct Shared {
    name: String,
    config: RoomConfig,
    hooks: Arc<dyn RoomHooks>,
    members: Mutex<FxHashMap<ConnectionId, Member>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    /// Insert `peer` unless the room is closed. `closed` only flips while
    /// the members lock is held, so nothing joins after `close` drained.
    fn add(&self, peer: Arc<dyn Peer>) -> bool {
        let id = peer.id();
        let mut members = self.members.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!(room = %self.name, peer = %id, "room closed, member not added");
            return false;
        }
        // Re-adding keeps the original position
        members.entry(id).or_insert_with(|| Member {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            peer,
        });
        true
    }

    /// Mark the room closed and take every member out. `None` if it was
    /// already closed.
    fn drain_for_close(&self) -> Option<Vec<Arc<dyn Peer>>> {
        let mut members = self.members.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut drained: Vec<Member> = members.drain().map(|(_, m)| m).collect();
        drained.sort_unstable_by_key(|m| m.seq);
        Some(drained.into_iter().map(|m| m.peer).collect())
    }

    /// Close every peer concurrently so silent peers' close timeouts overlap.
    fn close_peers(&self, peers: Vec<Arc<dyn Peer>>) {
        thread::scope(|scope| {
            for peer in peers {
                let spawned = thread::Builder::new()
                    .name(format!("room-{}-close", self.name))
                    .spawn_scoped(scope, {
                        let peer = Arc::clone(&peer);
                        move || self.close_peer(&peer)
                    });
                if spawned.is_err() {
                    self.close_peer(&peer);
                }
            }
        });
    }

    fn close_peer(&self, peer: &Arc<dyn Peer>) {
        if let Err(e) = peer.close(CloseCode::Normal, "") {
            self.hooks.on_error(&e);
        }
    }

    fn remove(&self, id: ConnectionId) -> bool {
        self.members.lock().remove(&id).is_some()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        let members = self.members.lock();
        let mut ordered: Vec<(u64, Arc<dyn Peer>)> = members
            .values()
            .map(|m| (m.seq, Arc::clone(&m.peer)))
            .collect();
        drop(members);
        ordered.sort_unstable_by_key(|(seq, _)| *seq);
        ordered.into_iter().map(|(_, peer)| peer).collect()
    }

    fn broadcast(&self, payload: &[u8], opcode: Opcode) -> std::result::Result<(), RoomError> {
        for peer in self.snapshot() {
            if let Err(source) = peer.send(payload, opcode) {
                let peer = peer.id();
                if self.config.restricted_broadcast {
                    return Err(RoomError::Broadcast { peer, source });
                }
                debug!(room = %self.name, peer = %peer, "broadcast write failed");
                self.hooks.on_error(&source);
            }
        }
        Ok(())
    }

    fn handle(&self, event: RoomEvent) {
        match event.kind {
            EventKind::Enter => {
                if !self.add(Arc::clone(&event.peer)) {
                    return;
                }
            }
            EventKind::Leave => {
                self.remove(event.peer.id());
            }
            EventKind::Message => {}
        }

        if let Err(err) = self.broadcast(&event.payload, event.opcode) {
            if let RoomError::Broadcast { source, .. } = &err {
                self.hooks.on_error(source);
            }
        }

        match event.kind {
            EventKind::Enter => self.hooks.on_enter(&event),
            EventKind::Leave => self.hooks.on_leave(&event),
            EventKind::Message => self.hooks.on_message(&event),
        }
    }
}

fn run(shared: Arc<Shared>, events: Receiver<RoomEvent>) {
    debug!(room = %shared.name, "room loop started");
    for event in events.iter() {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.handle(event);
    }
    debug!(room = %shared.name, "room loop stopped");
}

/// A named broadcast group with its own coordinating thread.
pub struct Room {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<RoomEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.shared.name)
            .field("members", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Room {
    /// Create a room and start its coordinating thread.
    pub fn new(name: impl Into<String>, config: RoomConfig, hooks: Arc<dyn RoomHooks>) -> std::io::Result<Room> {
        let name = name.into();
        let (sender, receiver) = bounded(config.event_queue_capacity);
        let shared = Arc::new(Shared {
            name: name.clone(),
            config,
            hooks,
            members: Mutex::new(FxHashMap::default()),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("room-{name}"))
                .spawn(move || run(shared, receiver))?
        };

        Ok(Room {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A room with default configuration and [`LoggingHooks`].
    pub fn with_defaults(name: impl Into<String>) -> std::io::Result<Room> {
        Room::new(name, RoomConfig::default(), Arc::new(LoggingHooks))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &RoomConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue an event. Blocks while the queue is full.
    pub fn submit(&self, event: RoomEvent) -> std::result::Result<(), RoomError> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender.filter(|_| !self.is_closed()) else {
            return Err(RoomError::Closed(self.shared.name.clone()));
        };
        sender
            .send(event)
            .map_err(|_| RoomError::Closed(self.shared.name.clone()))
    }

    /// Queue an Enter event: `peer` joins, then `payload` is broadcast.
    pub fn enter(&self, peer: Arc<dyn Peer>, payload: impl Into<Vec<u8>>) -> std::result::Result<(), RoomError> {
        self.submit(RoomEvent::new(EventKind::Enter, peer, payload))
    }

    /// Queue a Leave event: `peer` is removed, then `payload` is broadcast.
    pub fn leave(&self, peer: Arc<dyn Peer>, payload: impl Into<Vec<u8>>) -> std::result::Result<(), RoomError> {
        self.submit(RoomEvent::new(EventKind::Leave, peer, payload))
    }

    /// Queue a Message event: `payload` is broadcast to every member.
    pub fn message(&self, peer: Arc<dyn Peer>, payload: impl Into<Vec<u8>>) -> std::result::Result<(), RoomError> {
        self.submit(RoomEvent::new(EventKind::Message, peer, payload))
    }

    /// Add a member directly, bypassing the event queue. Adding a member
    /// twice is a no-op. Returns `false` once the room is closed.
    pub fn add(&self, peer: Arc<dyn Peer>) -> bool {
        self.shared.add(peer)
    }

    /// Remove a member directly. Returns whether it was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.shared.remove(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.shared.members.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members in the order they joined.
    pub fn members(&self) -> Vec<ConnectionId> {
        self.shared.snapshot().iter().map(|p| p.id()).collect()
    }

    /// Write `payload` to every current member.
    ///
    /// With `restricted_broadcast` the first failed write stops the broadcast
    /// and is returned; otherwise every member is attempted, each failure is
    /// reported once through `on_error`, and the call succeeds. Failing
    /// members stay in the room either way.
    pub fn broadcast(&self, payload: &[u8], opcode: Opcode) -> std::result::Result<(), RoomError> {
        self.shared.broadcast(payload, opcode)
    }

    /// Close every member with 1000, clear the membership and stop the
    /// coordinating thread. Idempotent. Events still queued are dropped, and
    /// no member is admitted afterwards.
    ///
    /// Members are closed concurrently, so the call takes about one close
    /// timeout however many members are silent.
    pub fn close(&self) {
        let Some(members) = self.shared.drain_for_close() else {
            return;
        };
        debug!(room = %self.shared.name, members = members.len(), "closing room");
        self.shared.close_peers(members);

        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            // A hook may close the room from the coordinating thread itself
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(room = %self.shared.name, "room thread panicked");
            }
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.close();
    }
}
