//! Per-connection state
//!
//! One `Connection` exists per open WebSocket: it owns the bounded outbound
//! queue drained by the send task, the language watch consumed by the
//! stream processor, the mute flag, and the close signal observed by all
//! three tasks. Everything here is independently synchronized; none of it
//! requires the manager lock.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::server::protocol::ServerMessage;
use crate::types::{LanguagePair, RoomId, UserId};

/// Why a connection is being closed; maps to the WebSocket close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean shutdown
    Normal,
    /// Evicted by a new authenticated connection for the same (user, room)
    Replaced,
    /// The same user connected to a different room
    RoomSwitch,
    /// Server-side failure
    Internal,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal | Self::RoomSwitch => 1000,
            Self::Replaced => 4001,
            Self::Internal => 1011,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Replaced => "replaced by new connection",
            Self::RoomSwitch => "joined another room",
            Self::Internal => "internal error",
        }
    }
}

/// Result of an outbound enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue was full; the oldest message was discarded to make room
    DroppedOldest,
    /// Connection already closed; message discarded
    Closed,
}

/// Bounded outbound queue with drop-oldest overflow
#[derive(Debug)]
struct Outbox {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    depth: usize,
    closed: AtomicBool,
}

impl Outbox {
    fn new(depth: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            depth: depth.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, message: ServerMessage) -> Enqueue {
        if self.closed.load(Ordering::Acquire) {
            return Enqueue::Closed;
        }
        let outcome = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(message);
            if queue.len() > self.depth {
                queue.pop_front();
                Enqueue::DroppedOldest
            } else {
                Enqueue::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next message; `None` once closed and drained
    async fn recv(&self) -> Option<ServerMessage> {
        loop {
            if let Some(message) = self.queue.lock().unwrap().pop_front() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Live connection for one (user, room) pair
#[derive(Debug)]
pub struct Connection {
    /// Instance id distinguishing this connection from a replacement
    pub id: Uuid,
    pub user_id: UserId,
    pub room_id: RoomId,
    /// Display name resolved at connect time
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    langs_tx: watch::Sender<LanguagePair>,
    muted: AtomicBool,
    outbox: Outbox,
    close_tx: watch::Sender<Option<CloseReason>>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub fn new(
        user_id: UserId,
        room_id: RoomId,
        user_name: String,
        languages: LanguagePair,
        outbound_depth: usize,
    ) -> Self {
        let (langs_tx, _) = watch::channel(languages);
        let (close_tx, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            user_id,
            room_id,
            user_name,
            created_at: Utc::now(),
            langs_tx,
            muted: AtomicBool::new(false),
            outbox: Outbox::new(outbound_depth),
            close_tx,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn languages(&self) -> LanguagePair {
        self.langs_tx.borrow().clone()
    }

    /// Hot-swap languages; the processor picks the change up next cycle
    pub fn set_languages(&self, languages: LanguagePair) {
        self.langs_tx.send_replace(languages);
    }

    pub fn watch_languages(&self) -> watch::Receiver<LanguagePair> {
        self.langs_tx.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Non-blocking outbound enqueue with drop-oldest overflow
    pub fn enqueue(&self, message: ServerMessage) -> Enqueue {
        self.outbox.push(message)
    }

    /// Drained by the send task; `None` once the connection is closed
    pub async fn next_outbound(&self) -> Option<ServerMessage> {
        self.outbox.recv().await
    }

    /// Signal all tasks of this connection to stop. Idempotent; the first
    /// reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        self.outbox.close();
    }

    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}
