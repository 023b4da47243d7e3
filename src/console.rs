//! Console fan-out from backend child stdio to subscribers.
//!
//! A single hub task owns the per-session subscriber registry and is
//! driven by three channels (register, unregister, broadcast); that task
//! is the only serialization point. Adapter-side writers copy every chunk
//! before hand-off, so callers may reuse their buffers. Each subscriber
//! has a bounded queue; one that cannot keep up is closed and removed.
//!
//! The transport loops that pump frames to wire connections live outside
//! the core; they are expected to honour [`READ_IDLE_TIMEOUT`] and
//! [`WRITE_TIMEOUT`], with the hub emitting keep-alive pings on
//! [`PING_INTERVAL`].

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Idle limit for a subscriber's read side.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Keep-alive cadence; must stay below [`READ_IDLE_TIMEOUT`].
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Deadline for a single frame write on the wire.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered per subscriber before it is declared slow and dropped.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
/// Broadcast ingress queue shared by all writers.
const HUB_QUEUE_CAPACITY: usize = 256;

/// A framed message delivered to console subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A chunk of child stdout/stderr, delivered in write order.
    Console(Bytes),
    /// Keep-alive marker.
    Ping,
}

struct Register {
    session_id: String,
    subscriber_id: u64,
    tx: mpsc::Sender<Frame>,
}

struct Unregister {
    session_id: String,
    subscriber_id: u64,
}

struct Broadcast {
    session_id: String,
    frame: Frame,
}

/// Handle to the fan-out hub. Clones share the same hub task, which
/// exits once every handle and sink has been dropped.
#[derive(Clone)]
pub struct ConsoleHub {
    register_tx: mpsc::UnboundedSender<Register>,
    unregister_tx: mpsc::UnboundedSender<Unregister>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl ConsoleHub {
    /// Start the hub task and return a handle to it.
    pub fn spawn() -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(HUB_QUEUE_CAPACITY);

        tokio::spawn(run(register_rx, unregister_rx, broadcast_rx));

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new subscriber for a session's console stream.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let _ = self.register_tx.send(Register {
            session_id: session_id.to_string(),
            subscriber_id,
            tx,
        });
        Subscription {
            session_id: session_id.to_string(),
            subscriber_id,
            rx,
            unregister_tx: self.unregister_tx.clone(),
        }
    }

    /// Byte-writer handed to an adapter for one session's child stdio.
    pub fn sink(&self, session_id: &str) -> ConsoleSink {
        ConsoleSink {
            session_id: session_id.to_string(),
            broadcast_tx: self.broadcast_tx.clone(),
        }
    }
}

/// Adapter-side writer for one session's console bytes.
#[derive(Clone)]
pub struct ConsoleSink {
    session_id: String,
    broadcast_tx: mpsc::Sender<Broadcast>,
}

impl ConsoleSink {
    /// Forward one chunk to all subscribers of the session.
    ///
    /// The slice is copied before hand-off; the caller may reuse its
    /// buffer immediately. Delivery is best-effort: a hub that has shut
    /// down swallows the write.
    pub async fn write(&self, chunk: &[u8]) {
        let frame = Frame::Console(Bytes::copy_from_slice(chunk));
        let _ = self
            .broadcast_tx
            .send(Broadcast {
                session_id: self.session_id.clone(),
                frame,
            })
            .await;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// A registered console subscriber. Dropping it unregisters from the hub.
pub struct Subscription {
    session_id: String,
    subscriber_id: u64,
    rx: mpsc::Receiver<Frame>,
    unregister_tx: mpsc::UnboundedSender<Unregister>,
}

impl Subscription {
    /// Receive the next frame; `None` once the hub dropped this
    /// subscriber (slow consumer) or shut down.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.unregister_tx.send(Unregister {
            session_id: self.session_id.clone(),
            subscriber_id: self.subscriber_id,
        });
    }
}

async fn run(
    mut register_rx: mpsc::UnboundedReceiver<Register>,
    mut unregister_rx: mpsc::UnboundedReceiver<Unregister>,
    mut broadcast_rx: mpsc::Receiver<Broadcast>,
) {
    let mut sessions: HashMap<String, HashMap<u64, mpsc::Sender<Frame>>> = HashMap::new();
    // First tick lands a full interval out.
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // Registrations drain ahead of broadcasts so a subscriber
            // never misses a chunk written after it subscribed.
            biased;

            Some(reg) = register_rx.recv() => {
                trace!(session_id = %reg.session_id, subscriber = reg.subscriber_id, "console subscribe");
                sessions
                    .entry(reg.session_id)
                    .or_default()
                    .insert(reg.subscriber_id, reg.tx);
            }

            Some(unreg) = unregister_rx.recv() => {
                if let Some(subs) = sessions.get_mut(&unreg.session_id) {
                    subs.remove(&unreg.subscriber_id);
                    if subs.is_empty() {
                        sessions.remove(&unreg.session_id);
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Some(b) => deliver(&mut sessions, &b.session_id, b.frame),
                    // Every hub handle and sink is gone.
                    None => break,
                }
            }

            _ = ping.tick() => {
                let ids: Vec<String> = sessions.keys().cloned().collect();
                for session_id in ids {
                    deliver(&mut sessions, &session_id, Frame::Ping);
                }
            }
        }
    }
}

fn deliver(
    sessions: &mut HashMap<String, HashMap<u64, mpsc::Sender<Frame>>>,
    session_id: &str,
    frame: Frame,
) {
    let Some(subs) = sessions.get_mut(session_id) else {
        return;
    };

    let mut slow = Vec::new();
    for (&id, tx) in subs.iter() {
        if tx.try_send(frame.clone()).is_err() {
            // Full queue or gone receiver; dropping the sender closes the
            // subscriber's stream after it drains what is buffered.
            slow.push(id);
        }
    }
    for id in slow {
        debug!(session_id, subscriber = id, "dropping slow console subscriber");
        subs.remove(&id);
    }
    if subs.is_empty() {
        sessions.remove(session_id);
    }
}
