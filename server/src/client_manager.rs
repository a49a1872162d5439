//! Connection table and owner handles.
//!
//! This module tracks every live connection the server knows about:
//! - Owner id assignment and capacity limits
//! - Activity tracking and idle-timeout sweeping
//! - Outbound frame queues that handlers reply through
//!
//! An [`Owner`] is the identity a decoded message is bound to while it is
//! processed. Handles are cheap clones; once the connection closes every
//! clone observes it and further sends fail with `OwnerGone`.

use crate::error::{Result, ServerError};
use bytes::Bytes;
use log::{debug, info, warn};
use shared::WireMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug)]
struct OwnerInner {
    id: u32,
    addr: SocketAddr,
    last_seen: Mutex<Instant>,
    closed: watch::Sender<bool>,
    outbound: mpsc::Sender<Bytes>,
}

/// Handle to a connected client.
#[derive(Debug, Clone)]
pub struct Owner {
    inner: Arc<OwnerInner>,
}

impl Owner {
    /// Creates an owner plus the receiving end of its outbound queue.
    pub fn new(id: u32, addr: SocketAddr, outbound_capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity);
        let (closed, _) = watch::channel(false);

        let owner = Self {
            inner: Arc::new(OwnerInner {
                id,
                addr,
                last_seen: Mutex::new(Instant::now()),
                closed,
                outbound,
            }),
        };
        (owner, outbound_rx)
    }

    /// Unique client identifier assigned by the server
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Peer address the connection was accepted from
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Checks whether the connection is still open
    ///
    /// Turns false exactly once, when the owner is closed by a disconnect,
    /// a timeout or a fatal read error. Work bound to a closed owner is
    /// skipped rather than run against a dead connection.
    pub fn is_alive(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        let mut last_seen = self.inner.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        *last_seen = Instant::now();
    }

    /// Time since the last inbound frame
    pub fn idle_for(&self) -> Duration {
        let last_seen = self.inner.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        last_seen.elapsed()
    }

    /// Marks the connection closed. Idempotent.
    pub fn close(&self) {
        let was_closed = self.inner.closed.send_replace(true);
        if !was_closed {
            debug!("Owner {} closed", self.inner.id);
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Queues an already encoded frame. Never waits for the socket.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.is_alive() {
            return Err(ServerError::OwnerGone(self.id()));
        }

        self.inner.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Outbound queue full for owner {}", self.id());
                ServerError::QueueFull(format!("owner-{}", self.id()))
            }
            mpsc::error::TrySendError::Closed(_) => ServerError::OwnerGone(self.id()),
        })
    }

    pub fn send<M: WireMessage>(&self, message: &M) -> Result<()> {
        self.send_frame(message.encode()?)
    }
}

/// All live connections, indexed by owner id.
///
/// Ids start at 1 and are never reused within a process.
pub struct ClientManager {
    clients: HashMap<u32, Owner>,
    next_client_id: u32,
    max_clients: usize,
    outbound_capacity: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize, outbound_capacity: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            outbound_capacity,
        }
    }

    /// Registers a new connection, or returns None at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<(Owner, mpsc::Receiver<Bytes>)> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let (owner, outbound_rx) = Owner::new(client_id, addr, self.outbound_capacity);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, owner.clone());

        Some((owner, outbound_rx))
    }

    /// Removes and closes a client. Returns false if it was already gone.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(owner) = self.clients.remove(client_id) {
            owner.close();
            info!("Client {} ({}) disconnected", client_id, owner.addr());
            true
        } else {
            false
        }
    }

    /// Looks up a connected client by ID
    ///
    /// Returns a cloned handle, so the caller can send to the owner without
    /// holding the table lock. Used for directed messages such as a whisper
    /// to a named recipient.
    pub fn get(&self, client_id: u32) -> Option<Owner> {
        self.clients.get(&client_id).cloned()
    }

    /// Snapshot of every live owner
    ///
    /// Owners already closed but not yet removed are left out. The snapshot
    /// is taken under the table lock and is safe to iterate after the lock
    /// is released, which is how broadcasts fan out.
    pub fn owners(&self) -> Vec<Owner> {
        self.clients.values().filter(|o| o.is_alive()).cloned().collect()
    }

    /// Closes and removes clients idle for longer than `timeout`.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, owner)| owner.idle_for() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            warn!("Client {} timed out", client_id);
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Number of clients currently in the table, closed or not
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
