use std::collections::HashMap;

use axum::extract::ws::close_code;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};

use crate::identity::Identity;
use crate::protocol::{generate_connection_id, ConnectionId, PeerInfo, ServerMessage};

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Close code and reason delivered to a connection the server shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
    pub label: &'static str,
}

impl CloseReason {
    pub const AUTH_TIMEOUT: Self = Self {
        code: close_code::POLICY,
        reason: "auth timeout",
        label: "auth_timeout",
    };
    pub const AUTH_REJECTED: Self = Self {
        code: close_code::POLICY,
        reason: "auth rejected",
        label: "auth_rejected",
    };
    pub const SLOW_CONSUMER: Self = Self {
        code: close_code::POLICY,
        reason: "slow consumer",
        label: "slow_consumer",
    };
    pub const MALFORMED_FRAME: Self = Self {
        code: close_code::PROTOCOL,
        reason: "malformed frame",
        label: "malformed_frame",
    };
    pub const IDLE: Self = Self {
        code: close_code::POLICY,
        reason: "idle timeout",
        label: "idle_timeout",
    };
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
    #[error("connection {0} is already authenticated")]
    AlreadyAuthenticated(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
}

/// Read-only copy of a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionView {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    pub opened_at: DateTime<Utc>,
    pub authenticated_at: Option<DateTime<Utc>>,
}

/// Receiving halves handed to the connection's writer task.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub shutdown: oneshot::Receiver<CloseReason>,
}

/// What `remove`/`close` took out of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Removed {
    pub id: ConnectionId,
    pub identity: Option<Identity>,
}

impl Removed {
    pub fn was_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Outbound queue at capacity.
    Full,
    /// Entry missing or its writer already gone.
    Gone,
}

struct Authenticated {
    identity: Identity,
    seq: u64,
    at: DateTime<Utc>,
}

struct ConnectionEntry {
    outbound: mpsc::Sender<ServerMessage>,
    shutdown: Option<oneshot::Sender<CloseReason>>,
    deadline: Option<AbortHandle>,
    opened_at: DateTime<Utc>,
    auth: Option<Authenticated>,
}

impl ConnectionEntry {
    /// Idempotent; the handle is taken on first call.
    fn cancel_deadline(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}

/// Every live connection, keyed by id. A removed id is never handed out again.
///
/// The registry does no locking of its own: callers serialize access so that the
/// directory sequences in [`crate::directory`] observe it atomically.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    outbound_buffer: usize,
    next_seq: u64,
}

impl ConnectionRegistry {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            connections: HashMap::new(),
            outbound_buffer: outbound_buffer.max(1),
            next_seq: 0,
        }
    }

    /// Create a Connecting entry.
    pub fn register(&mut self) -> Registration {
        let mut id = generate_connection_id();
        while self.connections.contains_key(&id) {
            id = generate_connection_id();
        }
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                outbound: tx,
                shutdown: Some(shutdown_tx),
                deadline: None,
                opened_at: Utc::now(),
                auth: None,
            },
        );
        Registration {
            id,
            outbound: rx,
            shutdown: shutdown_rx,
        }
    }

    pub fn get(&self, id: &str) -> Option<ConnectionView> {
        self.connections.get(id).map(|entry| ConnectionView {
            id: id.to_string(),
            state: if entry.auth.is_some() {
                ConnectionState::Authenticated
            } else {
                ConnectionState::Connecting
            },
            identity: entry.auth.as_ref().map(|auth| auth.identity.clone()),
            opened_at: entry.opened_at,
            authenticated_at: entry.auth.as_ref().map(|auth| auth.at),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn is_authenticated(&self, id: &str) -> bool {
        self.connections
            .get(id)
            .map(|entry| entry.auth.is_some())
            .unwrap_or(false)
    }

    /// Store the auth deadline handle. Returns false, and aborts the handle, if the
    /// connection is gone or already past Connecting.
    pub fn arm_deadline(&mut self, id: &str, handle: AbortHandle) -> bool {
        match self.connections.get_mut(id) {
            Some(entry) if entry.auth.is_none() => {
                entry.cancel_deadline();
                entry.deadline = Some(handle);
                true
            }
            _ => {
                handle.abort();
                false
            }
        }
    }

    /// Connecting -> Authenticated. The identity can be set only once.
    pub fn attach_identity(&mut self, id: &str, identity: Identity) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if entry.auth.is_some() {
            return Err(RegistryError::AlreadyAuthenticated(id.to_string()));
        }
        entry.cancel_deadline();
        entry.auth = Some(Authenticated {
            identity,
            seq: self.next_seq,
            at: Utc::now(),
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Idempotent. Dropping the entry drops its outbound sender, which ends the
    /// connection's writer once the queue drains.
    pub fn remove(&mut self, id: &str) -> Option<Removed> {
        let mut entry = self.connections.remove(id)?;
        entry.cancel_deadline();
        Some(Removed {
            id: id.to_string(),
            identity: entry.auth.map(|auth| auth.identity),
        })
    }

    /// Remove and tell the writer to close the transport with `reason`.
    pub fn close(&mut self, id: &str, reason: CloseReason) -> Option<Removed> {
        if let Some(entry) = self.connections.get_mut(id) {
            if let Some(shutdown) = entry.shutdown.take() {
                let _ = shutdown.send(reason);
            }
        }
        self.remove(id)
    }

    pub fn send(&self, id: &str, message: ServerMessage) -> SendOutcome {
        let Some(entry) = self.connections.get(id) else {
            return SendOutcome::Gone;
        };
        match entry.outbound.try_send(message) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Gone,
        }
    }

    /// Authenticated peers in the order they authenticated.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers_except(None)
    }

    pub fn peers_except(&self, excluded: Option<&str>) -> Vec<PeerInfo> {
        let mut peers: Vec<(u64, PeerInfo)> = self
            .connections
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != excluded)
            .filter_map(|(id, entry)| {
                entry.auth.as_ref().map(|auth| {
                    (
                        auth.seq,
                        PeerInfo {
                            client_id: id.clone(),
                            identity: auth.identity.clone(),
                        },
                    )
                })
            })
            .collect();
        peers.sort_by_key(|(seq, _)| *seq);
        peers.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Views of all authenticated entries, in authentication order.
    pub fn peer_views(&self) -> Vec<ConnectionView> {
        self.peers()
            .into_iter()
            .filter_map(|peer| self.get(&peer.client_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections
            .values()
            .filter(|entry| entry.auth.is_some())
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(member: &str) -> Identity {
        Identity {
            member_id: member.to_string(),
            display_name: member.to_uppercase(),
            avatar_ref: None,
        }
    }

    #[test_timeout::timeout]
    fn register_creates_connecting_entry() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a.id, b.id);

        let view = registry.get(&a.id).unwrap();
        assert_eq!(view.state, ConnectionState::Connecting);
        assert!(view.identity.is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.authenticated_count(), 0);
    }

    #[test_timeout::timeout]
    fn identity_is_attached_at_most_once() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        registry.attach_identity(&a.id, identity("m1")).unwrap();

        let err = registry.attach_identity(&a.id, identity("m2")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyAuthenticated(a.id.clone()));
        let view = registry.get(&a.id).unwrap();
        assert_eq!(view.state, ConnectionState::Authenticated);
        assert_eq!(view.identity.unwrap().member_id, "m1");
    }

    #[test_timeout::timeout]
    fn attach_after_removal_reports_not_found() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        registry.remove(&a.id);
        assert_eq!(
            registry.attach_identity(&a.id, identity("m1")),
            Err(RegistryError::NotFound(a.id.clone()))
        );
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        registry.attach_identity(&a.id, identity("m1")).unwrap();

        let removed = registry.remove(&a.id).unwrap();
        assert!(removed.was_authenticated());
        assert!(registry.remove(&a.id).is_none());
        assert!(registry.get(&a.id).is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn close_delivers_reason_and_ends_outbound() {
        let mut registry = ConnectionRegistry::default();
        let mut a = registry.register();
        let removed = registry.close(&a.id, CloseReason::AUTH_TIMEOUT).unwrap();
        assert!(!removed.was_authenticated());
        assert_eq!(a.shutdown.try_recv().unwrap(), CloseReason::AUTH_TIMEOUT);
        assert!(matches!(
            a.outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test_timeout::timeout]
    fn plain_remove_drops_shutdown_without_reason() {
        let mut registry = ConnectionRegistry::default();
        let mut a = registry.register();
        registry.remove(&a.id);
        assert!(matches!(
            a.shutdown.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test_timeout::timeout]
    fn send_reports_full_queue() {
        let mut registry = ConnectionRegistry::new(1);
        let a = registry.register();
        assert_eq!(registry.send(&a.id, ServerMessage::Pong), SendOutcome::Queued);
        assert_eq!(registry.send(&a.id, ServerMessage::Pong), SendOutcome::Full);
        assert_eq!(registry.send("missing", ServerMessage::Pong), SendOutcome::Gone);
    }

    #[test_timeout::timeout]
    fn send_to_dropped_receiver_is_gone() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        let id = a.id.clone();
        drop(a);
        assert_eq!(registry.send(&id, ServerMessage::Pong), SendOutcome::Gone);
    }

    #[test_timeout::timeout]
    fn peers_are_listed_in_authentication_order() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        let b = registry.register();
        let c = registry.register();
        registry.attach_identity(&c.id, identity("c")).unwrap();
        registry.attach_identity(&a.id, identity("a")).unwrap();

        let ids: Vec<_> = registry.peers().into_iter().map(|p| p.client_id).collect();
        assert_eq!(ids, vec![c.id.clone(), a.id.clone()]);

        let others: Vec<_> = registry
            .peers_except(Some(&c.id))
            .into_iter()
            .map(|p| p.client_id)
            .collect();
        assert_eq!(others, vec![a.id.clone()]);
        assert!(!registry.is_authenticated(&b.id));
    }

    #[test_timeout::tokio_timeout_test]
    async fn deadline_is_cancelled_on_authentication() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        let timer = tokio::spawn(std::future::pending::<()>());
        assert!(registry.arm_deadline(&a.id, timer.abort_handle()));

        registry.attach_identity(&a.id, identity("m1")).unwrap();
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn arming_a_finished_connection_aborts_the_timer() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.register();
        registry.attach_identity(&a.id, identity("m1")).unwrap();

        let timer = tokio::spawn(std::future::pending::<()>());
        assert!(!registry.arm_deadline(&a.id, timer.abort_handle()));
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
