use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::directory::{self, JoinReport};
use crate::identity::Identity;
use crate::protocol::{ConnectionId, RelayRequest, ServerMessage};
use crate::registry::{
    CloseReason, ConnectionRegistry, ConnectionView, Registration, RegistryError, Removed,
    SendOutcome,
};
use crate::relay::{self, RelayOutcome};

/// Shared handle on the connection registry.
///
/// Every registry mutation, directory snapshot and broadcast goes through the one
/// mutex in here. Nothing awaits while holding it: all sends are `try_send`.
#[derive(Clone)]
pub struct SignalingHub {
    registry: Arc<Mutex<ConnectionRegistry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub peers: usize,
    pub pending: usize,
    pub peer_list: Vec<PeerStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    pub client_id: ConnectionId,
    #[serde(flatten)]
    pub identity: Identity,
    pub authenticated_at: Option<DateTime<Utc>>,
}

impl SignalingHub {
    pub fn new(outbound_buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ConnectionRegistry::new(outbound_buffer))),
        }
    }

    /// Run `f` inside the exclusive section.
    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut ConnectionRegistry) -> R) -> R {
        let mut registry = self.registry.lock();
        let result = f(&mut registry);
        record_gauges(&registry);
        result
    }

    /// Register a Connecting entry without an auth deadline.
    pub fn open(&self) -> Registration {
        counter!("huddle_connections_opened_total", 1);
        self.with_registry(|registry| registry.register())
    }

    pub fn get(&self, id: &str) -> Option<ConnectionView> {
        self.registry.lock().get(id)
    }

    pub fn is_authenticated(&self, id: &str) -> bool {
        self.registry.lock().is_authenticated(id)
    }

    pub fn join(&self, id: &str, identity: Identity) -> Result<JoinReport, RegistryError> {
        let report = self.with_registry(|registry| directory::join(registry, id, identity))?;
        record_evictions(&report.evicted);
        info!(
            connection_id = %id,
            member_id = %report.peer.identity.member_id,
            existing_peers = report.existing_peers,
            "peer authenticated"
        );
        Ok(report)
    }

    /// Close a connection that is still Connecting. No-op once it authenticated
    /// or left.
    pub fn expire(&self, id: &str) -> bool {
        let expired = self.with_registry(|registry| {
            if registry.contains(id) && !registry.is_authenticated(id) {
                registry.close(id, CloseReason::AUTH_TIMEOUT).is_some()
            } else {
                false
            }
        });
        if expired {
            counter!("huddle_connections_closed_total", 1, "reason" => CloseReason::AUTH_TIMEOUT.label);
            info!(connection_id = %id, "auth deadline elapsed; closing connection");
        }
        expired
    }

    /// Force-close a connection, announcing its departure if it was a peer.
    pub fn close(&self, id: &str, reason: CloseReason) -> Option<Removed> {
        let (removed, evicted) = self.with_registry(|registry| {
            let Some(removed) = registry.close(id, reason) else {
                return (None, Vec::new());
            };
            let report = directory::leave(registry, &removed);
            (Some(removed), report.evicted)
        });
        record_evictions(&evicted);
        if removed.is_some() {
            counter!("huddle_connections_closed_total", 1, "reason" => reason.label);
            debug!(connection_id = %id, reason = reason.reason, "connection closed by server");
        }
        removed
    }

    /// The transport went away. Idempotent.
    pub fn disconnect(&self, id: &str) -> Option<Removed> {
        let (removed, notified, evicted) = self.with_registry(|registry| {
            let Some(removed) = registry.remove(id) else {
                return (None, 0, Vec::new());
            };
            let report = directory::leave(registry, &removed);
            (Some(removed), report.notified, report.evicted)
        });
        record_evictions(&evicted);
        if let Some(removed) = &removed {
            counter!("huddle_connections_closed_total", 1, "reason" => "transport_closed");
            debug!(
                connection_id = %id,
                was_peer = removed.was_authenticated(),
                notified,
                "connection removed"
            );
        }
        removed
    }

    pub fn relay(&self, source: &str, request: RelayRequest) -> RelayOutcome {
        let outcome = relay::relay(&self.registry.lock(), source, request);
        counter!("huddle_relay_frames_total", 1, "outcome" => outcome.metric_label());
        outcome
    }

    /// Queue a direct response (pong, error) to `id`. Dropped when the queue is full.
    pub fn reply(&self, id: &str, message: ServerMessage) -> SendOutcome {
        self.registry.lock().send(id, message)
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.lock();
        let peer_list: Vec<PeerStats> = registry
            .peer_views()
            .into_iter()
            .filter_map(|view| {
                let identity = view.identity?;
                Some(PeerStats {
                    client_id: view.id,
                    identity,
                    authenticated_at: view.authenticated_at,
                })
            })
            .collect();
        HubStats {
            connections: registry.len(),
            peers: peer_list.len(),
            pending: registry.len() - peer_list.len(),
            peer_list,
        }
    }
}

fn record_gauges(registry: &ConnectionRegistry) {
    gauge!("huddle_connections_active", registry.len() as f64);
    gauge!("huddle_peers_active", registry.authenticated_count() as f64);
}

fn record_evictions(evicted: &[Removed]) {
    for removed in evicted {
        counter!("huddle_connections_closed_total", 1, "reason" => CloseReason::SLOW_CONSUMER.label);
        info!(connection_id = %removed.id, "slow consumer evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerLeft;

    fn identity(member: &str) -> Identity {
        Identity {
            member_id: member.to_string(),
            display_name: member.to_string(),
            avatar_ref: Some(format!("avatars/{member}.png")),
        }
    }

    #[test_timeout::timeout]
    fn disconnect_announces_departure_once() {
        let hub = SignalingHub::new(8);
        let mut a = hub.open();
        let b = hub.open();
        hub.join(&a.id, identity("a")).unwrap();
        hub.join(&b.id, identity("b")).unwrap();
        while a.outbound.try_recv().is_ok() {}

        assert!(hub.disconnect(&b.id).is_some());
        assert!(hub.disconnect(&b.id).is_none());

        assert_eq!(
            a.outbound.try_recv().unwrap(),
            ServerMessage::PeerLeft(PeerLeft {
                client_id: b.id.clone()
            })
        );
        assert!(a.outbound.try_recv().is_err());
        assert!(hub.get(&b.id).is_none());
    }

    #[test_timeout::timeout]
    fn expire_only_affects_connecting_entries() {
        let hub = SignalingHub::new(8);
        let mut a = hub.open();
        let b = hub.open();
        hub.join(&b.id, identity("b")).unwrap();

        assert!(hub.expire(&a.id));
        assert_eq!(a.shutdown.try_recv().unwrap(), CloseReason::AUTH_TIMEOUT);
        assert!(!hub.expire(&a.id));
        assert!(!hub.expire(&b.id));
        assert!(hub.is_authenticated(&b.id));
    }

    #[test_timeout::timeout]
    fn server_close_of_a_peer_is_announced() {
        let hub = SignalingHub::new(8);
        let mut a = hub.open();
        let mut b = hub.open();
        hub.join(&a.id, identity("a")).unwrap();
        hub.join(&b.id, identity("b")).unwrap();
        while a.outbound.try_recv().is_ok() {}

        hub.close(&b.id, CloseReason::IDLE).unwrap();
        assert_eq!(b.shutdown.try_recv().unwrap(), CloseReason::IDLE);
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            ServerMessage::PeerLeft(PeerLeft { client_id }) if client_id == b.id
        ));
    }

    #[test_timeout::timeout]
    fn stats_list_peers_in_join_order() {
        let hub = SignalingHub::new(8);
        let a = hub.open();
        let b = hub.open();
        let _pending = hub.open();
        hub.join(&b.id, identity("b")).unwrap();
        hub.join(&a.id, identity("a")).unwrap();

        let stats = hub.stats();
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.peers, 2);
        assert_eq!(stats.pending, 1);
        let order: Vec<_> = stats.peer_list.iter().map(|p| p.client_id.clone()).collect();
        assert_eq!(order, vec![b.id.clone(), a.id.clone()]);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["peerList"][0]["memberId"], "b");
        assert_eq!(json["peerList"][0]["avatarRef"], "avatars/b.png");
    }

    #[test_timeout::timeout]
    fn reply_reaches_only_the_addressed_connection() {
        let hub = SignalingHub::new(8);
        let mut a = hub.open();
        let mut b = hub.open();
        assert_eq!(hub.reply(&a.id, ServerMessage::Pong), SendOutcome::Queued);
        assert_eq!(a.outbound.try_recv().unwrap(), ServerMessage::Pong);
        assert!(b.outbound.try_recv().is_err());
    }
}
