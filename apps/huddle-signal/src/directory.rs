//! Join and leave sequences for the peer directory.
//!
//! The directory is not stored anywhere: it is the set of authenticated entries
//! in the [`ConnectionRegistry`]. Every function here expects to run while the
//! caller holds exclusive access to the registry, which is what keeps a
//! snapshot and the broadcasts that follow it consistent with each other.

use tracing::{debug, warn};

use crate::identity::Identity;
use crate::protocol::{ConnectionId, ConnectionSuccess, PeerInfo, PeerLeft, ServerMessage};
use crate::registry::{CloseReason, ConnectionRegistry, RegistryError, Removed, SendOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct JoinReport {
    pub peer: PeerInfo,
    /// Peers listed in the newcomer's `connection-success`.
    pub existing_peers: usize,
    /// Connections evicted because their queue was full.
    pub evicted: Vec<Removed>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaveReport {
    pub notified: usize,
    pub evicted: Vec<Removed>,
}

/// Authenticate `id` and announce it.
///
/// Sends the newcomer its id plus the peers that were already authenticated,
/// then sends each of those peers a `new-peer` for the newcomer.
pub fn join(
    registry: &mut ConnectionRegistry,
    id: &str,
    identity: Identity,
) -> Result<JoinReport, RegistryError> {
    registry.attach_identity(id, identity.clone())?;

    let existing = registry.peers_except(Some(id));
    let peer = PeerInfo {
        client_id: id.to_string(),
        identity,
    };

    let mut slow = Vec::new();
    let welcome = ServerMessage::ConnectionSuccess(ConnectionSuccess {
        client_id: id.to_string(),
        existing_peers: existing.clone(),
    });
    if registry.send(id, welcome) == SendOutcome::Full {
        slow.push(id.to_string());
    }

    for other in &existing {
        if registry.send(&other.client_id, ServerMessage::NewPeer(peer.clone()))
            == SendOutcome::Full
        {
            slow.push(other.client_id.clone());
        }
    }

    debug!(
        connection_id = %id,
        member_id = %peer.identity.member_id,
        existing_peers = existing.len(),
        "peer joined directory"
    );

    Ok(JoinReport {
        peer,
        existing_peers: existing.len(),
        evicted: evict(registry, slow),
    })
}

/// Announce the departure of an entry that was already removed.
///
/// Connections that never authenticated leave silently.
pub fn leave(registry: &mut ConnectionRegistry, departed: &Removed) -> LeaveReport {
    if !departed.was_authenticated() {
        return LeaveReport::default();
    }
    let (notified, slow) = announce_departure(registry, &departed.id);
    LeaveReport {
        notified,
        evicted: evict(registry, slow),
    }
}

/// Close slow consumers, announcing each departure in turn. A peer whose queue
/// fills while receiving one of those announcements is evicted as well.
pub fn evict(registry: &mut ConnectionRegistry, mut queue: Vec<ConnectionId>) -> Vec<Removed> {
    let mut evicted = Vec::new();
    while let Some(id) = queue.pop() {
        let Some(removed) = registry.close(&id, CloseReason::SLOW_CONSUMER) else {
            continue;
        };
        warn!(connection_id = %id, "evicting slow consumer");
        if removed.was_authenticated() {
            let (_, slow) = announce_departure(registry, &removed.id);
            queue.extend(slow);
        }
        evicted.push(removed);
    }
    evicted
}

fn announce_departure(registry: &ConnectionRegistry, departed: &str) -> (usize, Vec<ConnectionId>) {
    let mut notified = 0;
    let mut slow = Vec::new();
    for peer in registry.peers() {
        let message = ServerMessage::PeerLeft(PeerLeft {
            client_id: departed.to_string(),
        });
        match registry.send(&peer.client_id, message) {
            SendOutcome::Queued => notified += 1,
            SendOutcome::Full => slow.push(peer.client_id),
            SendOutcome::Gone => {}
        }
    }
    (notified, slow)
}
