use tracing::debug;

use crate::protocol::RelayRequest;
use crate::registry::{ConnectionRegistry, SendOutcome};

/// Result of routing one directed frame. Only `Delivered` reaches anyone; the
/// sender is never told about the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    SenderNotAuthenticated,
    UnknownTarget,
    TargetNotAuthenticated,
    /// Target queue full; the frame was dropped.
    TargetBackedUp,
    /// Target is closing and its writer is gone.
    TargetGone,
}

impl RelayOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayOutcome::Delivered => "delivered",
            RelayOutcome::SenderNotAuthenticated => "sender_not_authenticated",
            RelayOutcome::UnknownTarget => "unknown_target",
            RelayOutcome::TargetNotAuthenticated => "target_not_authenticated",
            RelayOutcome::TargetBackedUp => "target_backed_up",
            RelayOutcome::TargetGone => "target_gone",
        }
    }
}

/// Forward `request` from `source` to its target, stamping `sourceClientId`.
pub fn relay(registry: &ConnectionRegistry, source: &str, request: RelayRequest) -> RelayOutcome {
    if !registry.is_authenticated(source) {
        return RelayOutcome::SenderNotAuthenticated;
    }
    if !registry.contains(&request.target) {
        debug!(
            source = %source,
            target = %request.target,
            kind = %request.kind,
            "dropping relay to unknown target"
        );
        return RelayOutcome::UnknownTarget;
    }
    if !registry.is_authenticated(&request.target) {
        return RelayOutcome::TargetNotAuthenticated;
    }

    let target = request.target.clone();
    match registry.send(&target, request.into_forwarded(source)) {
        SendOutcome::Queued => RelayOutcome::Delivered,
        SendOutcome::Full => RelayOutcome::TargetBackedUp,
        SendOutcome::Gone => RelayOutcome::TargetGone,
    }
}
