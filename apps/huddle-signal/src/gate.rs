use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};

use crate::directory::JoinReport;
use crate::hub::SignalingHub;
use crate::identity::{IdentityVerifier, VerificationError};
use crate::registry::{CloseReason, Registration, RegistryError};

pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GateError {
    #[error("credential rejected: {0}")]
    Rejected(#[source] VerificationError),
    #[error("connection closed before authentication completed")]
    Closed,
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,
}

impl GateError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            GateError::Rejected(err) => err.metric_label(),
            GateError::Closed => "closed",
            GateError::AlreadyAuthenticated => "already_authenticated",
        }
    }
}

/// Admits connections and holds each one to its credential deadline.
pub struct AuthGate {
    verifier: Arc<dyn IdentityVerifier>,
    window: Duration,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, window: Duration) -> Self {
        Self { verifier, window }
    }

    /// Register a new connection and arm its auth deadline.
    ///
    /// The timer is spawned and stored under the same lock as the registration,
    /// so it cannot fire before the entry knows about it.
    pub fn admit(&self, hub: &SignalingHub) -> Registration {
        counter!("huddle_connections_opened_total", 1);
        let window = self.window;
        hub.with_registry(|registry| {
            let registration = registry.register();
            let timer_hub = hub.clone();
            let id = registration.id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                timer_hub.expire(&id);
            });
            registry.arm_deadline(&registration.id, timer.abort_handle());
            registration
        })
    }

    /// Verify `token` and, if it holds, move `id` into the peer directory.
    ///
    /// The verifier runs without the registry lock. If the deadline fired or the
    /// transport closed meanwhile, the join is a no-op and `Closed` is returned.
    pub async fn authenticate(
        &self,
        hub: &SignalingHub,
        id: &str,
        token: &str,
    ) -> Result<JoinReport, GateError> {
        let started = Instant::now();
        let identity = match self.verifier.verify(token).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "credential rejected");
                counter!("huddle_auth_failures_total", 1, "reason" => err.metric_label());
                hub.close(id, CloseReason::AUTH_REJECTED);
                return Err(GateError::Rejected(err));
            }
        };

        match hub.join(id, identity) {
            Ok(report) => {
                counter!("huddle_auth_success_total", 1);
                histogram!(
                    "huddle_auth_duration_ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(report)
            }
            Err(RegistryError::NotFound(_)) => {
                info!(connection_id = %id, "connection closed while credential was verified");
                counter!("huddle_auth_failures_total", 1, "reason" => "closed");
                Err(GateError::Closed)
            }
            Err(RegistryError::AlreadyAuthenticated(_)) => Err(GateError::AlreadyAuthenticated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, StaticVerifier};
    use crate::protocol::ServerMessage;
    use async_trait::async_trait;
    use tokio::sync::oneshot::error::TryRecvError;

    const WINDOW: Duration = Duration::from_secs(5);

    fn identity(member: &str) -> Identity {
        Identity {
            member_id: member.to_string(),
            display_name: member.to_string(),
            avatar_ref: None,
        }
    }

    fn verifier() -> Arc<dyn IdentityVerifier> {
        Arc::new(
            StaticVerifier::new()
                .with_token("tok-a", identity("a"))
                .with_token("tok-b", identity("b")),
        )
    }

    struct SlowVerifier {
        delay: Duration,
        inner: StaticVerifier,
    }

    #[async_trait]
    impl IdentityVerifier for SlowVerifier {
        async fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
            tokio::time::sleep(self.delay).await;
            self.inner.verify(token).await
        }
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn silent_connection_is_closed_at_the_deadline() {
        let hub = SignalingHub::new(8);
        let gate = AuthGate::new(verifier(), WINDOW);
        let mut a = gate.admit(&hub);

        tokio::time::sleep(WINDOW - Duration::from_millis(1)).await;
        assert!(hub.get(&a.id).is_some());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(hub.get(&a.id).is_none());
        assert_eq!(a.shutdown.try_recv().unwrap(), CloseReason::AUTH_TIMEOUT);
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn authentication_cancels_the_deadline() {
        let hub = SignalingHub::new(8);
        let gate = AuthGate::new(verifier(), WINDOW);
        let mut a = gate.admit(&hub);

        let report = gate.authenticate(&hub, &a.id, "tok-a").await.unwrap();
        assert_eq!(report.existing_peers, 0);

        tokio::time::sleep(WINDOW * 2).await;
        assert!(hub.is_authenticated(&a.id));
        assert!(matches!(a.shutdown.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(
            a.outbound.try_recv().unwrap(),
            ServerMessage::ConnectionSuccess(_)
        ));
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn rejected_credential_closes_without_broadcast() {
        let hub = SignalingHub::new(8);
        let gate = AuthGate::new(verifier(), WINDOW);
        let mut a = gate.admit(&hub);
        gate.authenticate(&hub, &a.id, "tok-a").await.unwrap();
        while a.outbound.try_recv().is_ok() {}

        let mut intruder = gate.admit(&hub);
        let err = gate
            .authenticate(&hub, &intruder.id, "forged")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Rejected(VerificationError::UnknownToken)));
        assert_eq!(
            intruder.shutdown.try_recv().unwrap(),
            CloseReason::AUTH_REJECTED
        );
        assert!(hub.get(&intruder.id).is_none());
        assert!(a.outbound.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(30, start_paused)]
    async fn deadline_wins_over_slow_verification() {
        let hub = SignalingHub::new(8);
        let slow = Arc::new(SlowVerifier {
            delay: WINDOW * 2,
            inner: StaticVerifier::new().with_token("tok-b", identity("b")),
        });
        let fast = AuthGate::new(verifier(), WINDOW);
        let gate = AuthGate::new(slow, WINDOW);

        let mut a = fast.admit(&hub);
        fast.authenticate(&hub, &a.id, "tok-a").await.unwrap();
        while a.outbound.try_recv().is_ok() {}

        let mut b = gate.admit(&hub);
        let err = gate.authenticate(&hub, &b.id, "tok-b").await.unwrap_err();
        assert!(matches!(err, GateError::Closed));
        assert_eq!(b.shutdown.try_recv().unwrap(), CloseReason::AUTH_TIMEOUT);
        assert!(hub.get(&b.id).is_none());
        assert!(a.outbound.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10, start_paused)]
    async fn transport_close_before_auth_disarms_the_deadline() {
        let hub = SignalingHub::new(8);
        let gate = AuthGate::new(verifier(), WINDOW);
        let mut a = gate.admit(&hub);

        let removed = hub.disconnect(&a.id).unwrap();
        assert!(!removed.was_authenticated());
        tokio::time::sleep(WINDOW * 2).await;
        assert!(matches!(a.shutdown.try_recv(), Err(TryRecvError::Closed)));
        assert!(!hub.expire(&a.id));
    }
}
