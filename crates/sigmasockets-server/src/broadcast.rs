//! Broadcast Router (C8): fan-out to one, many, or all attached sessions.
//!
//! Each connection gets its own bounded `mpsc` queue, rather than a shared
//! `tokio::sync::broadcast` channel, so that ordering and the close-on-full
//! behaviour (once a queue hits capacity the peer is closed within one
//! scheduling tick) are per-session rather than shared-channel-wide.

use crate::events::{ConnectionEvent, EventHub};
use crate::session::SessionRegistry;
use std::sync::Arc;

/// Outcome of attempting to deliver to one session.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The outbound queue was full; the session has been marked for close
    /// with [`sigmasockets_protocol::close_code::SLOW_CONSUMER`].
    SlowConsumer,
    /// No connection is currently attached to this session (it may still be
    /// resumable later).
    NotAttached,
}

/// Fans frames out to sessions via their per-connection bounded queues.
pub struct BroadcastRouter {
    registry: Arc<SessionRegistry>,
    events: EventHub,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<SessionRegistry>, events: EventHub) -> Self {
        BroadcastRouter { registry, events }
    }

    /// Send to exactly one session by id.
    pub async fn send(&self, session_id: &str, payload: &[u8]) -> DeliveryOutcome {
        let Ok(session) = self.registry.get(session_id).await else {
            return DeliveryOutcome::NotAttached;
        };
        self.deliver_to(session_id, &session, payload).await
    }

    /// Send to an explicit set of sessions.
    pub async fn multicast(&self, session_ids: &[String], payload: &[u8]) -> Vec<(String, DeliveryOutcome)> {
        let mut results = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            results.push((id.clone(), self.send(id, payload).await));
        }
        results
    }

    /// Send to every currently-registered session, optionally skipping one
    /// (typically the sender, so it doesn't receive its own message back).
    /// Takes one short read-lock snapshot of the registry, then delivers
    /// outside that lock.
    pub async fn broadcast(&self, payload: &[u8], exclude: Option<&str>) -> Vec<(String, DeliveryOutcome)> {
        let snapshot = self.registry.snapshot().await;
        let mut results = Vec::with_capacity(snapshot.len());
        for (id, session) in snapshot {
            if exclude == Some(id.as_str()) {
                continue;
            }
            let outcome = self.deliver_to(&id, &session, payload).await;
            results.push((id, outcome));
        }
        results
    }

    async fn deliver_to(
        &self,
        session_id: &str,
        session: &tokio::sync::Mutex<crate::session::Session>,
        payload: &[u8],
    ) -> DeliveryOutcome {
        let mut guard = session.lock().await;
        if !guard.is_attached() {
            return DeliveryOutcome::NotAttached;
        }
        let message_id = guard.record_outbound(payload.to_vec());
        match guard.try_send(payload.to_vec()) {
            Ok(()) => {
                self.events.publish(ConnectionEvent::Message {
                    session_id: session_id.to_owned(),
                    message_id,
                    bytes: payload.len(),
                });
                DeliveryOutcome::Delivered
            }
            Err(_) => {
                guard.force_close();
                drop(guard);
                self.registry.detach(session_id).await;
                self.events.publish(ConnectionEvent::Disconnected {
                    session_id: session_id.to_owned(),
                    code: sigmasockets_protocol::close_code::SLOW_CONSUMER,
                });
                DeliveryOutcome::SlowConsumer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keepalive::KeepAlive;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn keepalive() -> KeepAlive {
        KeepAlive::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(10),
            true,
            0.7,
        )
    }

    #[tokio::test]
    async fn send_to_an_attached_session_delivers_and_records_replay() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let (id, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx, mut rx) = mpsc::channel(8);
        registry.attach(&id, tx).await.unwrap();
        let router = BroadcastRouter::new(registry.clone(), EventHub::new(16));

        let outcome = router.send(&id, b"hello").await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn send_to_a_detached_session_reports_not_attached() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let (id, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let router = BroadcastRouter::new(registry.clone(), EventHub::new(16));
        assert_eq!(router.send(&id, b"x").await, DeliveryOutcome::NotAttached);
    }

    #[tokio::test]
    async fn a_full_queue_reports_slow_consumer_and_detaches() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let (id, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx, _rx) = mpsc::channel(1);
        registry.attach(&id, tx).await.unwrap();
        let router = BroadcastRouter::new(registry.clone(), EventHub::new(16));

        // Fill the queue of capacity 1.
        assert_eq!(router.send(&id, b"a").await, DeliveryOutcome::Delivered);
        assert_eq!(router.send(&id, b"b").await, DeliveryOutcome::SlowConsumer);

        let session = registry.get(&id).await.unwrap();
        assert!(!session.lock().await.is_attached());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_attached_session() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let (id1, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (id2, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.attach(&id1, tx1).await.unwrap();
        registry.attach(&id2, tx2).await.unwrap();
        let router = BroadcastRouter::new(registry.clone(), EventHub::new(16));

        let results = router.broadcast(b"all", None).await;
        assert_eq!(results.len(), 2);
        assert_eq!(rx1.recv().await.unwrap(), b"all".to_vec());
        assert_eq!(rx2.recv().await.unwrap(), b"all".to_vec());
    }

    #[tokio::test]
    async fn broadcast_skips_the_excluded_session() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(300)));
        let (id1, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (id2, _) = registry.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.attach(&id1, tx1).await.unwrap();
        registry.attach(&id2, tx2).await.unwrap();
        let router = BroadcastRouter::new(registry.clone(), EventHub::new(16));

        let results = router.broadcast(b"all-but-one", Some(&id1)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id2);
        assert_eq!(rx2.recv().await.unwrap(), b"all-but-one".to_vec());
        assert!(rx1.try_recv().is_err());
    }
}
