//! Session Registry (C3): durable session state independent of any single
//! TCP connection, plus the replay-buffer ring used to resume a session
//! across a reconnect.
//!
//! The registry is an `Arc<RwLock<HashMap<...>>>` keyed by session id, but
//! refined to a per-session `Mutex` so that fan-out only takes a short
//! read-lock on the map itself — no global lock sits on the hot path.

use crate::error::SessionError;
use crate::keepalive::KeepAlive;
use crate::quality::QualityMeter;
use base64::Engine as _;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

/// A fresh 128-bit cryptographically random session id, base64url-encoded
/// without padding (22 characters).
fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// A single buffered outbound frame, kept so a reconnecting client can
/// replay everything sent after its last acknowledged message id.
struct ReplayEntry {
    message_id: u64,
    bytes: Vec<u8>,
}

/// Everything about a session that must survive the underlying WebSocket
/// connection being dropped and re-established.
pub struct Session {
    pub session_id: String,
    pub client_version: String,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub last_ack_message_id: u64,
    pub next_message_id: u64,
    pub keepalive: KeepAlive,
    pub quality: QualityMeter,
    /// Present only while a live connection is attached; `None` means the
    /// session is detached and waiting to be resumed or reaped.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    replay: VecDeque<ReplayEntry>,
    replay_capacity: usize,
    /// Signaled to make the attached connection's supervisor loop close the
    /// socket immediately — used for slow-consumer eviction, since a full
    /// outbound queue alone doesn't unblock a `select!` that's waiting on
    /// the socket or a future send.
    close_notify: Arc<Notify>,
}

impl Session {
    fn new(
        session_id: String,
        client_version: String,
        now: Instant,
        keepalive: KeepAlive,
        quality_window: usize,
        replay_capacity: usize,
    ) -> Self {
        Session {
            session_id,
            client_version,
            created_at: now,
            last_seen: now,
            last_ack_message_id: 0,
            next_message_id: 1,
            keepalive,
            quality: QualityMeter::new(quality_window),
            outbound: None,
            replay: VecDeque::new(),
            replay_capacity,
            close_notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.is_some()
    }

    /// A clone of the notifier the attached connection's supervisor loop
    /// waits on for a forced close.
    pub fn close_notify(&self) -> Arc<Notify> {
        self.close_notify.clone()
    }

    /// Wake the attached connection's supervisor loop so it closes the
    /// socket on its next scheduling tick, without waiting for the outbound
    /// queue to drain.
    pub fn force_close(&self) {
        self.close_notify.notify_one();
    }

    /// Non-blocking send to this session's current connection, if any. The
    /// caller (broadcast router) is responsible for closing the peer on
    /// `Err` (backpressure).
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<(), mpsc::error::TrySendError<Vec<u8>>> {
        match &self.outbound {
            Some(tx) => tx.try_send(bytes),
            None => Err(mpsc::error::TrySendError::Closed(bytes)),
        }
    }

    /// Record a frame in the replay ring, tagging it with a fresh message
    /// id. Returns the id assigned.
    pub fn record_outbound(&mut self, bytes: Vec<u8>) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.replay.push_back(ReplayEntry {
            message_id: id,
            bytes,
        });
        while self.replay.len() > self.replay_capacity {
            self.replay.pop_front();
        }
        id
    }

    /// Frames sent after `last_message_id`, oldest first. If the ring no
    /// longer holds the requested cursor (evicted) this silently returns
    /// only what remains; the caller may choose to treat a non-contiguous
    /// resume as an error, but the registry itself makes no such judgment.
    pub fn replay_since(&self, last_message_id: u64) -> Vec<Vec<u8>> {
        self.replay
            .iter()
            .filter(|e| e.message_id > last_message_id)
            .map(|e| e.bytes.clone())
            .collect()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }
}

/// Registry of all live and detached sessions. One process-wide instance.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    session_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(session_timeout: Duration) -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            session_timeout,
        }
    }

    /// Create a brand-new session with a fresh 128-bit random id.
    pub async fn create(
        &self,
        client_version: String,
        keepalive: KeepAlive,
        quality_window: usize,
        replay_capacity: usize,
    ) -> (String, Arc<Mutex<Session>>) {
        let session_id = generate_session_id();
        let now = Instant::now();
        let session = Arc::new(Mutex::new(Session::new(
            session_id.clone(),
            client_version,
            now,
            keepalive,
            quality_window,
            replay_capacity,
        )));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        (session_id, session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    /// Attach a live connection's outbound sender to an existing session,
    /// replacing any previous connection (the old one is responsible for
    /// noticing its sender was dropped and closing with `SessionReplaced`).
    pub async fn attach(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<Arc<Mutex<Session>>, SessionError> {
        let session = self.get(session_id).await?;
        let mut guard = session.lock().await;
        guard.outbound = Some(outbound);
        guard.touch(Instant::now());
        drop(guard);
        Ok(session)
    }

    pub async fn detach(&self, session_id: &str) {
        if let Ok(session) = self.get(session_id).await {
            let mut guard = session.lock().await;
            guard.outbound = None;
            guard.touch(Instant::now());
        }
    }

    /// A short read-lock snapshot of every session id currently registered,
    /// for the broadcast router to fan out against.
    pub async fn snapshot(&self) -> Vec<(String, Arc<Mutex<Session>>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove sessions that are detached and have been idle longer than
    /// `sessionTimeout`.
    pub async fn gc(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        let mut sessions = self.sessions.write().await;
        let timeout = self.session_timeout;
        let mut to_remove = Vec::new();
        for (id, session) in sessions.iter() {
            let guard = session.lock().await;
            if !guard.is_attached() && now.duration_since(guard.last_seen) > timeout {
                to_remove.push(id.clone());
            }
        }
        for id in to_remove {
            sessions.remove(&id);
            expired.push(id);
        }
        expired
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

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
    async fn create_then_get_round_trips() {
        let reg = SessionRegistry::new(Duration::from_secs(300));
        let (id, _) = reg.create("1.0".into(), keepalive(), 10, 256).await;
        assert!(reg.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn attach_then_detach_tracks_attachment() {
        let reg = SessionRegistry::new(Duration::from_secs(300));
        let (id, session) = reg.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx, _rx) = mpsc::channel(8);
        reg.attach(&id, tx).await.unwrap();
        assert!(session.lock().await.is_attached());
        reg.detach(&id).await;
        assert!(!session.lock().await.is_attached());
    }

    #[tokio::test]
    async fn replay_returns_only_frames_after_cursor() {
        let reg = SessionRegistry::new(Duration::from_secs(300));
        let (_id, session) = reg.create("1.0".into(), keepalive(), 10, 256).await;
        let mut guard = session.lock().await;
        let id1 = guard.record_outbound(b"a".to_vec());
        let _id2 = guard.record_outbound(b"b".to_vec());
        let id3 = guard.record_outbound(b"c".to_vec());
        let replay = guard.replay_since(id1);
        assert_eq!(replay, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(guard.replay_since(id3), Vec::<Vec<u8>>::new());
    }

    #[tokio::test]
    async fn replay_ring_is_capped_at_capacity() {
        let reg = SessionRegistry::new(Duration::from_secs(300));
        let (_id, session) = reg.create("1.0".into(), keepalive(), 10, 2).await;
        let mut guard = session.lock().await;
        guard.record_outbound(b"1".to_vec());
        guard.record_outbound(b"2".to_vec());
        guard.record_outbound(b"3".to_vec());
        assert_eq!(guard.replay_since(0), vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[tokio::test]
    async fn gc_removes_only_detached_and_expired_sessions() {
        let reg = SessionRegistry::new(Duration::from_millis(1));
        let (id, _) = reg.create("1.0".into(), keepalive(), 10, 256).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = reg.gc(Instant::now()).await;
        assert_eq!(expired, vec![id.clone()]);
        assert!(reg.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn gc_spares_an_attached_session_even_if_stale() {
        let reg = SessionRegistry::new(Duration::from_millis(1));
        let (id, _) = reg.create("1.0".into(), keepalive(), 10, 256).await;
        let (tx, _rx) = mpsc::channel(8);
        reg.attach(&id, tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = reg.gc(Instant::now()).await;
        assert!(expired.is_empty());
    }
}
