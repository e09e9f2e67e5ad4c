//! Hole punch session coordination
//!
//! # Protocol Flow
//!
//! ```text
//! Requester               Rendezvous                 Target
//!   │── REQUEST_PEER ──────►│                          │
//!   │                       │── PREPARE(requester) ───►│
//!   │                       │   (short delay)          │
//!   │◄── PREPARE(target) ───│                          │
//!   │── READY_HOLE_PUNCH ──►│◄── READY_HOLE_PUNCH ─────│
//!   │◄── START(target) ─────│──── START(requester) ───►│
//! ```
//!
//! # Session State
//!
//! One session per unordered name pair. Its ready set grows from empty to
//! both names; the moment it holds both, the session is removed and the
//! start signals go out. Each name takes part in at most one pending session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use punch_core::{send_with_policy, AckPolicy, SignalingMessage};

use crate::registry::{ClientRegistration, Registry};

// ============================================================================
// Session Key
// ============================================================================

/// Unordered pair of participant names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    low: String,
    high: String,
}

impl SessionKey {
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.low == name || self.high == name
    }

    /// The participant that is not `name`
    pub fn other(&self, name: &str) -> Option<&str> {
        if self.low == name {
            Some(&self.high)
        } else if self.high == name {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn names(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

// ============================================================================
// Session State
// ============================================================================

/// A pending hole punch between two registered peers
#[derive(Debug)]
pub struct HolePunchSession {
    pub key: SessionKey,
    /// Participants that reported READY_HOLE_PUNCH (at most 2)
    ready: HashSet<String>,
    pub created_at: Instant,
}

impl HolePunchSession {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            ready: HashSet::new(),
            created_at: Instant::now(),
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.created_at.elapsed() > timeout
    }
}

/// Result of opening a session for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Created,
    /// A session for this exact pair was already pending
    Reused,
    /// The named participant is pending with someone else
    Busy(String),
}

/// Result of a READY_HOLE_PUNCH
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// No pending session includes the name
    NoSession,
    /// Still waiting for the other participant
    Waiting(SessionKey),
    /// Both ready; the session has been removed
    Complete(SessionKey),
}

// ============================================================================
// Session Manager
// ============================================================================

/// Pending sessions, guarded by one lock per operation
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionKey, HolePunchSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, HolePunchSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self, requester: &str, target: &str) -> OpenOutcome {
        let key = SessionKey::new(requester, target);
        let mut sessions = self.sessions();

        if sessions.contains_key(&key) {
            return OpenOutcome::Reused;
        }

        for other in sessions.keys() {
            for name in [requester, target] {
                if other.contains(name) {
                    return OpenOutcome::Busy(name.to_string());
                }
            }
        }

        sessions.insert(key.clone(), HolePunchSession::new(key));
        OpenOutcome::Created
    }

    /// Add `name` to its session's ready set
    ///
    /// Membership insert, the size check and the removal share one critical
    /// section, so a session completes exactly once.
    pub fn mark_ready(&self, name: &str) -> ReadyOutcome {
        let mut sessions = self.sessions();

        let key = match sessions.keys().find(|k| k.contains(name)) {
            Some(key) => key.clone(),
            None => return ReadyOutcome::NoSession,
        };

        let complete = match sessions.get_mut(&key) {
            Some(session) => {
                session.ready.insert(name.to_string());
                session.ready.len() == 2
            }
            None => return ReadyOutcome::NoSession,
        };

        if complete {
            sessions.remove(&key);
            ReadyOutcome::Complete(key)
        } else {
            ReadyOutcome::Waiting(key)
        }
    }

    pub fn remove(&self, key: &SessionKey) -> Option<HolePunchSession> {
        self.sessions().remove(key)
    }

    /// Drop the pending session `name` takes part in, if any
    pub fn remove_participant(&self, name: &str) -> Option<SessionKey> {
        let mut sessions = self.sessions();
        let key = sessions.keys().find(|k| k.contains(name)).cloned()?;
        sessions.remove(&key);
        Some(key)
    }

    /// Remove and return sessions older than `timeout`
    pub fn expire(&self, timeout: Duration) -> Vec<SessionKey> {
        let mut sessions = self.sessions();
        let expired: Vec<SessionKey> = sessions
            .values()
            .filter(|s| s.is_expired(timeout))
            .map(|s| s.key.clone())
            .collect();

        for key in &expired {
            sessions.remove(key);
        }

        expired
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions().contains_key(key)
    }

    pub fn ready_count(&self, key: &SessionKey) -> Option<usize> {
        self.sessions().get(key).map(|s| s.ready_count())
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives the prepare/ready/start exchange for registered peers
#[derive(Debug)]
pub struct Coordinator {
    registry: Arc<Registry>,
    sessions: SessionManager,
    prepare_delay: Duration,
    ack: AckPolicy,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, prepare_delay: Duration, ack: AckPolicy) -> Self {
        Self {
            registry,
            sessions: SessionManager::new(),
            prepare_delay,
            ack,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn send(&self, to: &ClientRegistration, msg: &SignalingMessage) -> bool {
        log::debug!("-> {} ({}): {}", to.name, to.addr, msg);
        send_with_policy(&to.connection, msg, &self.ack)
    }

    /// Handle `REQUEST_PEER:<target>` from `requester`
    pub fn request_peer(&self, requester: &ClientRegistration, target: &str) {
        let target_reg = match self.registry.lookup(target) {
            Some(reg) if reg.name != requester.name => reg,
            _ => {
                log::info!("'{}' requested unknown peer '{}'", requester.name, target);
                self.send(requester, &SignalingMessage::PeerNotFound);
                return;
            }
        };

        let key = SessionKey::new(&requester.name, target);
        match self.sessions.open(&requester.name, target) {
            OpenOutcome::Created => log::info!("Hole punch session {} opened", key),
            OpenOutcome::Reused => log::info!("Hole punch session {} re-requested", key),
            OpenOutcome::Busy(name) => {
                log::info!("Cannot open {}: '{}' is busy", key, name);
                self.send(requester, &SignalingMessage::PeerBusy(name));
                return;
            }
        }

        // Target first; the requester is told once the target has its prepare
        if !self.send(&target_reg, &SignalingMessage::PrepareHolePunch(requester.addr)) {
            self.abandon(&key, &[requester], target);
            return;
        }

        thread::sleep(self.prepare_delay);

        if !self.send(requester, &SignalingMessage::PrepareHolePunch(target_reg.addr)) {
            self.abandon(&key, &[&target_reg], &requester.name);
        }
    }

    /// Handle `READY_HOLE_PUNCH` from `name`
    pub fn mark_ready(&self, name: &str) {
        let key = match self.sessions.mark_ready(name) {
            ReadyOutcome::NoSession => {
                log::warn!("READY_HOLE_PUNCH from '{}' without a pending session", name);
                return;
            }
            ReadyOutcome::Waiting(key) => {
                log::info!("'{}' ready in {}, waiting for peer", name, key);
                return;
            }
            ReadyOutcome::Complete(key) => key,
        };

        let (a, b) = key.names();
        let (a_reg, b_reg) = match (self.registry.lookup(a), self.registry.lookup(b)) {
            (Some(a_reg), Some(b_reg)) => (a_reg, b_reg),
            (Some(left), None) => {
                self.notify_aborted(&left, b);
                return;
            }
            (None, Some(left)) => {
                self.notify_aborted(&left, a);
                return;
            }
            (None, None) => return,
        };

        log::info!("Both peers ready in {}, starting hole punch", key);
        self.send(&a_reg, &SignalingMessage::StartHolePunch(b_reg.addr));
        self.send(&b_reg, &SignalingMessage::StartHolePunch(a_reg.addr));
    }

    /// A participant went away; release its session and tell the other side
    pub fn participant_left(&self, name: &str) {
        if let Some(key) = self.sessions.remove_participant(name) {
            log::info!("Session {} dropped: '{}' disconnected", key, name);
            if let Some(other) = key.other(name).and_then(|o| self.registry.lookup(o)) {
                self.notify_aborted(&other, name);
            }
        }
    }

    /// Remove sessions pending longer than `timeout` and notify both sides
    pub fn expire_stale(&self, timeout: Duration) -> usize {
        let expired = self.sessions.expire(timeout);
        for key in &expired {
            log::warn!("Session {} expired after {:?}", key, timeout);
            let (a, b) = key.names();
            if let Some(reg) = self.registry.lookup(a) {
                self.notify_aborted(&reg, b);
            }
            if let Some(reg) = self.registry.lookup(b) {
                self.notify_aborted(&reg, a);
            }
        }
        expired.len()
    }

    fn abandon(&self, key: &SessionKey, notify: &[&ClientRegistration], unreachable: &str) {
        log::warn!("Session {} abandoned: '{}' unreachable", key, unreachable);
        self.sessions.remove(key);
        for reg in notify {
            self.notify_aborted(reg, unreachable);
        }
    }

    fn notify_aborted(&self, to: &ClientRegistration, other: &str) {
        self.send(to, &SignalingMessage::HolePunchAborted(other.to_string()));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_is_unordered() {
        assert_eq!(SessionKey::new("A", "B"), SessionKey::new("B", "A"));
        let key = SessionKey::new("B", "A");
        assert_eq!(key.names(), ("A", "B"));
        assert_eq!(key.other("A"), Some("B"));
        assert_eq!(key.other("C"), None);
    }

    #[test]
    fn test_one_session_per_pair() {
        let manager = SessionManager::new();

        assert_eq!(manager.open("A", "B"), OpenOutcome::Created);
        assert_eq!(manager.open("B", "A"), OpenOutcome::Reused);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_busy_participant() {
        let manager = SessionManager::new();

        manager.open("A", "B");
        assert_eq!(manager.open("C", "B"), OpenOutcome::Busy("B".into()));
        assert_eq!(manager.open("A", "D"), OpenOutcome::Busy("A".into()));
        assert_eq!(manager.open("C", "D"), OpenOutcome::Created);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_ready_state_machine() {
        let manager = SessionManager::new();
        let key = SessionKey::new("A", "B");
        manager.open("A", "B");

        assert_eq!(manager.ready_count(&key), Some(0));
        assert_eq!(manager.mark_ready("A"), ReadyOutcome::Waiting(key.clone()));
        assert_eq!(manager.ready_count(&key), Some(1));
        assert_eq!(manager.mark_ready("B"), ReadyOutcome::Complete(key.clone()));
        assert!(!manager.contains(&key));
    }

    #[test]
    fn test_mark_ready_idempotent() {
        let manager = SessionManager::new();
        let key = SessionKey::new("A", "B");
        manager.open("A", "B");

        manager.mark_ready("A");
        assert_eq!(manager.mark_ready("A"), ReadyOutcome::Waiting(key.clone()));
        assert_eq!(manager.ready_count(&key), Some(1));

        assert_eq!(manager.mark_ready("B"), ReadyOutcome::Complete(key));
        // A late duplicate cannot start the pair again
        assert_eq!(manager.mark_ready("B"), ReadyOutcome::NoSession);
    }

    #[test]
    fn test_concurrent_ready_completes_once() {
        let manager = Arc::new(SessionManager::new());
        manager.open("A", "B");

        let handles: Vec<_> = ["A", "B", "A", "B"]
            .into_iter()
            .map(|name| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.mark_ready(name))
            })
            .collect();

        let completions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, ReadyOutcome::Complete(_)))
            .count();
        assert_eq!(completions, 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_remove_participant() {
        let manager = SessionManager::new();
        manager.open("A", "B");

        assert_eq!(manager.remove_participant("B"), Some(SessionKey::new("A", "B")));
        assert_eq!(manager.remove_participant("B"), None);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_expire_stale_sessions() {
        let manager = SessionManager::new();
        manager.open("A", "B");

        assert!(manager.expire(Duration::from_secs(60)).is_empty());

        thread::sleep(Duration::from_millis(20));
        let expired = manager.expire(Duration::from_millis(10));
        assert_eq!(expired, vec![SessionKey::new("A", "B")]);
        assert!(manager.is_empty());
    }
}
