//! Per-connection session state and the shared session registry.
//!
//! One session exists per TCP connection, created on accept and dropped on
//! disconnect or expiry. The phase machine tracks how far the handshake has
//! progressed; dispatch is deliberately lenient about ordering, so an illegal
//! transition is logged and ignored rather than killing the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Idle sessions older than this are swept.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the sweeper looks for expired sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    Authenticated,
    RevisionNegotiated,
    ScriptSessionEstablished,
    ScriptSelected,
    OptionsDelivered,
    Closed,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connected, Authenticated) => true,
            (Authenticated, RevisionNegotiated) => true,
            (RevisionNegotiated, ScriptSessionEstablished) => true,
            (ScriptSessionEstablished, ScriptSelected) => true,
            // Reselecting a script, with or without options in between.
            (ScriptSelected, ScriptSelected) => true,
            (ScriptSelected, OptionsDelivered) => true,
            (OptionsDelivered, ScriptSelected) => true,
            _ => false,
        }
    }
}

/// State carried across packets on one connection.
#[derive(Debug)]
pub struct Session {
    pub phase: SessionPhase,
    pub user_id: i32,
    pub account_session: Option<String>,
    pub script_session: Option<String>,
    pub current_script: Option<i32>,
    /// Set once the client has requested a script start.
    pub ready: bool,
    outbound_counter: i32,
    last_activity: Instant,
    close: Arc<Notify>,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Connected,
            user_id: 0,
            account_session: None,
            script_session: None,
            current_script: None,
            ready: false,
            outbound_counter: 0,
            last_activity: Instant::now(),
            close: Arc::new(Notify::new()),
        }
    }

    /// Marks activity, pushing expiry out.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// Moves to `next` if the phase machine allows it; otherwise logs and
    /// stays put.
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            true
        } else {
            debug!(from = ?self.phase, to = ?next, "ignoring out-of-order phase transition");
            false
        }
    }

    /// Next outbound sequence counter. Only the current wire generation puts
    /// it on the wire.
    pub fn next_counter(&mut self) -> i32 {
        let counter = self.outbound_counter;
        self.outbound_counter = self.outbound_counter.wrapping_add(1);
        counter
    }

    fn close_handle(&self) -> Arc<Notify> {
        self.close.clone()
    }
}

/// All live sessions, shared between the TCP ingress and the sweeper.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Creates a session for a fresh connection. The returned handle is
    /// notified when the sweeper expires the session, so the connection task
    /// can hang up.
    pub fn register(&self) -> (ConnectionId, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new();
        let close = session.close_handle();
        self.sessions.insert(id, session);
        (id, close)
    }

    pub fn remove(&self, id: ConnectionId) {
        if self.sessions.remove(&id).is_some() {
            debug!(connection = id, "session removed");
        }
    }

    /// Runs `f` with mutable access to the session, touching it first.
    /// Returns `None` once the session has been swept.
    pub fn with<R>(&self, id: ConnectionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut entry = self.sessions.get_mut(&id)?;
        entry.touch();
        Some(f(&mut entry))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every expired session and notifies its connection task.
    /// Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let mut swept = 0;
        self.sessions.retain(|id, session| {
            if session.is_expired(self.timeout) {
                info!(connection = id, "session expired");
                // notify_one stores a permit, so the hang-up is not lost if
                // the connection task is mid-dispatch rather than parked on
                // the close handle when the sweep fires.
                session.close.notify_one();
                swept += 1;
                false
            } else {
                true
            }
        });
        swept
    }

    /// Spawns the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_phases_advance_in_order() {
        use SessionPhase::*;
        let registry = SessionRegistry::new(DEFAULT_SESSION_TIMEOUT);
        let (id, _close) = registry.register();

        for phase in [
            Authenticated,
            RevisionNegotiated,
            ScriptSessionEstablished,
            ScriptSelected,
            OptionsDelivered,
        ] {
            assert!(registry.with(id, |s| s.advance(phase)).unwrap());
        }
        // Back to script selection is allowed; skipping ahead is not.
        assert!(registry.with(id, |s| s.advance(ScriptSelected)).unwrap());
        assert!(!registry.with(id, |s| s.advance(Authenticated)).unwrap());
    }

    #[test]
    fn closed_is_terminal() {
        use SessionPhase::*;
        assert!(Connected.can_transition_to(Closed));
        assert!(OptionsDelivered.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Authenticated));
    }

    #[test]
    fn out_of_order_transition_does_not_change_phase() {
        let registry = SessionRegistry::new(DEFAULT_SESSION_TIMEOUT);
        let (id, _close) = registry.register();
        assert!(!registry
            .with(id, |s| s.advance(SessionPhase::ScriptSelected))
            .unwrap());
        assert_eq!(
            registry.with(id, |s| s.phase).unwrap(),
            SessionPhase::Connected
        );
    }

    #[test]
    fn counters_are_sequential_per_session() {
        let registry = SessionRegistry::new(DEFAULT_SESSION_TIMEOUT);
        let (a, _) = registry.register();
        let (b, _) = registry.register();

        assert_eq!(registry.with(a, |s| s.next_counter()).unwrap(), 0);
        assert_eq!(registry.with(a, |s| s.next_counter()).unwrap(), 1);
        assert_eq!(registry.with(b, |s| s.next_counter()).unwrap(), 0);
    }

    #[tokio::test]
    async fn close_signal_survives_a_late_waiter() {
        let registry = SessionRegistry::new(Duration::from_secs(0));
        let (_id, close) = registry.register();

        // Sweep while nobody is parked on the handle, as happens when the
        // connection task is busy dispatching a packet.
        assert_eq!(registry.sweep_expired(), 1);

        // The stored permit must still deliver the hang-up.
        tokio::time::timeout(Duration::from_millis(100), close.notified())
            .await
            .expect("close signal was dropped");
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let registry = SessionRegistry::new(Duration::from_secs(0));
        let (id, _close) = registry.register();

        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.is_empty());
        assert!(registry.with(id, |_| ()).is_none());

        let fresh = SessionRegistry::new(DEFAULT_SESSION_TIMEOUT);
        fresh.register();
        assert_eq!(fresh.sweep_expired(), 0);
        assert_eq!(fresh.len(), 1);
    }
}
