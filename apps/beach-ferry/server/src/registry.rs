use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use beach_ferry_core::{session_fingerprint, CloseReason, Role};
use clap::ValueEnum;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::connection::ConnectionHandle;

/// What `bind` does when the role slot already holds another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SlotPolicy {
    /// Close the incumbent with [`CloseReason::Superseded`] and seat the
    /// newcomer. Recovers from half-dead peers (a laptop waking from sleep).
    #[default]
    Replace,
    /// Close the newcomer with [`CloseReason::RoleOccupied`] and leave the
    /// incumbent alone. Guarantees exactly one occupant per role.
    Reject,
}

impl SlotPolicy {
    pub fn label(self) -> &'static str {
        match self {
            SlotPolicy::Replace => "replace",
            SlotPolicy::Reject => "reject",
        }
    }
}

#[derive(Debug)]
pub enum BindOutcome {
    Bound {
        /// The session did not exist before this bind.
        created: bool,
        /// Previous occupant, already closed as superseded.
        replaced: Option<ConnectionHandle>,
    },
    /// The slot was taken and the new connection has been closed.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbound {
    /// The slot held some other connection, or the session is gone.
    NotBound,
    Cleared,
    /// The slot was cleared and it was the session's last one.
    SessionRemoved,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub fingerprint: String,
    pub client_bound: bool,
    pub helper_bound: bool,
    pub idle: Duration,
}

/// Every live session on this process, keyed by token.
///
/// All operations serialise through one mutex. Critical sections are map
/// lookups and slot swaps only; closing a connection merely queues a frame,
/// and nothing here awaits.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    policy: SlotPolicy,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

struct SessionEntry {
    client: Option<ConnectionHandle>,
    helper: Option<ConnectionHandle>,
    last_activity: Instant,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            client: None,
            helper: None,
            last_activity: now,
        }
    }

    fn slot(&self, role: Role) -> &Option<ConnectionHandle> {
        match role {
            Role::Client => &self.client,
            Role::Helper => &self.helper,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<ConnectionHandle> {
        match role {
            Role::Client => &mut self.client,
            Role::Helper => &mut self.helper,
        }
    }

    fn is_empty(&self) -> bool {
        self.client.is_none() && self.helper.is_none()
    }

    fn take_all(&mut self) -> impl Iterator<Item = ConnectionHandle> {
        self.client.take().into_iter().chain(self.helper.take())
    }
}

impl SessionRegistry {
    /// The slot policy is fixed for the registry's lifetime; every conflicting
    /// bind on this process resolves the same way.
    pub fn new(policy: SlotPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                policy,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn policy(&self) -> SlotPolicy {
        self.inner.policy
    }

    /// Seats `handle` in its role's slot, creating the session if needed.
    pub fn bind(&self, token: &str, handle: &ConnectionHandle) -> BindOutcome {
        let role = handle.role();
        let now = Instant::now();

        let (outcome, evict) = {
            let mut sessions = self.inner.sessions.lock();
            let created = !sessions.contains_key(token);
            let entry = sessions
                .entry(token.to_string())
                .or_insert_with(|| SessionEntry::new(now));
            let slot = entry.slot_mut(role);

            let resolved = match slot.as_ref().map(ConnectionHandle::id) {
                Some(occupant) if occupant == handle.id() => (
                    BindOutcome::Bound {
                        created: false,
                        replaced: None,
                    },
                    None,
                ),
                Some(_) => match self.inner.policy {
                    SlotPolicy::Replace => {
                        let stale = slot.replace(handle.clone());
                        let evict = stale.clone().map(|c| (c, CloseReason::Superseded));
                        (
                            BindOutcome::Bound {
                                created,
                                replaced: stale,
                            },
                            evict,
                        )
                    }
                    SlotPolicy::Reject => (
                        BindOutcome::Rejected,
                        Some((handle.clone(), CloseReason::RoleOccupied)),
                    ),
                },
                None => {
                    *slot = Some(handle.clone());
                    (
                        BindOutcome::Bound {
                            created,
                            replaced: None,
                        },
                        None,
                    )
                }
            };

            if matches!(resolved.0, BindOutcome::Bound { .. }) {
                entry.last_activity = now;
            }
            resolved
        };

        if let Some((connection, reason)) = evict {
            connection.close(reason);
        }
        outcome
    }

    /// Occupant of the slot opposite `role`, if any.
    pub fn peer_of(&self, token: &str, role: Role) -> Option<ConnectionHandle> {
        let sessions = self.inner.sessions.lock();
        sessions
            .get(token)
            .and_then(|entry| entry.slot(role.peer()).clone())
    }

    pub fn touch(&self, token: &str) {
        let now = Instant::now();
        if let Some(entry) = self.inner.sessions.lock().get_mut(token) {
            entry.last_activity = now;
        }
    }

    /// Clears `role`'s slot if, and only if, it still holds `connection_id`.
    /// A session left with no occupants is removed in the same critical
    /// section.
    pub fn unbind(&self, token: &str, role: Role, connection_id: Uuid) -> Unbound {
        let mut sessions = self.inner.sessions.lock();
        let Some(entry) = sessions.get_mut(token) else {
            return Unbound::NotBound;
        };

        let slot = entry.slot_mut(role);
        if slot.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
            return Unbound::NotBound;
        }
        *slot = None;

        if entry.is_empty() {
            sessions.remove(token);
            Unbound::SessionRemoved
        } else {
            Unbound::Cleared
        }
    }

    /// Evicts every session idle for longer than `timeout` as of `now`,
    /// occupied or not, and closes whatever connections they still held.
    /// Returns the evicted tokens.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut stranded = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock();
            sessions.retain(|token, entry| {
                if now.saturating_duration_since(entry.last_activity) > timeout {
                    evicted.push(token.clone());
                    stranded.extend(entry.take_all());
                    false
                } else {
                    true
                }
            });
        }

        for connection in stranded {
            connection.close(CloseReason::IdleTimeout);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, token: &str) -> bool {
        self.inner.sessions.lock().contains_key(token)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let sessions = self.inner.sessions.lock();
        sessions
            .iter()
            .map(|(token, entry)| SessionSnapshot {
                fingerprint: session_fingerprint(token),
                client_bound: entry.client.is_some(),
                helper_bound: entry.helper.is_some(),
                idle: now.saturating_duration_since(entry.last_activity),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    fn connection(role: Role) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(role, tx), rx)
    }

    fn close_code(handle: &ConnectionHandle) -> Option<u16> {
        handle.close_reason().map(CloseReason::code)
    }

    #[test]
    fn bind_then_peer_of_returns_the_bound_connection() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (client, _rx) = connection(Role::Client);

        match registry.bind("abc123", &client) {
            BindOutcome::Bound { created, replaced } => {
                assert!(created);
                assert!(replaced.is_none());
            }
            BindOutcome::Rejected => panic!("first bind must succeed"),
        }

        let seen = registry.peer_of("abc123", Role::Helper).expect("client bound");
        assert_eq!(seen.id(), client.id());
        assert!(registry.peer_of("abc123", Role::Client).is_none());
        assert!(registry.peer_of("other", Role::Helper).is_none());
    }

    #[test]
    fn session_disappears_when_both_slots_empty() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (client, _c) = connection(Role::Client);
        let (helper, _h) = connection(Role::Helper);
        registry.bind("temp", &client);
        registry.bind("temp", &helper);

        assert_eq!(
            registry.unbind("temp", Role::Client, client.id()),
            Unbound::Cleared
        );
        assert!(registry.contains("temp"));
        assert_eq!(
            registry.unbind("temp", Role::Helper, helper.id()),
            Unbound::SessionRemoved
        );
        assert!(!registry.contains("temp"));
        assert!(registry.is_empty());

        // Second unbind is a no-op.
        assert_eq!(
            registry.unbind("temp", Role::Helper, helper.id()),
            Unbound::NotBound
        );
    }

    #[test]
    fn stale_unbind_does_not_clear_newer_occupant() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (old, _old_rx) = connection(Role::Helper);
        let (new, _new_rx) = connection(Role::Helper);
        registry.bind("abc", &old);
        registry.bind("abc", &new);

        assert_eq!(
            registry.unbind("abc", Role::Helper, old.id()),
            Unbound::NotBound
        );
        let seated = registry.peer_of("abc", Role::Client).expect("new helper seated");
        assert_eq!(seated.id(), new.id());
    }

    #[test]
    fn replace_policy_closes_incumbent_as_superseded() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (old, _old_rx) = connection(Role::Client);
        let (new, mut new_rx) = connection(Role::Client);
        registry.bind("abc", &old);

        match registry.bind("abc", &new) {
            BindOutcome::Bound { created, replaced } => {
                assert!(!created);
                assert_eq!(replaced.map(|c| c.id()), Some(old.id()));
            }
            BindOutcome::Rejected => panic!("replace policy never rejects"),
        }

        assert!(old.is_closed());
        assert_eq!(close_code(&old), Some(CloseReason::Superseded.code()));
        assert!(!new.is_closed());
        assert!(new_rx.try_recv().is_err());
        let seated = registry.peer_of("abc", Role::Helper).unwrap();
        assert_eq!(seated.id(), new.id());
    }

    #[test]
    fn reject_policy_closes_newcomer_and_keeps_incumbent() {
        let registry = SessionRegistry::new(SlotPolicy::Reject);
        let (incumbent, mut incumbent_rx) = connection(Role::Helper);
        let (newcomer, _newcomer_rx) = connection(Role::Helper);
        registry.bind("abc", &incumbent);

        assert!(matches!(
            registry.bind("abc", &newcomer),
            BindOutcome::Rejected
        ));
        assert!(newcomer.is_closed());
        assert_eq!(
            close_code(&newcomer),
            Some(CloseReason::RoleOccupied.code())
        );
        assert!(!incumbent.is_closed());
        assert!(incumbent_rx.try_recv().is_err());
        let seated = registry.peer_of("abc", Role::Client).unwrap();
        assert_eq!(seated.id(), incumbent.id());
    }

    #[test]
    fn rebinding_the_same_connection_is_a_refresh() {
        let registry = SessionRegistry::new(SlotPolicy::Reject);
        let (client, mut rx) = connection(Role::Client);
        registry.bind("abc", &client);
        assert!(matches!(
            registry.bind("abc", &client),
            BindOutcome::Bound { created: false, replaced: None }
        ));
        assert!(!client.is_closed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sweep_evicts_idle_sessions_even_when_occupied() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (silent, _silent_rx) = connection(Role::Client);
        registry.bind("stale", &silent);

        let timeout = Duration::from_secs(300);
        assert!(registry.sweep(Instant::now(), timeout).is_empty());

        let evicted = registry.sweep(Instant::now() + Duration::from_secs(301), timeout);
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.is_empty());
        assert!(silent.is_closed());
        assert_eq!(
            close_code(&silent),
            Some(CloseReason::IdleTimeout.code())
        );

        // The evicted connection's own teardown is now a no-op.
        assert_eq!(
            registry.unbind("stale", Role::Client, silent.id()),
            Unbound::NotBound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn touch_restarts_the_idle_clock() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (client, _rx) = connection(Role::Client);
        let (quiet, _quiet_rx) = connection(Role::Client);
        registry.bind("busy", &client);
        registry.bind("quiet", &quiet);

        tokio::time::advance(Duration::from_secs(200)).await;
        registry.touch("busy");
        tokio::time::advance(Duration::from_secs(150)).await;

        let evicted = registry.sweep(Instant::now(), Duration::from_secs(300));
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert!(registry.contains("busy"));
    }

    #[test]
    fn snapshot_reports_occupancy_without_tokens() {
        let registry = SessionRegistry::new(SlotPolicy::Replace);
        let (client, _rx) = connection(Role::Client);
        registry.bind("lonely", &client);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].client_bound);
        assert!(!snapshot[0].helper_bound);
        assert_ne!(snapshot[0].fingerprint, "lonely");
    }
}
