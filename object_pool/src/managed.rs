use crate::lock;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    NotUsed,
    Free,
    InUse,
    Destroyed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::NotUsed => "not_used",
            ObjectState::Free => "free",
            ObjectState::InUse => "in_use",
            ObjectState::Destroyed => "destroyed",
        }
    }

    /// `NotUsed -> Free <-> InUse`, anything live may go to `Destroyed`,
    /// and `Destroyed` is terminal.
    pub fn can_transition_to(&self, next: ObjectState) -> bool {
        match (self, next) {
            (ObjectState::Destroyed, _) => false,
            (_, ObjectState::Destroyed) => true,
            (ObjectState::NotUsed, ObjectState::Free) => true,
            (ObjectState::Free, ObjectState::InUse) => true,
            (ObjectState::InUse, ObjectState::Free) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: ObjectState,
    state_changed_at: Instant,
    last_access: Instant,
    lease_site: Option<String>,
}

/// A pooled payload plus its lifecycle bookkeeping.
pub struct ManagedObject<T> {
    id: u64,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    payload: Mutex<Option<T>>,
}

impl<T> ManagedObject<T> {
    pub fn new(id: u64, payload: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            lifecycle: Mutex::new(Lifecycle {
                state: ObjectState::NotUsed,
                state_changed_at: now,
                last_access: now,
                lease_site: None,
            }),
            payload: Mutex::new(Some(payload)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ObjectState {
        lock(&self.lifecycle).state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state_changed_at(&self) -> Instant {
        lock(&self.lifecycle).state_changed_at
    }

    pub fn last_access(&self) -> Instant {
        lock(&self.lifecycle).last_access
    }

    pub fn lease_site(&self) -> Option<String> {
        lock(&self.lifecycle).lease_site.clone()
    }

    pub fn touch(&self) {
        lock(&self.lifecycle).last_access = Instant::now();
    }

    /// Applies `next` if the transition is legal; returns whether it was.
    pub fn transition(&self, next: ObjectState) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.state.can_transition_to(next) {
            return false;
        }
        let now = Instant::now();
        lifecycle.state = next;
        lifecycle.state_changed_at = now;
        if next == ObjectState::InUse {
            lifecycle.last_access = now;
        }
        if next != ObjectState::InUse {
            lifecycle.lease_site = None;
        }
        true
    }

    pub(crate) fn capture_lease_site(&self) {
        let site = Backtrace::force_capture().to_string();
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == ObjectState::InUse {
            lifecycle.lease_site = Some(site);
        }
    }

    pub(crate) fn take_payload(&self) -> Option<T> {
        lock(&self.payload).take()
    }

    /// Runs `f` against the payload; `None` once the payload is gone.
    pub fn with_payload<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut payload = lock(&self.payload);
        payload.as_mut().map(f)
    }

    /// Free for longer than `expire` since the last state change.
    pub fn has_expired(&self, expire: Duration, now: Instant) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.state == ObjectState::Free
            && now.saturating_duration_since(lifecycle.state_changed_at) > expire
    }

    pub fn reached_ttl(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match ttl {
            Some(ttl) => now.saturating_duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    pub fn reached_in_use_idle_time(&self, idle: Option<Duration>, now: Instant) -> bool {
        let Some(idle) = idle else {
            return false;
        };
        let lifecycle = lock(&self.lifecycle);
        lifecycle.state == ObjectState::InUse
            && now.saturating_duration_since(lifecycle.last_access) > idle
    }

    /// One line per member, followed by the lease site when one was captured.
    pub fn describe(&self, now: Instant) -> String {
        let lifecycle = lock(&self.lifecycle);
        let mut line = format!(
            "#{} {} age={}ms since_change={}ms idle={}ms",
            self.id,
            lifecycle.state,
            now.saturating_duration_since(self.created_at).as_millis(),
            now.saturating_duration_since(lifecycle.state_changed_at).as_millis(),
            now.saturating_duration_since(lifecycle.last_access).as_millis(),
        );
        if let Some(site) = &lifecycle.lease_site {
            line.push_str("\n  leased at:\n");
            line.push_str(site);
        }
        line
    }
}

impl<T> fmt::Debug for ManagedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
