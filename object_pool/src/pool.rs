use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::lock;
use crate::managed::{ManagedObject, ObjectState};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Creation and destruction strategy of a pool.
pub trait ObjectFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    /// Display name of the pool; must not carry credentials.
    fn name(&self) -> String;

    fn create(&self) -> PoolResult<Self::Object>;

    fn destroy(&self, object: Self::Object) -> PoolResult<()>;
}

type Member<F> = Arc<ManagedObject<<F as ObjectFactory>::Object>>;

struct PoolState<T> {
    members: Vec<Arc<ManagedObject<T>>>,
    // slots reserved by acquirers currently running the factory
    creating: usize,
    next_id: u64,
}

/// Bounded pool of managed objects with a background maintenance sweep.
pub struct ObjectPool<F: ObjectFactory> {
    name: String,
    factory: F,
    config: RwLock<PoolConfig>,
    state: Mutex<PoolState<F::Object>>,
    // raised on every member state transition
    changed: Condvar,
    stop_requested: Mutex<bool>,
    stop_signal: Condvar,
    started: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ObjectFactory> ObjectPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            name: factory.name(),
            factory,
            config: RwLock::new(config),
            state: Mutex::new(PoolState {
                members: Vec::new(),
                creating: 0,
                next_id: 1,
            }),
            changed: Condvar::new(),
            stop_requested: Mutex::new(false),
            stop_signal: Condvar::new(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> PoolConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_config(&self, config: PoolConfig) -> PoolResult<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.lock_state().members.len()
    }

    pub fn states(&self) -> Vec<ObjectState> {
        self.lock_state().members.iter().map(|m| m.state()).collect()
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn describe_members(&self) -> String {
        let state = self.lock_state();
        Self::dump(&state.members)
    }

    fn dump(members: &[Member<F>]) -> String {
        let now = Instant::now();
        let mut out = format!("{} member(s)", members.len());
        for member in members {
            out.push('\n');
            out.push_str(&member.describe(now));
        }
        out
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Object>> {
        lock(&self.state)
    }

    pub fn is_stop_requested(&self) -> bool {
        *lock(&self.stop_requested)
    }

    /// Leases a free member, creating one while below `max`, otherwise waits
    /// up to `time_to_wait` for a release.
    pub fn acquire(self: &Arc<Self>) -> PoolResult<PooledObject<F>> {
        let config = self.config();
        let deadline = Instant::now() + config.time_to_wait;
        let mut last_failure: Option<String> = None;
        let mut state = self.lock_state();

        loop {
            if self.is_stop_requested() {
                return Err(PoolError::Stopped(self.name.clone()));
            }

            let capture = config.debug || state.members.len() >= config.auto_debug_threshold;

            let free = state
                .members
                .iter()
                .find(|m| m.state() == ObjectState::Free)
                .cloned();
            if let Some(member) = free {
                if member.transition(ObjectState::InUse) {
                    drop(state);
                    self.changed.notify_all();
                    return Ok(self.lease(member, capture));
                }
            }

            if state.members.len() + state.creating < config.max {
                state.creating += 1;
                let id = state.next_id;
                state.next_id += 1;
                drop(state);

                let created = self.factory.create();

                state = self.lock_state();
                state.creating -= 1;
                match created {
                    Ok(payload) => {
                        let member = Arc::new(ManagedObject::new(id, payload));
                        member.transition(ObjectState::Free);
                        member.transition(ObjectState::InUse);
                        state.members.push(member.clone());
                        let size = state.members.len();
                        drop(state);
                        self.changed.notify_all();
                        debug!(
                            "ObjectPool[{}]: created member #{}, size {}",
                            self.name, id, size
                        );
                        return Ok(self.lease(member, capture));
                    }
                    Err(e) => {
                        warn!("ObjectPool[{}]: create member failed! {}", self.name, e);
                        last_failure = Some(e.to_string());
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let members = Self::dump(&state.members);
                let reason = match last_failure {
                    Some(e) => format!("creation failed: {}", e),
                    None => format!(
                        "all {} member(s) in use after {}ms",
                        state.members.len(),
                        config.time_to_wait.as_millis()
                    ),
                };
                drop(state);
                if config.debug || capture {
                    warn!(
                        "ObjectPool[{}]: exhausted, {}\n{}",
                        self.name, reason, members
                    );
                }
                return Err(PoolError::NoObjectAvailable {
                    pool: self.name.clone(),
                    reason,
                    members,
                });
            }

            let wait = config.time_to_sleep.min(deadline - now);
            state = match self.changed.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lease(self: &Arc<Self>, member: Member<F>, capture: bool) -> PooledObject<F> {
        if capture {
            member.capture_lease_site();
        }
        PooledObject {
            pool: self.clone(),
            member,
            released: false,
        }
    }

    fn release_member(&self, member: &Member<F>) {
        let state = self.lock_state();
        let severed = !member.transition(ObjectState::Free);
        drop(state);
        if severed {
            // destroyed while leased; whoever severed it may not have
            // been able to take the payload yet
            self.destroy_payload(member);
        }
        self.changed.notify_all();
    }

    fn destroy_payload(&self, member: &Member<F>) {
        if let Some(payload) = member.take_payload() {
            if let Err(e) = self.factory.destroy(payload) {
                warn!(
                    "ObjectPool[{}]: destroy member #{} failed! {}",
                    self.name,
                    member.id(),
                    e
                );
            }
        }
    }

    /// One maintenance pass. Returns how many members were destroyed.
    pub fn sweep(&self) -> usize {
        let config = self.config();
        let now = Instant::now();
        let mut victims = Vec::new();
        let mut removed = 0;
        {
            let mut state = self.lock_state();
            let mut live = state
                .members
                .iter()
                .filter(|m| m.state() != ObjectState::Destroyed)
                .count();
            state.members.retain(|member| match member.state() {
                ObjectState::Destroyed => {
                    removed += 1;
                    false
                }
                ObjectState::Free => {
                    let evict = member.reached_ttl(config.max_ttl, now)
                        || (live > config.min && member.has_expired(config.expire, now));
                    if evict && member.transition(ObjectState::Destroyed) {
                        live -= 1;
                        victims.push(member.clone());
                        false
                    } else {
                        true
                    }
                }
                ObjectState::InUse => {
                    if member.reached_in_use_idle_time(config.in_use_idle_time, now)
                        && member.transition(ObjectState::Destroyed)
                    {
                        warn!(
                            "ObjectPool[{}]: member #{} leased but idle too long, severing",
                            self.name,
                            member.id()
                        );
                        live -= 1;
                        victims.push(member.clone());
                        false
                    } else {
                        true
                    }
                }
                ObjectState::NotUsed => true,
            });
        }

        if victims.is_empty() && removed == 0 {
            return 0;
        }
        self.changed.notify_all();
        for member in victims.iter() {
            self.destroy_payload(member);
        }
        debug!(
            "ObjectPool[{}]: sweep destroyed {}, dropped {} stale, size {}",
            self.name,
            victims.len(),
            removed,
            self.size()
        );
        victims.len()
    }

    /// Destroys every member best-effort and empties the pool.
    pub fn destroy_all(&self) -> usize {
        let victims: Vec<Member<F>> = {
            let mut state = self.lock_state();
            state
                .members
                .drain(..)
                .filter(|m| m.transition(ObjectState::Destroyed))
                .collect()
        };
        self.changed.notify_all();
        for member in victims.iter() {
            self.destroy_payload(member);
        }
        if !victims.is_empty() {
            info!(
                "ObjectPool[{}]: destroyed all {} member(s)",
                self.name,
                victims.len()
            );
        }
        victims.len()
    }

    /// Launches the maintenance worker. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) -> PoolResult<()> {
        if self.is_stop_requested() {
            return Err(PoolError::Stopped(self.name.clone()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("pool-sweep-{}", self.name))
            .spawn(move || pool.maintenance_loop());
        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.started.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn maintenance_loop(self: Arc<Self>) {
        info!("ObjectPool[{}]: maintenance worker started", self.name);
        loop {
            let interval = self.config().interval;
            if self.wait_stop(interval) {
                break;
            }
            self.sweep();
        }
        self.destroy_all();
        self.running.store(false, Ordering::SeqCst);
        info!("ObjectPool[{}]: maintenance worker stopped", self.name);
    }

    // true once a stop was requested
    fn wait_stop(&self, timeout: Duration) -> bool {
        let guard = lock(&self.stop_requested);
        let (guard, _) = match self
            .stop_signal
            .wait_timeout_while(guard, timeout, |stop| !*stop)
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard
    }

    /// Requests the worker to exit; it destroys all members on its way out.
    /// Outstanding leases keep working until their next call.
    pub fn stop(&self) {
        {
            let mut stop = lock(&self.stop_requested);
            if *stop {
                return;
            }
            *stop = true;
        }
        self.stop_signal.notify_all();
        self.changed.notify_all();

        let handle = lock(&self.worker).take();
        match handle {
            None => {
                self.destroy_all();
            }
            Some(handle) => {
                if self.config().daemon {
                    return;
                }
                if handle.join().is_err() {
                    warn!("ObjectPool[{}]: maintenance worker panicked", self.name);
                }
            }
        }
    }
}

/// A lease on one pool member, released on drop.
pub struct PooledObject<F: ObjectFactory> {
    pool: Arc<ObjectPool<F>>,
    member: Member<F>,
    released: bool,
}

impl<F: ObjectFactory> PooledObject<F> {
    pub fn id(&self) -> u64 {
        self.member.id()
    }

    pub fn managed(&self) -> &ManagedObject<F::Object> {
        &self.member
    }

    pub fn touch(&self) {
        self.member.touch();
    }

    /// Touches the lease, then runs `f` on the payload.
    pub fn with<R>(&self, f: impl FnOnce(&mut F::Object) -> R) -> PoolResult<R> {
        self.member.touch();
        if self.member.state() == ObjectState::Destroyed {
            return Err(PoolError::ObjectDestroyed(self.member.id()));
        }
        self.member
            .with_payload(f)
            .ok_or(PoolError::ObjectDestroyed(self.member.id()))
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_member(&self.member);
        }
    }
}

impl<F: ObjectFactory> Drop for PooledObject<F> {
    fn drop(&mut self) {
        self.release_once();
    }
}
