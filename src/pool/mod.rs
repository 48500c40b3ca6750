//! Keyed connection pooling
//!
//! The pool holds sessions partitioned by a route key. Every route has its own sub-pool of free
//! sessions, the identities of its leased sessions and a count of connections still being
//! established. Leased capacity is bounded per route and in aggregate, and requests which cannot
//! be served immediately wait in a queue until capacity is freed, their deadline elapses, they are
//! cancelled, or the pool closes.
//!
//! The pool never performs I/O while holding one of its locks. Work decided under a lock (fail
//! this request, hand that session to another, start a connection) is collected and carried out
//! once the locks are released. Connect and validation futures run on their own tasks.
//!
//! Locks are always taken in the same order: the pool-wide admission lock (only under
//! [`ConcurrencyPolicy::Strict`]), then briefly the route map, then a single route's lock. No
//! code path holds two route locks at once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::Instrument as _;
use tracing::{debug, trace, warn};

mod config;
mod entry;
mod key;
mod lease;
mod lock;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod route;
mod service;
mod stats;

pub use self::config::{ConcurrencyPolicy, Config, ReusePolicy};
pub use self::entry::{Affinity, Pooled};
pub use self::key::{RouteKey, Token};
pub use self::lease::Lease;
pub use self::stats::PoolStats;
pub use crate::notify::Notified as Closing;

use self::entry::Entry;
use self::key::TokenCounter;
use self::lease::Waiter;
use self::lock::{ArcMutex, WeakOpt};
use self::route::RoutePool;
use crate::connect::Connect;
use crate::error::{ConnectError, LeaseError};
use crate::notify;
use crate::session::{CloseMode, Session};
use crate::validate::Validate;

type SessionOf<K, C> = <C as Connect<K>>::Session;
type Route<K, S> = ArcMutex<RoutePool<K, S>>;
type Queue<K, S> = VecDeque<Waiter<K, S>>;

/// The pool side of a leased session or a waiting lease.
///
/// `Pooled` and `Lease` only hold a weak reference to this, so they never keep a pool alive.
pub(crate) trait Recycle<K, S>: Send + Sync
where
    K: RouteKey,
    S: Session,
{
    /// Return a leased entry. Returns `false` if the entry was not leased from this pool.
    fn recycle(&self, entry: Entry<K, S>, reusable: bool) -> bool;

    /// Remove a waiting request. Returns `true` if it was still queued.
    fn forget(&self, route: &K, id: Token) -> bool;
}

/// A pool of sessions keyed by route.
///
/// The pool is cheap to clone, and all clones refer to the same set of sessions.
pub struct Pool<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    inner: Arc<PoolInner<K, C>>,
}

impl<K, C> Clone for Pool<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, C> fmt::Debug for Pool<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("inner", &self.inner).finish()
    }
}

impl<K, C> Pool<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    /// Create a new pool which establishes sessions with `connector`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime. Connection attempts are spawned onto the
    /// runtime the pool was created in.
    pub fn new(connector: C, config: Config) -> Self {
        Self::build(connector, config, None)
    }

    /// Create a new pool which validates idle sessions with `validator` before reusing them.
    ///
    /// Validation only happens once a free session has been idle for at least
    /// [`Config::validate_after_inactivity`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_validator<V>(connector: C, config: Config, validator: V) -> Self
    where
        V: Validate<SessionOf<K, C>>,
    {
        Self::build(connector, config, Some(Arc::new(validator)))
    }

    fn build(
        connector: C,
        config: Config,
        validator: Option<Arc<dyn Validate<SessionOf<K, C>>>>,
    ) -> Self {
        let handle = Handle::current();
        let queue = match config.policy {
            ConcurrencyPolicy::Strict => Some(Mutex::new(VecDeque::new())),
            ConcurrencyPolicy::Lax => None,
        };

        let inner = Arc::new_cyclic(|this| PoolInner {
            this: this.clone(),
            validate_after_inactivity: RwLock::new(config.validate_after_inactivity),
            default_max_per_route: AtomicUsize::new(config.max_per_route),
            max_total: AtomicUsize::new(config.max_total),
            leased: AtomicUsize::new(0),
            routes: Mutex::new(HashMap::new()),
            queue,
            closed: AtomicBool::new(false),
            shutdown: notify::channel(),
            tokens: TokenCounter::default(),
            handle,
            connector,
            validator,
            config,
        });

        Self { inner }
    }

    /// Request a session for `route`.
    ///
    /// The returned [`Lease`] settles with a session once capacity is available on both the route
    /// and the pool as a whole. A free session carrying `affinity` is preferred over other free
    /// sessions. When `timeout` is given, it bounds the whole wait, including any connection
    /// attempt made on the request's behalf.
    pub fn lease(
        &self,
        route: K,
        affinity: Option<Affinity>,
        timeout: Option<Duration>,
    ) -> Lease<K, SessionOf<K, C>> {
        self.inner.lease(route, affinity, timeout)
    }

    /// Return a leased session to the pool.
    ///
    /// Equivalent to [`Pooled::release`].
    pub fn release(&self, pooled: Pooled<K, SessionOf<K, C>>, reusable: bool) -> bool {
        pooled.release(reusable)
    }

    /// Occupancy of a single route.
    pub fn route_stats(&self, route: &K) -> PoolStats {
        self.inner.route_stats(route)
    }

    /// Occupancy of the whole pool.
    pub fn total_stats(&self) -> PoolStats {
        self.inner.total_stats()
    }

    /// Routes the pool currently holds state for.
    pub fn routes(&self) -> Vec<K> {
        self.inner.routes.lock().keys().cloned().collect()
    }

    /// Set the idle duration after which free sessions are validated before reuse.
    pub fn set_validate_after_inactivity(&self, threshold: Option<Duration>) {
        *self.inner.validate_after_inactivity.write() = threshold;
    }

    /// The idle duration after which free sessions are validated before reuse.
    pub fn validate_after_inactivity(&self) -> Option<Duration> {
        *self.inner.validate_after_inactivity.read()
    }

    /// Set the maximum number of leased sessions across all routes.
    ///
    /// Raising the limit immediately services waiting requests. Lowering it never revokes
    /// sessions which are already leased.
    pub fn set_max_total(&self, max: usize) {
        debug!(max, "setting pool max total");
        self.inner.max_total.store(max, Ordering::SeqCst);
        self.inner.kick(None);
    }

    /// The maximum number of leased sessions across all routes.
    pub fn max_total(&self) -> usize {
        self.inner.max_total.load(Ordering::SeqCst)
    }

    /// Set the per-route maximum used by routes without their own limit.
    pub fn set_default_max_per_route(&self, max: usize) {
        debug!(max, "setting default max per route");
        self.inner.default_max_per_route.store(max, Ordering::SeqCst);
        self.inner.kick(None);
    }

    /// The per-route maximum used by routes without their own limit.
    pub fn default_max_per_route(&self) -> usize {
        self.inner.default_max()
    }

    /// Set the maximum number of leased sessions for one route.
    pub fn set_max_per_route(&self, route: K, max: usize) {
        debug!(?route, max, "setting route max");
        self.inner.route(&route).lock().max = Some(max);
        self.inner.kick(Some(&route));
    }

    /// The maximum number of leased sessions for one route.
    pub fn max_per_route(&self, route: &K) -> usize {
        let default = self.inner.default_max();
        match self.inner.lookup(route) {
            Some(pool) => pool.lock().max(default),
            None => default,
        }
    }

    /// Close free sessions which have been idle for at least `idle`.
    pub fn close_idle(&self, idle: Duration) {
        self.inner.close_idle(idle);
    }

    /// Close free sessions which have outlived their time-to-live.
    pub fn close_expired(&self) {
        self.inner.close_expired();
    }

    /// Close the pool.
    ///
    /// New leases fail with [`LeaseError::Closed`], as does every waiting lease. Free sessions are
    /// closed immediately, and in-flight connection attempts and validations are cancelled.
    /// Leased sessions are signalled with `mode` (see [`Pooled::closing`]) and closed with that
    /// mode through their [`CloseHandle`](crate::session::CloseHandle). Closing never waits for
    /// sessions to drain, and closing twice has no effect.
    pub fn close(&self, mode: CloseMode) {
        self.inner.close(mode);
    }

    /// Returns `true` once the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Work decided while holding pool locks, carried out once they are released.
struct Pass<K, S>
where
    K: RouteKey,
    S: Session,
{
    dispatch: Vec<(Waiter<K, S>, Acquire<K, S>)>,
    failed: Vec<(Waiter<K, S>, LeaseError)>,
    discard: Vec<Entry<K, S>>,
    graceful: Vec<Entry<K, S>>,
}

impl<K, S> Default for Pass<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn default() -> Self {
        Self {
            dispatch: Vec::new(),
            failed: Vec::new(),
            discard: Vec::new(),
            graceful: Vec::new(),
        }
    }
}

/// Capacity reserved for a waiter: a free entry, or a slot for a new connection.
enum Acquire<K, S> {
    Reuse(Entry<K, S>),
    Connect,
}

/// What a reservation holds on its route while a task works on behalf of a waiter.
#[derive(Debug, Clone, Copy)]
enum Hold {
    Connecting,
    Leased(Token),
}

pub(crate) struct PoolInner<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    this: Weak<Self>,
    config: Config,
    connector: C,
    validator: Option<Arc<dyn Validate<SessionOf<K, C>>>>,
    validate_after_inactivity: RwLock<Option<Duration>>,
    default_max_per_route: AtomicUsize,
    max_total: AtomicUsize,

    /// Leased entries plus connection reservations, across all routes.
    leased: AtomicUsize,
    routes: Mutex<HashMap<K, Route<K, SessionOf<K, C>>>>,

    /// The pool-wide queue, present only under the strict policy. Its lock is the admission lock.
    queue: Option<Mutex<Queue<K, SessionOf<K, C>>>>,
    closed: AtomicBool,
    shutdown: notify::Sender,
    tokens: TokenCounter,
    handle: Handle,
}

impl<K, C> fmt::Debug for PoolInner<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInner")
            .field("config", &self.config)
            .field("leased", &self.leased.load(Ordering::Relaxed))
            .field("max_total", &self.max_total.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, C> PoolInner<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn default_max(&self) -> usize {
        self.default_max_per_route.load(Ordering::SeqCst)
    }

    fn admission(&self) -> Option<MutexGuard<'_, Queue<K, SessionOf<K, C>>>> {
        self.queue.as_ref().map(|queue| queue.lock())
    }

    fn recycler(&self) -> WeakOpt<dyn Recycle<K, SessionOf<K, C>>> {
        let weak: Weak<dyn Recycle<K, SessionOf<K, C>>> = self.this.clone();
        WeakOpt::new(weak)
    }

    /// Get the sub-pool for a route, creating it if necessary.
    fn route(&self, key: &K) -> Route<K, SessionOf<K, C>> {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get(key) {
            return route.clone();
        }

        trace!(route=?key, "creating route pool");
        let route = ArcMutex::new(RoutePool::new(key.clone()));
        routes.insert(key.clone(), route.clone());
        route
    }

    fn lookup(&self, key: &K) -> Option<Route<K, SessionOf<K, C>>> {
        self.routes.lock().get(key).cloned()
    }

    /// All route pools, with `first` (if present) at the front.
    fn snapshot(&self, first: Option<&K>) -> Vec<Route<K, SessionOf<K, C>>> {
        let routes = self.routes.lock();
        let mut snapshot = Vec::with_capacity(routes.len());
        if let Some(route) = first.and_then(|key| routes.get(key)) {
            snapshot.push(route.clone());
        }

        snapshot.extend(
            routes
                .iter()
                .filter(|(key, _)| Some(*key) != first)
                .map(|(_, route)| route.clone()),
        );
        snapshot
    }

    /// Reserve one unit of global capacity.
    fn reserve(&self) -> bool {
        let max = self.max_total.load(Ordering::SeqCst);
        self.leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |leased| {
                (leased < max).then_some(leased + 1)
            })
            .is_ok()
    }

    fn unreserve(&self) {
        let released = self
            .leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |leased| {
                leased.checked_sub(1)
            });

        if released.is_err() {
            warn!("released more capacity than was reserved, leased count is already zero");
        }
    }

    fn at_capacity(&self) -> bool {
        self.leased.load(Ordering::SeqCst) >= self.max_total.load(Ordering::SeqCst)
    }

    /// Reserve capacity on `pool` and globally, taking a free entry when there is one.
    fn try_acquire(
        &self,
        pool: &mut RoutePool<K, SessionOf<K, C>>,
        affinity: Option<&Affinity>,
        now: Instant,
        pass: &mut Pass<K, SessionOf<K, C>>,
    ) -> Option<Acquire<K, SessionOf<K, C>>> {
        pool.sweep(now, self.config.idle_timeout, &mut pass.discard);

        if !pool.has_capacity(self.default_max()) || !self.reserve() {
            return None;
        }

        match pool.take_free(affinity, self.config.reuse) {
            Some(entry) => {
                trace!(route=?pool.route(), id=?entry.id, "reusing free entry");
                pool.lease(&entry);
                Some(Acquire::Reuse(entry))
            }
            None => {
                trace!(route=?pool.route(), "reserving capacity for a new connection");
                pool.connect();
                Some(Acquire::Connect)
            }
        }
    }

    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(?route), level = "debug"))]
    fn lease(
        &self,
        route: K,
        affinity: Option<Affinity>,
        timeout: Option<Duration>,
    ) -> Lease<K, SessionOf<K, C>> {
        let now = Instant::now();
        let deadline = timeout.and_then(|timeout| now.checked_add(timeout));
        let (lease, waiter) =
            lease::request(self.tokens.next(), route, affinity, deadline, self.recycler());

        if self.is_closed() {
            debug!("lease requested from closed pool");
            waiter.fail(LeaseError::Closed);
            return lease;
        }

        let mut pass = Pass::default();
        {
            let mut admission = self.admission();
            let route = self.route(&waiter.route);
            let mut pool = route.lock();

            if self.is_closed() {
                pass.failed.push((waiter, LeaseError::Closed));
            } else {
                // Requests already waiting on this route go first.
                let waiting = match admission.as_deref() {
                    Some(queue) => queue
                        .iter()
                        .any(|queued| queued.route == waiter.route && !queued.is_cancelled()),
                    None => pool.has_pending(),
                };

                let acquired = if waiting {
                    None
                } else {
                    self.try_acquire(&mut pool, waiter.affinity.as_ref(), now, &mut pass)
                };

                match acquired {
                    Some(acquire) => pass.dispatch.push((waiter, acquire)),
                    None => {
                        trace!(waiting, "no capacity available, queueing lease");
                        match admission.as_deref_mut() {
                            Some(queue) => queue.push_back(waiter),
                            None => pool.pending.push_back(waiter),
                        }
                    }
                }
            }
        }

        self.finish(pass);
        lease
    }

    /// Return a leased entry to its route.
    fn release(&self, mut entry: Entry<K, SessionOf<K, C>>, reusable: bool) -> bool {
        let now = Instant::now();
        let key = entry.route.clone();
        let mut pass = Pass::default();
        let mut admission = self.admission();

        let Some(route) = self.lookup(&key) else {
            debug!(route=?key, id=?entry.id, "ignoring release for unknown route");
            return false;
        };

        {
            let mut pool = route.lock();
            if !pool.release(entry.id) {
                debug!(route=?key, id=?entry.id, "ignoring release of entry which is not leased");
                return false;
            }
            self.unreserve();

            if self.is_closed() {
                let mode = self.shutdown.mode().unwrap_or(CloseMode::Immediate);
                trace!(id=?entry.id, %mode, "pool closed, closing released entry");
                match mode {
                    CloseMode::Graceful => pass.graceful.push(entry),
                    CloseMode::Immediate => pass.discard.push(entry),
                }
            } else if reusable && entry.is_reusable(now) {
                trace!(id=?entry.id, "returning entry to the free list");
                entry.updated = now;
                pool.push_free(entry, self.config.max_idle_per_route, &mut pass.discard);
            } else {
                trace!(id=?entry.id, reusable, "discarding released entry");
                pass.discard.push(entry);
            }
        }

        self.service(Some(&key), admission.as_deref_mut(), now, &mut pass);
        drop(admission);
        self.finish(pass);
        true
    }

    /// Offer free capacity to waiting requests.
    fn service(
        &self,
        origin: Option<&K>,
        queue: Option<&mut Queue<K, SessionOf<K, C>>>,
        now: Instant,
        pass: &mut Pass<K, SessionOf<K, C>>,
    ) {
        if self.is_closed() {
            return;
        }

        match queue {
            Some(queue) => self.service_queue(queue, now, pass),
            None => self.service_routes(origin, now, pass),
        }
    }

    /// Strict servicing: walk the pool-wide queue in arrival order.
    fn service_queue(
        &self,
        queue: &mut Queue<K, SessionOf<K, C>>,
        now: Instant,
        pass: &mut Pass<K, SessionOf<K, C>>,
    ) {
        let mut waiting = VecDeque::with_capacity(queue.len());

        while let Some(waiter) = queue.pop_front() {
            if waiter.is_cancelled() {
                trace!(id=?waiter.id, "dropping cancelled lease");
                continue;
            }

            if waiter.is_expired(now) {
                pass.failed.push((waiter, LeaseError::Timeout));
                continue;
            }

            if self.at_capacity() {
                waiting.push_back(waiter);
                continue;
            }

            let route = self.route(&waiter.route);
            let mut pool = route.lock();
            match self.try_acquire(&mut pool, waiter.affinity.as_ref(), now, pass) {
                Some(acquire) => pass.dispatch.push((waiter, acquire)),
                None => waiting.push_back(waiter),
            }
        }

        *queue = waiting;
    }

    /// Lax servicing: the originating route first, then every other route.
    fn service_routes(&self, origin: Option<&K>, now: Instant, pass: &mut Pass<K, SessionOf<K, C>>) {
        for route in self.snapshot(origin) {
            if self.at_capacity() {
                break;
            }

            let mut pool = route.lock();
            while let Some(waiter) = pool.pending.pop_front() {
                if waiter.is_cancelled() {
                    trace!(id=?waiter.id, "dropping cancelled lease");
                    continue;
                }

                if waiter.is_expired(now) {
                    pass.failed.push((waiter, LeaseError::Timeout));
                    continue;
                }

                match self.try_acquire(&mut pool, waiter.affinity.as_ref(), now, pass) {
                    Some(acquire) => pass.dispatch.push((waiter, acquire)),
                    None => {
                        pool.pending.push_front(waiter);
                        break;
                    }
                }
            }
        }
    }

    /// Service waiting requests after a limit was raised.
    fn kick(&self, origin: Option<&K>) {
        let mut pass = Pass::default();
        let mut admission = self.admission();
        self.service(origin, admission.as_deref_mut(), Instant::now(), &mut pass);
        drop(admission);
        self.finish(pass);
    }

    /// Carry out the work collected under the locks. Must be called with no pool locks held.
    fn finish(&self, pass: Pass<K, SessionOf<K, C>>) {
        let Pass {
            dispatch,
            failed,
            discard,
            graceful,
        } = pass;

        for mut entry in discard {
            trace!(route=?entry.route, id=?entry.id, "closing discarded entry");
            entry.close(CloseMode::Immediate);
        }

        for mut entry in graceful {
            entry.close(CloseMode::Graceful);
        }

        for (waiter, error) in failed {
            waiter.fail(error);
        }

        for (waiter, acquire) in dispatch {
            self.dispatch(waiter, acquire);
        }
    }

    fn dispatch(&self, waiter: Waiter<K, SessionOf<K, C>>, acquire: Acquire<K, SessionOf<K, C>>) {
        let Some(this) = self.this.upgrade() else {
            let hold = match &acquire {
                Acquire::Reuse(entry) => Hold::Leased(entry.id),
                Acquire::Connect => Hold::Connecting,
            };
            self.abandon(waiter, hold);
            return;
        };

        match acquire {
            Acquire::Reuse(entry) => match self.validator_for(&entry, Instant::now()) {
                Some(validator) => this.validate(waiter, entry, validator),
                None => self.deliver(waiter, entry),
            },
            Acquire::Connect => this.connect(waiter),
        }
    }

    /// The validator to use for a free entry, if it has been idle long enough to need one.
    fn validator_for(
        &self,
        entry: &Entry<K, SessionOf<K, C>>,
        now: Instant,
    ) -> Option<Arc<dyn Validate<SessionOf<K, C>>>> {
        let validator = self.validator.as_ref()?;
        let threshold = (*self.validate_after_inactivity.read())?;
        (entry.idle(now) >= threshold).then(|| validator.clone())
    }

    fn deliver(&self, waiter: Waiter<K, SessionOf<K, C>>, mut entry: Entry<K, SessionOf<K, C>>) {
        if self.is_closed() {
            trace!(id=?entry.id, "pool closed before delivery");
            waiter.fail(LeaseError::Closed);
            self.release(entry, false);
            return;
        }

        entry.leases += 1;
        trace!(route=?entry.route, id=?entry.id, lease=?waiter.id, "delivering entry");
        let pooled = Pooled::new(entry, self.recycler(), self.shutdown.subscribe());
        waiter.fulfil(pooled);
    }

    fn connect(self: Arc<Self>, waiter: Waiter<K, SessionOf<K, C>>) {
        let route = waiter.route.clone();
        let span = tracing::debug_span!("connect", ?route, lease=?waiter.id);
        let reservation = Reservation::new(self.clone(), waiter, Hold::Connecting);
        let mut connector = self.connector.clone();
        let timeout = self.config.connect_timeout;
        let mut closing = self.shutdown.subscribe();

        let task = async move {
            let connect = async {
                futures::future::poll_fn(|cx| Connect::<K>::poll_ready(&mut connector, cx))
                    .await
                    .map_err(ConnectError::connecting)?;

                let future = Connect::<K>::connect(&mut connector, &route);
                let session = match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, future)
                        .await
                        .map_err(|_| ConnectError::Timeout(timeout))?,
                    None => future.await,
                }
                .map_err(ConnectError::connecting)?;

                Ok::<_, ConnectError>(session)
            };

            tokio::select! {
                outcome = connect => reservation.connected(outcome),
                mode = closing.recv() => {
                    debug!(%mode, "pool closed while connecting");
                    drop(reservation);
                }
            }
        };

        self.handle.spawn(task.instrument(span));
    }

    fn validate(
        self: Arc<Self>,
        waiter: Waiter<K, SessionOf<K, C>>,
        entry: Entry<K, SessionOf<K, C>>,
        validator: Arc<dyn Validate<SessionOf<K, C>>>,
    ) {
        let span = tracing::debug_span!("validate", route=?entry.route, id=?entry.id);
        let reservation = Reservation::new(self.clone(), waiter, Hold::Leased(entry.id));
        let probe = validator.probe(&entry.session);
        let mut closing = self.shutdown.subscribe();

        let task = async move {
            let mut entry = entry;
            tokio::select! {
                outcome = probe => {
                    let valid = match outcome {
                        Ok(valid) => valid,
                        Err(error) => {
                            debug!(%error, "validation probe failed");
                            false
                        }
                    };

                    let valid = valid && entry.session.is_open();
                    reservation.validated(entry, valid);
                }
                mode = closing.recv() => {
                    debug!(%mode, "pool closed while validating");
                    entry.close(CloseMode::Immediate);
                    drop(reservation);
                }
            }
        };

        self.handle.spawn(task.instrument(span));
    }

    /// A connection attempt made on behalf of `waiter` finished.
    fn connected(
        &self,
        waiter: Waiter<K, SessionOf<K, C>>,
        outcome: Result<SessionOf<K, C>, ConnectError>,
    ) {
        let now = Instant::now();
        let key = waiter.route.clone();
        let mut pass = Pass::default();
        let mut admission = self.admission();
        let route = self.route(&key);
        let mut pool = route.lock();
        pool.connected();

        match outcome {
            Ok(session) if !self.is_closed() => {
                let entry = Entry::new(
                    self.tokens.next(),
                    key,
                    session,
                    now,
                    self.config.time_to_live,
                    waiter.affinity.clone(),
                );
                trace!(route=?entry.route, id=?entry.id, "connected new entry");
                pool.lease(&entry);
                drop(pool);
                drop(admission);
                self.deliver(waiter, entry);
            }
            Ok(mut session) => {
                debug!(route=?key, "pool closed while connecting, discarding new session");
                self.unreserve();
                drop(pool);
                drop(admission);
                session.close(CloseMode::Immediate);
                waiter.fail(LeaseError::Closed);
            }
            Err(error) => {
                debug!(route=?key, %error, "connection failed");
                self.unreserve();
                drop(pool);
                pass.failed.push((waiter, LeaseError::Connect(error)));
                self.service(Some(&key), admission.as_deref_mut(), now, &mut pass);
                drop(admission);
                self.finish(pass);
            }
        }
    }

    /// A free entry failed validation. Try another free entry, or connect, for the same waiter.
    fn revalidate(&self, waiter: Waiter<K, SessionOf<K, C>>, entry: Entry<K, SessionOf<K, C>>) {
        debug!(route=?entry.route, id=?entry.id, "idle entry failed validation");
        let now = Instant::now();
        let key = waiter.route.clone();
        let mut pass = Pass::default();
        let mut admission = self.admission();
        let route = self.route(&key);
        let mut pool = route.lock();

        pool.release(entry.id);
        pass.discard.push(entry);

        if self.is_closed() {
            self.unreserve();
            drop(pool);
            pass.failed.push((waiter, LeaseError::Closed));
        } else if waiter.is_cancelled() {
            self.unreserve();
            drop(pool);
            drop(waiter);
            self.service(Some(&key), admission.as_deref_mut(), now, &mut pass);
        } else {
            // The waiter keeps the capacity it already reserved.
            pool.sweep(now, self.config.idle_timeout, &mut pass.discard);
            let acquire = match pool.take_free(waiter.affinity.as_ref(), self.config.reuse) {
                Some(next) => {
                    pool.lease(&next);
                    Acquire::Reuse(next)
                }
                None => {
                    pool.connect();
                    Acquire::Connect
                }
            };
            drop(pool);
            pass.dispatch.push((waiter, acquire));
        }

        drop(admission);
        self.finish(pass);
    }

    /// Give back capacity reserved for a waiter whose task was dropped before it finished.
    fn abandon(&self, waiter: Waiter<K, SessionOf<K, C>>, hold: Hold) {
        let now = Instant::now();
        let key = waiter.route.clone();
        let mut pass = Pass::default();
        let mut admission = self.admission();

        trace!(route=?key, ?hold, "abandoning reserved capacity");
        if let Some(route) = self.lookup(&key) {
            let mut pool = route.lock();
            match hold {
                Hold::Connecting => pool.connected(),
                Hold::Leased(id) => {
                    pool.release(id);
                }
            }
        }
        self.unreserve();

        pass.failed.push((waiter, LeaseError::Closed));
        self.service(Some(&key), admission.as_deref_mut(), now, &mut pass);
        drop(admission);
        self.finish(pass);
    }

    fn route_stats(&self, key: &K) -> PoolStats {
        let admission = self.admission();
        let default = self.default_max();
        let mut stats = match self.lookup(key) {
            Some(route) => route.lock().stats(default),
            None => PoolStats {
                max: default,
                ..Default::default()
            },
        };

        if let Some(queue) = admission.as_deref() {
            stats.pending = queue
                .iter()
                .filter(|waiter| &waiter.route == key && !waiter.is_cancelled())
                .count();
        }

        stats
    }

    fn total_stats(&self) -> PoolStats {
        let admission = self.admission();
        let default = self.default_max();
        let mut stats = PoolStats {
            max: self.max_total.load(Ordering::SeqCst),
            ..Default::default()
        };

        for route in self.snapshot(None) {
            stats += route.lock().stats(default);
        }

        if let Some(queue) = admission.as_deref() {
            stats.pending = queue.iter().filter(|waiter| !waiter.is_cancelled()).count();
        }

        stats
    }

    fn close_idle(&self, idle: Duration) {
        let now = Instant::now();
        let mut pass = Pass::default();
        for route in self.snapshot(None) {
            route.lock().close_idle(now, idle, &mut pass.discard);
        }

        debug!(closed = pass.discard.len(), ?idle, "closing idle entries");
        self.prune();
        self.finish(pass);
    }

    fn close_expired(&self) {
        let now = Instant::now();
        let mut pass = Pass::default();
        for route in self.snapshot(None) {
            route.lock().close_expired(now, &mut pass.discard);
        }

        debug!(closed = pass.discard.len(), "closing expired entries");
        self.prune();
        self.finish(pass);
    }

    /// Drop route pools which hold no state and are not in use elsewhere.
    fn prune(&self) {
        let mut routes = self.routes.lock();
        routes.retain(|_, route| route.is_shared() || !route.lock().is_vacant());
    }

    fn close(&self, mode: CloseMode) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(%mode, "pool already closed");
            return;
        }

        debug!(%mode, "closing pool");
        self.shutdown.send(mode);

        let mut pass = Pass::default();
        let mut admission = self.admission();
        if let Some(queue) = admission.as_deref_mut() {
            pass.failed
                .extend(queue.drain(..).map(|waiter| (waiter, LeaseError::Closed)));
        }

        let mut leased = Vec::new();
        for route in self.snapshot(None) {
            let mut pool = route.lock();
            pool.drain_free(&mut pass.discard);
            pass.failed
                .extend(pool.pending.drain(..).map(|waiter| (waiter, LeaseError::Closed)));
            leased.extend(pool.leased_handles());
        }

        drop(admission);

        trace!(leased = leased.len(), %mode, "closing leased sessions");
        for handle in leased {
            handle.close(mode);
        }
        self.finish(pass);
    }
}

impl<K, C> Recycle<K, SessionOf<K, C>> for PoolInner<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn recycle(&self, entry: Entry<K, SessionOf<K, C>>, reusable: bool) -> bool {
        self.release(entry, reusable)
    }

    fn forget(&self, route: &K, id: Token) -> bool {
        match self.admission() {
            Some(mut queue) => match queue.iter().position(|waiter| waiter.id == id) {
                Some(index) => {
                    queue.remove(index);
                    true
                }
                None => false,
            },
            None => self
                .lookup(route)
                .is_some_and(|pool| pool.lock().forget(id)),
        }
    }
}

/// Capacity held by a spawned task on behalf of a waiter.
///
/// If the task is dropped before it settles the waiter (because the pool closed or the runtime
/// shut down), the capacity is given back and the waiter fails.
struct Reservation<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    pool: Arc<PoolInner<K, C>>,
    waiter: Option<Waiter<K, SessionOf<K, C>>>,
    hold: Hold,
}

impl<K, C> Reservation<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn new(pool: Arc<PoolInner<K, C>>, waiter: Waiter<K, SessionOf<K, C>>, hold: Hold) -> Self {
        Self {
            pool,
            waiter: Some(waiter),
            hold,
        }
    }

    fn connected(mut self, outcome: Result<SessionOf<K, C>, ConnectError>) {
        if let Some(waiter) = self.waiter.take() {
            self.pool.connected(waiter, outcome);
        }
    }

    fn validated(mut self, entry: Entry<K, SessionOf<K, C>>, valid: bool) {
        if let Some(waiter) = self.waiter.take() {
            if valid {
                self.pool.deliver(waiter, entry);
            } else {
                self.pool.revalidate(waiter, entry);
            }
        }
    }
}

impl<K, C> Drop for Reservation<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.pool.abandon(waiter, self.hold);
        }
    }
}
