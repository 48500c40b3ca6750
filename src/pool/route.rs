use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::ReusePolicy;
use super::RouteKey;
use super::Token;
use super::entry::{Affinity, Entry};
use super::lease::Waiter;
use super::stats::PoolStats;
use crate::session::{CloseHandle, Session};

/// Per-route state: free entries, leased identities, in-flight connects and (under the lax
/// policy) the route's own queue of waiting requests.
pub(crate) struct RoutePool<K, S>
where
    K: RouteKey,
    S: Session,
{
    route: K,

    /// Free entries, most recently released at the front.
    free: VecDeque<Entry<K, S>>,

    /// Leased entries, with a handle to close each one if the pool closes while it is out.
    leased: HashMap<Token, CloseHandle>,
    connecting: usize,
    pub(crate) pending: VecDeque<Waiter<K, S>>,
    pub(crate) max: Option<usize>,
}

impl<K, S> fmt::Debug for RoutePool<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePool")
            .field("route", &self.route)
            .field("free", &self.free.len())
            .field("leased", &self.leased.len())
            .field("connecting", &self.connecting)
            .field("pending", &self.pending.len())
            .field("max", &self.max)
            .finish()
    }
}

impl<K, S> RoutePool<K, S>
where
    K: RouteKey,
    S: Session,
{
    pub(crate) fn new(route: K) -> Self {
        Self {
            route,
            free: VecDeque::new(),
            leased: HashMap::new(),
            connecting: 0,
            pending: VecDeque::new(),
            max: None,
        }
    }

    pub(crate) fn route(&self) -> &K {
        &self.route
    }

    /// Leased entries plus reservations for connections still being established.
    pub(crate) fn allocated(&self) -> usize {
        self.leased.len() + self.connecting
    }

    pub(crate) fn max(&self, default: usize) -> usize {
        self.max.unwrap_or(default)
    }

    pub(crate) fn has_capacity(&self, default: usize) -> bool {
        self.allocated() < self.max(default)
    }

    /// Returns `true` if any queued request on this route is still waiting.
    pub(crate) fn has_pending(&self) -> bool {
        self.pending.iter().any(|waiter| !waiter.is_cancelled())
    }

    pub(crate) fn is_vacant(&self) -> bool {
        self.free.is_empty()
            && self.leased.is_empty()
            && self.connecting == 0
            && self.pending.is_empty()
    }

    /// Record an entry as leased.
    pub(crate) fn lease(&mut self, entry: &Entry<K, S>) {
        self.leased.insert(entry.id, entry.session.close_handle());
    }

    /// Remove an entry from the leased set, returning `false` if it was not leased.
    pub(crate) fn release(&mut self, id: Token) -> bool {
        self.leased.remove(&id).is_some()
    }

    /// Handles for closing every entry currently leased from this route.
    pub(crate) fn leased_handles(&self) -> impl Iterator<Item = CloseHandle> + '_ {
        self.leased.values().cloned()
    }

    pub(crate) fn connect(&mut self) {
        self.connecting += 1;
    }

    pub(crate) fn connected(&mut self) {
        self.connecting = self.connecting.saturating_sub(1);
    }

    /// Discard free entries which are closed, expired, or have been idle too long.
    pub(crate) fn sweep(
        &mut self,
        now: Instant,
        idle_timeout: Option<Duration>,
        discard: &mut Vec<Entry<K, S>>,
    ) {
        if self.free.is_empty() {
            return;
        }

        let (keep, stale): (VecDeque<_>, VecDeque<_>) = self.free.drain(..).partition(|entry| {
            entry.is_reusable(now) && idle_timeout.is_none_or(|timeout| entry.idle(now) <= timeout)
        });

        if !stale.is_empty() {
            trace!(route=?self.route, stale=stale.len(), "sweeping stale free entries");
        }

        self.free = keep;
        discard.extend(stale);
    }

    /// Take a free entry, preferring one carrying the requested affinity.
    pub(crate) fn take_free(
        &mut self,
        affinity: Option<&Affinity>,
        reuse: ReusePolicy,
    ) -> Option<Entry<K, S>> {
        if let Some(affinity) = affinity {
            if let Some(index) = self
                .free
                .iter()
                .position(|entry| entry.affinity.as_ref() == Some(affinity))
            {
                return self.free.remove(index);
            }
        }

        match reuse {
            ReusePolicy::Lifo => self.free.pop_front(),
            ReusePolicy::Fifo => self.free.pop_back(),
        }
    }

    /// Add a released entry to the free list, discarding the oldest entries beyond `max_idle`.
    pub(crate) fn push_free(
        &mut self,
        entry: Entry<K, S>,
        max_idle: usize,
        discard: &mut Vec<Entry<K, S>>,
    ) {
        self.free.push_front(entry);
        while self.free.len() > max_idle {
            match self.free.pop_back() {
                Some(oldest) => {
                    trace!(route=?self.route, id=?oldest.id, "free list full, discarding oldest entry");
                    discard.push(oldest);
                }
                None => break,
            }
        }
    }

    /// Remove every free entry, e.g. when the pool is closing.
    pub(crate) fn drain_free(&mut self, discard: &mut Vec<Entry<K, S>>) {
        discard.extend(self.free.drain(..));
    }

    /// Discard free entries idle for at least `idle`.
    pub(crate) fn close_idle(&mut self, now: Instant, idle: Duration, discard: &mut Vec<Entry<K, S>>) {
        let (keep, stale): (VecDeque<_>, VecDeque<_>) = self
            .free
            .drain(..)
            .partition(|entry| entry.idle(now) < idle);
        self.free = keep;
        discard.extend(stale);
    }

    /// Discard free entries past their time-to-live.
    pub(crate) fn close_expired(&mut self, now: Instant, discard: &mut Vec<Entry<K, S>>) {
        let (keep, stale): (VecDeque<_>, VecDeque<_>) = self
            .free
            .drain(..)
            .partition(|entry| !entry.is_expired(now));
        self.free = keep;
        discard.extend(stale);
    }

    /// Remove a queued request, returning `true` if it was still queued here.
    pub(crate) fn forget(&mut self, id: Token) -> bool {
        match self.pending.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn stats(&self, default_max: usize) -> PoolStats {
        PoolStats {
            leased: self.allocated(),
            pending: self
                .pending
                .iter()
                .filter(|waiter| !waiter.is_cancelled())
                .count(),
            available: self.free.len(),
            max: self.max(default_max),
        }
    }
}
