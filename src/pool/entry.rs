use std::fmt;
use std::future::IntoFuture as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::Recycle;
use super::RouteKey;
use super::Token;
use super::lock::WeakOpt;
use crate::notify;
use crate::notify::Notified;
use crate::session::{CloseMode, Session};

/// Opaque state tag used to prefer free entries established for the same caller state,
/// e.g. the principal a TLS client certificate was presented for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Affinity(Arc<str>);

impl Affinity {
    /// Create a new affinity tag.
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Affinity(tag.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Affinity {
    fn from(tag: &str) -> Self {
        Affinity::new(tag)
    }
}

impl From<String> for Affinity {
    fn from(tag: String) -> Self {
        Affinity::new(tag)
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical session plus the bookkeeping the pool keeps for it.
pub(crate) struct Entry<K, S> {
    pub(crate) id: Token,
    pub(crate) route: K,
    pub(crate) session: S,
    pub(crate) created: Instant,
    pub(crate) updated: Instant,
    pub(crate) expiry: Option<Instant>,
    pub(crate) affinity: Option<Affinity>,
    pub(crate) leases: usize,
}

impl<K: fmt::Debug, S> fmt::Debug for Entry<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("affinity", &self.affinity)
            .field("leases", &self.leases)
            .finish()
    }
}

impl<K, S> Entry<K, S>
where
    S: Session,
{
    pub(crate) fn new(
        id: Token,
        route: K,
        session: S,
        now: Instant,
        time_to_live: Option<Duration>,
        affinity: Option<Affinity>,
    ) -> Self {
        Self {
            id,
            route,
            session,
            created: now,
            updated: now,
            expiry: time_to_live.and_then(|ttl| now.checked_add(ttl)),
            affinity,
            leases: 0,
        }
    }

    /// The later of the last release and the session's own last activity.
    pub(crate) fn last_used(&self) -> Instant {
        match self.session.last_activity() {
            Some(activity) if activity > self.updated => activity,
            _ => self.updated,
        }
    }

    pub(crate) fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }

    pub(crate) fn is_reusable(&self, now: Instant) -> bool {
        self.session.is_open() && !self.is_expired(now)
    }

    pub(crate) fn close(&mut self, mode: CloseMode) {
        self.session.close(mode);
    }
}

/// Wrapper type for a session leased from a pool.
///
/// The caller owns the session exclusively until it is released. The underlying session is
/// available via `Deref` and `DerefMut`. Dropping a `Pooled` session releases it, and it is
/// kept for reuse only if the session still reports itself open.
pub struct Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    entry: Option<Entry<K, S>>,
    pool: WeakOpt<dyn Recycle<K, S>>,
    closing: notify::Receiver,
}

impl<K, S> Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    pub(crate) fn new(
        entry: Entry<K, S>,
        pool: WeakOpt<dyn Recycle<K, S>>,
        closing: notify::Receiver,
    ) -> Self {
        Self {
            entry: Some(entry),
            pool,
            closing,
        }
    }

    fn entry(&self) -> &Entry<K, S> {
        self.entry.as_ref().expect("entry only taken on release")
    }

    /// The route this session was leased for.
    pub fn route(&self) -> &K {
        &self.entry().route
    }

    /// The pool's identifier for this entry.
    pub fn id(&self) -> Token {
        self.entry().id
    }

    /// When the session was established.
    pub fn created(&self) -> Instant {
        self.entry().created
    }

    /// The affinity tag carried by this entry.
    pub fn affinity(&self) -> Option<&Affinity> {
        self.entry().affinity.as_ref()
    }

    /// Replace the affinity tag, so that future lease requests carrying the same tag
    /// prefer this entry.
    pub fn set_affinity(&mut self, affinity: Option<Affinity>) {
        if let Some(entry) = self.entry.as_mut() {
            entry.affinity = affinity;
        }
    }

    /// Checks if this session has been leased before, i.e. it was reused from the free list.
    pub fn is_reused(&self) -> bool {
        self.entry().leases > 1
    }

    /// The mode the pool was closed with, if it has been closed.
    pub fn close_mode(&self) -> Option<CloseMode> {
        self.closing.mode()
    }

    /// A future which resolves when the pool closes, with the requested close mode.
    ///
    /// Protocol layers can race in-flight exchanges against this to honor
    /// [`CloseMode::Immediate`] shutdowns promptly.
    pub fn closing(&self) -> Notified {
        self.closing.clone().into_future()
    }

    /// Return the session to the pool.
    ///
    /// When `reusable` is `true` and the session is still open (and not expired), the session
    /// is kept for reuse. Otherwise it is closed. Returns `false` if the pool no longer knew
    /// about this entry, e.g. because the pool was dropped.
    pub fn release(mut self, reusable: bool) -> bool {
        match self.entry.take() {
            Some(entry) => recycle(&self.pool, entry, reusable),
            None => false,
        }
    }
}

fn recycle<K, S>(pool: &WeakOpt<dyn Recycle<K, S>>, mut entry: Entry<K, S>, reusable: bool) -> bool
where
    K: RouteKey,
    S: Session,
{
    match pool.upgrade() {
        Some(pool) => pool.recycle(entry, reusable),
        None => {
            tracing::trace!(id=?entry.id, "pool dropped, closing released session");
            entry.close(CloseMode::Immediate);
            false
        }
    }
}

impl<K, S> fmt::Debug for Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.entry).finish()
    }
}

impl<K, S> Deref for Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.entry().session
    }
}

impl<K, S> DerefMut for Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .entry
            .as_mut()
            .expect("entry only taken on release")
            .session
    }
}

impl<K, S> Drop for Pooled<K, S>
where
    K: RouteKey,
    S: Session,
{
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let reusable = entry.session.is_open();
            recycle(&self.pool, entry, reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pool::key::TokenCounter;
    use crate::pool::mock::MockSession;

    fn entry(ttl: Option<Duration>) -> Entry<&'static str, MockSession> {
        let tokens = TokenCounter::default();
        Entry::new(
            tokens.next(),
            "route",
            MockSession::new(),
            Instant::now(),
            ttl,
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn expiry() {
        let entry = entry(Some(Duration::from_secs(5)));
        assert!(entry.is_reusable(Instant::now()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(entry.is_expired(Instant::now()));
        assert!(!entry.is_reusable(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_uses_last_activity() {
        let entry = entry(None);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(entry.idle(Instant::now()), Duration::from_secs(10));

        entry.session.touch();
        assert_eq!(entry.idle(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn closed_session_not_reusable() {
        let mut entry = entry(None);
        let handle = entry.session.handle();
        entry.close(CloseMode::Graceful);

        assert!(!entry.is_reusable(Instant::now()));
        assert_eq!(handle.closed_with(), Some(CloseMode::Graceful));
    }

    #[tokio::test]
    async fn detached_pooled_closes_on_release() {
        let entry = entry(None);
        let handle = entry.session.handle();
        let pooled = Pooled::new(entry, WeakOpt::none(), notify::channel().subscribe());

        assert_eq!(pooled.close_mode(), None);
        assert!(!pooled.release(true));
        assert_eq!(handle.closed_with(), Some(CloseMode::Immediate));
    }

    #[test]
    fn affinity() {
        let tag = Affinity::from("alice");
        assert_eq!(tag, Affinity::new(String::from("alice")));
        assert_eq!(tag.as_str(), "alice");
        assert_eq!(tag.to_string(), "alice");
    }
}
