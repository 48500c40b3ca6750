use std::task::{Context, Poll};

use super::{Connect, Lease, Pool, Pooled, RouteKey, SessionOf};
use crate::error::LeaseError;

/// Leasing through `tower`: each call requests a session for the given route, bounded by
/// [`Config::lease_timeout`](super::Config::lease_timeout).
impl<K, C> tower::Service<K> for Pool<K, C>
where
    K: RouteKey,
    C: Connect<K>,
{
    type Response = Pooled<K, SessionOf<K, C>>;
    type Error = LeaseError;
    type Future = Lease<K, SessionOf<K, C>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            Poll::Ready(Err(LeaseError::Closed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, route: K) -> Self::Future {
        let timeout = self.inner.config.lease_timeout;
        self.lease(route, None, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use static_assertions::assert_impl_all;
    use tower::ServiceExt as _;

    use super::*;
    use crate::pool::Config;
    use crate::pool::mock::{MockConnector, MockSession};
    use crate::session::CloseMode;

    assert_impl_all!(Pool<String, MockConnector>: tower::Service<String>, Clone, Send, Sync);

    #[tokio::test]
    async fn lease_through_service() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = Pool::new(MockConnector::ready(), Config::default());
        let pooled: Pooled<&'static str, MockSession> =
            pool.clone().oneshot("service").await.unwrap();
        assert_eq!(*pooled.route(), "service");
        assert!(pooled.release(true));

        pool.close(CloseMode::Immediate);
        let err = pool.clone().ready().await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn service_uses_lease_timeout() {
        let config = Config::default()
            .with_max_total(1)
            .with_lease_timeout(Some(Duration::from_secs(1)));
        let pool = Pool::new(MockConnector::ready(), config);

        let held = pool.clone().oneshot("service").await.unwrap();
        let err = pool.clone().oneshot("service").await.unwrap_err();
        assert!(err.is_timeout());
        drop(held);
    }
}
