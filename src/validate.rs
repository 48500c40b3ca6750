//! Validators probe idle sessions before they are handed out again.
//!
//! Validation only happens for free sessions which have been idle for at least the pool's
//! validate-after-inactivity threshold. A validator that reports `Ok(false)` or fails causes the
//! session to be discarded; the caller never sees either outcome.

use std::future::Future;

use crate::BoxError;
use crate::BoxFuture;

/// A session validator.
///
/// The probe is started synchronously with a borrow of the session and must return a future
/// which does not borrow it, so that protocols can issue a lightweight ping on a cloned handle
/// (or simply inspect local state) and report back later.
pub trait Validate<S>: Send + Sync + 'static {
    /// Probe the session, resolving to `true` when it may be reused.
    fn probe(&self, session: &S) -> BoxFuture<'static, Result<bool, BoxError>>;
}

impl<S, F, Fut> Validate<S> for F
where
    F: Fn(&S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
{
    fn probe(&self, session: &S) -> BoxFuture<'static, Result<bool, BoxError>> {
        Box::pin((self)(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(bool);

    #[tokio::test]
    async fn closure_validator() {
        let validator = |probe: &Probe| {
            let open = probe.0;
            async move { Ok::<_, BoxError>(open) }
        };

        assert!(validator.probe(&Probe(true)).await.unwrap());
        assert!(!validator.probe(&Probe(false)).await.unwrap());
    }

    #[tokio::test]
    async fn failing_validator() {
        let validator = |_: &Probe| async move { Err::<bool, BoxError>("ping failed".into()) };
        let err = validator.probe(&Probe(true)).await.unwrap_err();
        assert_eq!(err.to_string(), "ping failed");
    }
}
