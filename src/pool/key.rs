use std::{
    fmt,
    hash::Hash,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Key which identifies a pooled destination, e.g. a scheme/host/port triple.
///
/// Entries are never shared between routes.
pub trait RouteKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> RouteKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Identifies a single pool entry or lease request within one pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroUsize);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out tokens, wrapping back to 1 rather than ever producing zero.
pub(crate) struct TokenCounter {
    counter: AtomicUsize,
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCounter")
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self {
            counter: AtomicUsize::new(1),
        }
    }
}

impl TokenCounter {
    pub(crate) fn next(&self) -> Token {
        loop {
            let value = self.counter.fetch_add(1, Ordering::Relaxed);
            if let Some(token) = NonZeroUsize::new(value) {
                return Token(token);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_key {

    use super::*;

    #[test]
    fn token_sequence() {
        let tokens = TokenCounter::default();
        let first = tokens.next();
        let second = tokens.next();
        assert_ne!(first, second);
        assert_eq!(format!("{first:?}"), "Token(1)");
        assert_eq!(second.to_string(), "2");
    }

    #[test]
    fn token_wrap() {
        let tokens = TokenCounter {
            counter: AtomicUsize::new(usize::MAX),
        };

        let last = tokens.next();
        assert_eq!(last.0, NonZeroUsize::new(usize::MAX).unwrap());

        let wrapped = tokens.next();
        assert_eq!(wrapped.0, NonZeroUsize::new(1).unwrap());
    }
}
