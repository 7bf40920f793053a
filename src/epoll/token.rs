/// Identifies a registration with a [`Epoll`](super::Epoll) instance.
///
/// A `Token` is opaque to the poller; it is handed back unchanged in the
/// `Event` for whichever readiness fired. The reactor layer above uses it as
/// the key into its own `Channel` registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
