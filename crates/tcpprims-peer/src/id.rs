use std::fmt;

/// Transport-local identifier of one live connection.
///
/// Issued by a [`Registry`](crate::Registry); unique among the connections
/// that registry currently holds and meaningless outside it. Zero and
/// `u32::MAX` are never issued; the selector uses them as internal tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub(crate) fn new(raw: u32) -> Self {
        debug_assert!(!Self::is_reserved(raw), "connection id {raw} is reserved");
        Self(raw)
    }

    pub(crate) fn is_reserved(raw: u32) -> bool {
        raw == 0 || raw == u32::MAX
    }

    /// The raw integer value.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn token(self) -> mio::Token {
        mio::Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: mio::Token) -> Option<Self> {
        u32::try_from(token.0)
            .ok()
            .filter(|raw| !Self::is_reserved(*raw))
            .map(Self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
