/// Why the relay itself closed a connection.
///
/// Handshake failures deliberately have no variant here: they close without
/// a code or reason so that probing peers learn nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection took over this role slot.
    Superseded,
    /// The role slot already had an occupant and the relay rejects newcomers.
    RoleOccupied,
    /// The session sat idle past the inactivity timeout.
    IdleTimeout,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Superseded => 4000,
            CloseReason::RoleOccupied => 4001,
            CloseReason::IdleTimeout => 4002,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::RoleOccupied => "role already occupied",
            CloseReason::IdleTimeout => "idle timeout",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(CloseReason::Superseded),
            4001 => Some(CloseReason::RoleOccupied),
            4002 => Some(CloseReason::IdleTimeout),
            _ => None,
        }
    }
}
