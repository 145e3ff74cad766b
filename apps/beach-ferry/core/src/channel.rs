use sha2::{Digest, Sha256};

use crate::role::Role;

const CHANNEL_PREFIX: &str = "ferry";
const FINGERPRINT_LEN: usize = 12;

/// Pub/sub addresses for one session.
///
/// Each role publishes on its own `from-<role>` channel and subscribes to the
/// peer's, so a connection never hears its own traffic echoed back. Any relay
/// process can derive the pair from the token alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPair {
    pub from_client: String,
    pub from_helper: String,
}

impl ChannelPair {
    pub fn for_session(token: &str) -> Self {
        Self {
            from_client: format!("{CHANNEL_PREFIX}:{token}:from-client"),
            from_helper: format!("{CHANNEL_PREFIX}:{token}:from-helper"),
        }
    }

    /// Where `role` publishes what it receives from its socket.
    pub fn outbound(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.from_client,
            Role::Helper => &self.from_helper,
        }
    }

    /// Where `role` listens for traffic from its peer.
    pub fn inbound(&self, role: Role) -> &str {
        self.outbound(role.peer())
    }
}

/// Short, stable, non-reversible label for a session token, safe to log.
pub fn session_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = format!("{:x}", digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}
