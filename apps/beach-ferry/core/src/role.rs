use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The two seats in a ferry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Controlled endpoint: sends screen frames, receives control events.
    Client,
    /// Controller: sends control events, receives screen frames.
    Helper,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Client, Role::Helper];

    /// The role sitting across from this one.
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Helper,
            Role::Helper => Role::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Helper => "helper",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    /// Matching is exact: `"Client"` or `" helper"` are not roles.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "client" => Ok(Role::Client),
            "helper" => Ok(Role::Helper),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_is_an_involution() {
        for role in Role::ALL {
            assert_ne!(role.peer(), role);
            assert_eq!(role.peer().peer(), role);
        }
    }

    #[test]
    fn parsing_is_case_sensitive() {
        assert_eq!("client".parse::<Role>(), Ok(Role::Client));
        assert_eq!("helper".parse::<Role>(), Ok(Role::Helper));
        assert!("Helper".parse::<Role>().is_err());
        assert!("client ".parse::<Role>().is_err());
        assert!("viewer".parse::<Role>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&Role::Helper).unwrap(), "\"helper\"");
        let role: Role = serde_json::from_str("\"client\"").unwrap();
        assert_eq!(role, Role::Client);
    }
}
