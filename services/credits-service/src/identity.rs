//! Identities that credit balances are metered against.
//!
//! An [`Identity`] is both the principal and the storage key: anonymous
//! visitors are keyed by public IP address, authenticated accounts by user id.
//! The two key spaces never overlap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Account identifier issued by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a provider user id.
    ///
    /// Returns `None` for blank ids.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Principal against which usage is metered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// Visitor without an account, keyed by public IP address.
    Anonymous {
        /// Public IP address of the visitor.
        ip: IpAddr,
    },
    /// Signed-in account, keyed by user id.
    Authenticated {
        /// Account id.
        user_id: UserId,
    },
}

impl Identity {
    /// Anonymous identity for an IP address.
    #[must_use]
    pub const fn anonymous(ip: IpAddr) -> Self {
        Self::Anonymous { ip }
    }

    /// Authenticated identity for a user id.
    #[must_use]
    pub const fn authenticated(user_id: UserId) -> Self {
        Self::Authenticated { user_id }
    }

    /// Whether this identity belongs to a signed-in account.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous { ip } => write!(f, "anonymous:{ip}"),
            Self::Authenticated { user_id } => write!(f, "user:{user_id}"),
        }
    }
}

/// A change of identity within a browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityTransition {
    /// The session signed in as `user_id`.
    SignedIn {
        /// Account that signed in.
        user_id: UserId,
    },
    /// The session signed out and is anonymous again at `ip`.
    SignedOut {
        /// Public IP address the session falls back to.
        ip: IpAddr,
    },
}

impl IdentityTransition {
    /// Identity that is active after the transition.
    #[must_use]
    pub fn target(&self) -> Identity {
        match self {
            Self::SignedIn { user_id } => Identity::authenticated(user_id.clone()),
            Self::SignedOut { ip } => Identity::anonymous(*ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_blank_user_id_rejected() {
        assert!(UserId::new("").is_none());
        assert!(UserId::new("   ").is_none());
        assert_eq!(UserId::new("u-1").unwrap().as_str(), "u-1");
    }

    #[test]
    fn test_identity_serialization_is_tagged() {
        let anon = Identity::anonymous(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        let json = serde_json::to_value(&anon).unwrap();
        assert_eq!(json["kind"], "anonymous");
        assert_eq!(json["ip"], "203.0.113.7");

        let user = Identity::authenticated(UserId::new("abc").unwrap());
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["kind"], "authenticated");
        assert_eq!(json["user_id"], "abc");
    }

    #[test]
    fn test_transition_target() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let user_id = UserId::new("abc").unwrap();

        let signed_in = IdentityTransition::SignedIn {
            user_id: user_id.clone(),
        };
        assert_eq!(signed_in.target(), Identity::authenticated(user_id));
        assert!(signed_in.target().is_authenticated());

        let signed_out = IdentityTransition::SignedOut { ip };
        assert_eq!(signed_out.target(), Identity::anonymous(ip));
    }

    #[test]
    fn test_display() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(Identity::anonymous(ip).to_string(), "anonymous:127.0.0.1");
        let user = Identity::authenticated(UserId::new("abc").unwrap());
        assert_eq!(user.to_string(), "user:abc");
    }
}
