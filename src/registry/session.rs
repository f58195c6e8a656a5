//! Logical sessions. A session key is minted at registration and lets a
//! client reclaim its role and identity across transport drops.

use std::time::Instant;
use uuid::Uuid;

/// Cohort a connection belongs to after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Driver,
    User,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "driver" => Some(Self::Driver),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Account bound to the session. A driver session may start without
    /// one; identity then binds on the first update that carries it.
    pub account_id: Option<String>,
    pub role: Role,
    pub created_at: Instant,
    pub last_activity_at: Instant,
}

impl SessionRecord {
    pub fn new(role: Role, account_id: Option<String>, now: Instant) -> Self {
        Self {
            account_id,
            role,
            created_at: now,
            last_activity_at: now,
        }
    }
}

/// Mint a fresh session key. Unique per live session.
pub fn mint_session_key() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_rejects_unknown() {
        assert_eq!(Role::parse("driver"), Some(Role::Driver));
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("admin"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn minted_keys_are_unique() {
        assert_ne!(mint_session_key(), mint_session_key());
    }
}
