//! Delivery scopes for group broadcasts.

use serde::{Deserialize, Serialize};

/// Which groups a broadcast reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only the router's own group.
    #[default]
    Local,
    /// The own group plus every related group.
    Extended,
    /// Related groups only.
    ExtendedOnly,
}

impl Scope {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Extended => 1,
            Self::ExtendedOnly => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Local),
            1 => Some(Self::Extended),
            2 => Some(Self::ExtendedOnly),
            _ => None,
        }
    }

    pub fn includes_local(self) -> bool {
        !matches!(self, Self::ExtendedOnly)
    }

    pub fn includes_related(self) -> bool {
        !matches!(self, Self::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_u8_mapping() {
        for scope in [Scope::Local, Scope::Extended, Scope::ExtendedOnly] {
            assert_eq!(Scope::from_u8(scope.as_u8()), Some(scope));
        }
        assert_eq!(Scope::from_u8(3), None);
    }

    #[test]
    fn test_scope_reach() {
        assert!(Scope::Local.includes_local());
        assert!(!Scope::Local.includes_related());
        assert!(Scope::Extended.includes_local() && Scope::Extended.includes_related());
        assert!(!Scope::ExtendedOnly.includes_local());
        assert!(Scope::ExtendedOnly.includes_related());
    }
}
