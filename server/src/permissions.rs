//! Permission bits gating remote commands.

use serde::{Deserialize, Serialize};

/// Bitset of command permissions held by a client.
///
/// Unauthorized command attempts are logged and silently dropped, so the
/// bit layout never leaks to clients beyond their own value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientPermissions(u16);

impl ClientPermissions {
    pub const NONE: Self = Self(0);
    pub const KICK: Self = Self(1);
    pub const BAN: Self = Self(1 << 1);
    pub const END_ROUND: Self = Self(1 << 2);
    pub const SELECT_SUB: Self = Self(1 << 3);
    pub const SELECT_MODE: Self = Self(1 << 4);
    pub const MANAGE_CAMPAIGN: Self = Self(1 << 5);
    pub const ALL: Self = Self(0b11_1111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let mut perms = ClientPermissions::NONE;
        assert!(!perms.contains(ClientPermissions::KICK));

        perms.insert(ClientPermissions::KICK);
        perms.insert(ClientPermissions::END_ROUND);
        assert!(perms.contains(ClientPermissions::KICK));
        assert!(perms.contains(ClientPermissions::END_ROUND));
        assert!(!perms.contains(ClientPermissions::BAN));

        perms.remove(ClientPermissions::KICK);
        assert!(!perms.contains(ClientPermissions::KICK));
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        let perms = ClientPermissions::from_bits(0xffff);
        assert_eq!(perms, ClientPermissions::ALL);
    }
}
