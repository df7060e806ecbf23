//! Key naming and serial assignment.

use serde::{Deserialize, Serialize};

/// How serials are handed out over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Serials rotate through `[0, pool_size)`.
    Cyclic {
        /// Number of distinct keys.
        pool_size: u64,
    },
    /// Every serial is used once per run.
    Unique,
}

/// Hands out key serials according to a [`KeyPolicy`].
#[derive(Debug, Clone)]
pub struct KeyAllocator {
    prefix: String,
    policy: KeyPolicy,
    next: u64,
}

impl KeyAllocator {
    /// Creates an allocator starting at serial 0.
    #[must_use]
    pub fn new(prefix: impl Into<String>, policy: KeyPolicy) -> Self {
        Self {
            prefix: prefix.into(),
            policy,
            next: 0,
        }
    }

    /// Returns the next serial and advances.
    pub fn next_serial(&mut self) -> u64 {
        let serial = self.next;
        self.next = match self.policy {
            KeyPolicy::Cyclic { pool_size } => (serial + 1) % pool_size.max(1),
            KeyPolicy::Unique => serial + 1,
        };
        serial
    }

    /// Renders the key for a serial.
    #[must_use]
    pub fn key_for(&self, serial: u64) -> String {
        format!("{}{serial}", self.prefix)
    }

    /// Returns the next serial together with its key.
    pub fn next_key(&mut self) -> (u64, String) {
        let serial = self.next_serial();
        (serial, self.key_for(serial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_wraps() {
        let mut keys = KeyAllocator::new("key:", KeyPolicy::Cyclic { pool_size: 3 });
        let serials: Vec<_> = (0..7).map(|_| keys.next_serial()).collect();
        assert_eq!(serials, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_unique_never_repeats() {
        let mut keys = KeyAllocator::new("key:", KeyPolicy::Unique);
        let serials: Vec<_> = (0..5).map(|_| keys.next_serial()).collect();
        assert_eq!(serials, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_key_format() {
        let mut keys = KeyAllocator::new("key:", KeyPolicy::Unique);
        keys.next_serial();
        assert_eq!(keys.next_key(), (1, "key:1".to_string()));
        assert_eq!(keys.key_for(17), "key:17");
    }
}
