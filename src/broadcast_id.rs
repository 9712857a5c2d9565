//! The `broadcast_id` module defines the opaque identifier a broadcast is
//! published under. Ids are random 32-byte values, so a handle shipped to a
//! worker carries everything needed to locate the value and collisions are
//! not a practical concern.

use rand::Rng;
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BroadcastId([u8; 32]);

impl BroadcastId {
    pub fn new_rand() -> Self {
        BroadcastId(rand::thread_rng().gen())
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use crate::broadcast_id::BroadcastId;
    use std::collections::HashSet;

    #[test]
    fn test_new_rand_unique() {
        let ids: HashSet<_> = (0..100).map(|_| BroadcastId::new_rand()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_display_nonempty() {
        let id = BroadcastId::new_rand();
        assert!(!id.to_string().is_empty());
        assert_eq!(format!("{}", id), format!("{:?}", id));
    }
}
