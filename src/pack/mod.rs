//! Pack accounting: which pack is open and when to start the next one.

pub mod layout;

use crate::state::OpenPack;

pub use layout::{PackLayout, PackTarget};

/// Whether adding `incoming` bytes to a pack holding `current` bytes must
/// start a new pack first.
///
/// An empty pack never rolls over, so an item is always placed somewhere;
/// items larger than the ceiling itself are rejected before this is asked.
pub fn should_rollover(current: u64, incoming: u64, ceiling: u64) -> bool {
    current > 0 && current.saturating_add(incoming) > ceiling
}

/// In-memory mirror of the open pack, kept in step with the progress store.
#[derive(Debug, Clone)]
pub struct PackAccountant {
    ceiling: u64,
    open: OpenPack,
}

impl PackAccountant {
    pub fn new(ceiling: u64, open: OpenPack) -> Self {
        Self { ceiling, open }
    }

    pub fn open(&self) -> OpenPack {
        self.open
    }

    pub fn should_rollover(&self, incoming: u64) -> bool {
        should_rollover(self.open.size_bytes, incoming, self.ceiling)
    }

    /// An item this large could never be placed without overflowing a pack.
    pub fn exceeds_ceiling(&self, bytes: u64) -> bool {
        bytes > self.ceiling
    }

    /// Account for an item added to the open pack.
    pub fn record(&mut self, bytes: u64) {
        self.open.size_bytes += bytes;
    }

    /// Open the next pack and return its ordinal.
    pub fn advance(&mut self) -> u32 {
        self.open = OpenPack {
            ordinal: self.open.ordinal + 1,
            size_bytes: 0,
        };
        self.open.ordinal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_empty_pack_never_rolls_over() {
        assert!(!should_rollover(0, 5_000 * MIB, 1_024 * MIB));
    }

    #[test]
    fn test_rollover_boundary() {
        let ceiling = 1_024 * MIB;
        assert!(!should_rollover(1_000 * MIB, 24 * MIB, ceiling));
        assert!(should_rollover(1_000 * MIB, 24 * MIB + 1, ceiling));
    }

    #[test]
    fn test_overflowing_sum_rolls_over() {
        assert!(should_rollover(u64::MAX - 1, 10, u64::MAX));
    }

    #[test]
    fn test_accountant_tracks_open_pack() {
        let mut acct = PackAccountant::new(100, OpenPack::default());
        assert!(!acct.should_rollover(100));
        acct.record(60);
        assert!(acct.should_rollover(41));
        assert!(!acct.should_rollover(40));

        assert_eq!(acct.advance(), 2);
        assert_eq!(acct.open(), OpenPack { ordinal: 2, size_bytes: 0 });
        assert!(!acct.should_rollover(100));
    }

    #[test]
    fn test_exceeds_ceiling() {
        let acct = PackAccountant::new(100, OpenPack::default());
        assert!(!acct.exceeds_ceiling(100));
        assert!(acct.exceeds_ceiling(101));
    }
}
