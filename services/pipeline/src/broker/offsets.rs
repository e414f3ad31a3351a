//! Commit bookkeeping for one partition of a log.
//!
//! A log consumer can hold several deliveries from the same partition, and
//! committing an offset resolves every offset below it. The commit position
//! therefore stops at the lowest delivery that is still unresolved, even
//! when later ones have been acknowledged.

use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub(crate) struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    highest_acked: Option<i64>,
    /// Everything below this is resolved; starts at the first delivery
    position: Option<i64>,
}

impl PartitionProgress {
    /// Record a delivery handed to the caller. Redelivery of an offset
    /// already in flight is a no-op.
    pub(crate) fn delivered(&mut self, offset: i64) {
        self.position.get_or_insert(offset);
        self.in_flight.insert(offset);
    }

    /// Resolve `offset` and return the position to commit when it advances.
    /// Offsets this session never delivered are ignored.
    pub(crate) fn acknowledged(&mut self, offset: i64) -> Option<i64> {
        if !self.in_flight.remove(&offset) {
            return None;
        }
        let highest = self.highest_acked.map_or(offset, |h| h.max(offset));
        self.highest_acked = Some(highest);

        let target = match self.in_flight.iter().next() {
            Some(&lowest) => lowest.min(highest + 1),
            None => highest + 1,
        };

        match self.position {
            Some(done) if done >= target => None,
            _ => Some(target),
        }
    }

    /// The broker accepted a commit at `position`
    pub(crate) fn committed(&mut self, position: i64) {
        self.position = Some(self.position.map_or(position, |p| p.max(position)));
    }

    /// Deliveries not acknowledged yet
    pub(crate) fn unresolved(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget everything; the partition restarts from its committed offset
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(progress: &mut PartitionProgress, offset: i64) -> Option<i64> {
        let position = progress.acknowledged(offset)?;
        progress.committed(position);
        Some(position)
    }

    #[test]
    fn test_in_order_acks_commit_next_offset() {
        let mut progress = PartitionProgress::default();
        progress.delivered(0);
        assert_eq!(commit(&mut progress, 0), Some(1));
        progress.delivered(1);
        assert_eq!(commit(&mut progress, 1), Some(2));
    }

    #[test]
    fn test_later_ack_waits_for_earlier_offset() {
        let mut progress = PartitionProgress::default();
        progress.delivered(0);
        progress.delivered(1);
        progress.delivered(2);

        assert_eq!(commit(&mut progress, 2), None);
        assert_eq!(commit(&mut progress, 1), None);
        assert_eq!(progress.unresolved(), 1);
        assert_eq!(commit(&mut progress, 0), Some(3));
    }

    #[test]
    fn test_gaps_between_offsets_do_not_stall() {
        let mut progress = PartitionProgress::default();
        progress.delivered(10);
        progress.delivered(14);
        assert_eq!(commit(&mut progress, 10), Some(14));
        assert_eq!(commit(&mut progress, 14), Some(15));
    }

    #[test]
    fn test_unknown_offset_is_ignored() {
        let mut progress = PartitionProgress::default();
        progress.delivered(3);
        assert_eq!(progress.acknowledged(7), None);
        assert_eq!(progress.unresolved(), 1);
    }

    #[test]
    fn test_position_never_moves_backwards() {
        let mut progress = PartitionProgress::default();
        progress.delivered(5);
        assert_eq!(commit(&mut progress, 5), Some(6));

        // Redelivered after a rewind, then acknowledged again.
        progress.delivered(5);
        assert_eq!(commit(&mut progress, 5), None);
    }
}
