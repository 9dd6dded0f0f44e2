//! Round-robin batch arithmetic
//!
//! Kept free of I/O so the fairness bound can be checked exhaustively.

/// Accounts to sync on one tick and where the next tick starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Indices into the ordered account list, deduplicated, in visiting order
    pub indices: Vec<usize>,
    /// Cursor for the next tick: `(offset + batch_size) % total`
    pub next_cursor: usize,
    /// True when this batch reached or passed the end of the list
    pub completes_round: bool,
}

/// Plan a batch of `batch_size` accounts out of `total`, starting at `cursor`
///
/// Returns `None` for an empty group. The cursor advances by the configured
/// batch size even when fewer unique accounts were selected, so rotation
/// stays monotonic when the batch is larger than the group.
pub fn plan_batch(cursor: usize, batch_size: usize, total: usize) -> Option<BatchPlan> {
    if total == 0 {
        return None;
    }
    let batch_size = batch_size.max(1);
    let offset = cursor % total;

    let mut indices = Vec::with_capacity(batch_size.min(total));
    for step in 0..batch_size {
        let index = (offset + step) % total;
        if indices.contains(&index) {
            break;
        }
        indices.push(index);
    }

    Some(BatchPlan {
        indices,
        next_cursor: (offset + batch_size) % total,
        completes_round: offset + batch_size >= total,
    })
}

/// Number of ticks needed to visit every account once
pub fn ticks_per_round(total: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (total + batch_size - 1) / batch_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_five_accounts_batch_of_two_wraps() {
        let first = plan_batch(0, 2, 5).unwrap();
        assert_eq!(first.indices, vec![0, 1]);
        assert_eq!(first.next_cursor, 2);
        assert!(!first.completes_round);

        let second = plan_batch(first.next_cursor, 2, 5).unwrap();
        assert_eq!(second.indices, vec![2, 3]);
        assert_eq!(second.next_cursor, 4);

        let third = plan_batch(second.next_cursor, 2, 5).unwrap();
        assert_eq!(third.indices, vec![4, 0]);
        assert_eq!(third.next_cursor, 1);
        assert!(third.completes_round);
    }

    #[test]
    fn test_empty_group_is_a_noop() {
        assert_eq!(plan_batch(3, 2, 0), None);
    }

    #[test]
    fn test_batch_larger_than_group_is_deduplicated() {
        let plan = plan_batch(1, 5, 3).unwrap();
        assert_eq!(plan.indices, vec![1, 2, 0]);
        // advance by the batch size, not by the 3 unique picks
        assert_eq!(plan.next_cursor, (1 + 5) % 3);
        assert!(plan.completes_round);
    }

    #[test]
    fn test_stale_cursor_after_shrink_is_reduced() {
        // group shrank from 10 to 4 accounts since the cursor was stored
        let plan = plan_batch(9, 2, 4).unwrap();
        assert_eq!(plan.indices, vec![1, 2]);
        assert_eq!(plan.next_cursor, 3);
    }

    #[test]
    fn test_ticks_per_round() {
        assert_eq!(ticks_per_round(5, 2), 3);
        assert_eq!(ticks_per_round(4, 2), 2);
        assert_eq!(ticks_per_round(1, 10), 1);
        assert_eq!(ticks_per_round(0, 3), 0);
    }

    proptest! {
        #[test]
        fn prop_selection_counts_differ_by_at_most_one(
            total in 1usize..40,
            batch in 1usize..40,
            ticks in 1usize..120,
        ) {
            prop_assume!(batch <= total);
            let mut counts = vec![0usize; total];
            let mut cursor = 0;
            for _ in 0..ticks {
                let plan = plan_batch(cursor, batch, total).unwrap();
                for index in &plan.indices {
                    counts[*index] += 1;
                }
                cursor = plan.next_cursor;
            }
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn prop_k_rotations_visit_everyone(
            total in 1usize..40,
            batch in 1usize..60,
            rotations in 1usize..5,
        ) {
            let mut counts = vec![0usize; total];
            let mut cursor = 0;
            for _ in 0..ticks_per_round(total, batch) * rotations {
                let plan = plan_batch(cursor, batch, total).unwrap();
                prop_assert!(plan.indices.len() <= total);
                for index in &plan.indices {
                    counts[*index] += 1;
                }
                cursor = plan.next_cursor;
            }
            for count in counts {
                prop_assert!(count >= rotations);
            }
        }
    }
}
