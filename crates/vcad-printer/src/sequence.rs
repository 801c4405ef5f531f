//! Per-session request sequence numbers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues the `sequence_id` attached to every outbound request.
///
/// Owned by one session, so independent sessions never share a counter.
/// Wraps on overflow, which no session lives long enough to reach.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counter: AtomicU64,
}

impl SequenceAllocator {
    /// Start counting from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            counter: AtomicU64::new(first),
        }
    }

    /// Take the next id, rendered as the decimal string the wire expects.
    pub fn next(&self) -> String {
        self.counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero() {
        let seq = SequenceAllocator::new();
        assert_eq!(seq.next(), "0");
        assert_eq!(seq.next(), "1");
        assert_eq!(seq.peek(), 2);
    }

    #[test]
    fn test_starting_at_resumes_and_wraps() {
        let seq = SequenceAllocator::starting_at(u64::MAX);
        assert_eq!(seq.peek(), u64::MAX);
        assert_eq!(seq.next(), "18446744073709551615");
        assert_eq!(seq.next(), "0");
        assert_eq!(seq.next(), "1");
    }

    #[test]
    fn test_sessions_do_not_share_counters() {
        let a = SequenceAllocator::new();
        let b = SequenceAllocator::new();
        a.next();
        a.next();
        assert_eq!(b.next(), "0");
    }

    #[test]
    fn test_concurrent_ids_are_distinct() {
        let seq = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| seq.next().parse::<u64>().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // Each thread observes its own ids strictly increasing.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(seq.peek(), 4000);
    }
}
