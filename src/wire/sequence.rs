use std::sync::atomic::{AtomicU16, Ordering};


/// Hands out the sequence numbers that correlate commands with their responses. One counter is
///  shared by all protocols of a session, and it wraps around silently: numbers only need to be
///  unique among the commands that are in flight at the same time.
pub struct SequenceCounter {
    next: AtomicU16,
}

impl SequenceCounter {
    pub const INITIAL: u16 = 0x1234;

    pub fn new() -> SequenceCounter {
        Self::starting_at(Self::INITIAL)
    }

    pub fn starting_at(initial: u16) -> SequenceCounter {
        SequenceCounter {
            next: AtomicU16::new(initial),
        }
    }

    pub fn next(&self) -> u16 {
        // fetch_add wraps on overflow
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        SequenceCounter::new()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use rustc_hash::FxHashSet;
    use super::*;

    #[test]
    fn test_monotonic() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0x1234);
        assert_eq!(counter.next(), 0x1235);
        assert_eq!(counter.next(), 0x1236);
    }

    #[test]
    fn test_wraps() {
        let counter = SequenceCounter::starting_at(u16::MAX);
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_concurrent_callers_get_distinct_numbers() {
        let counter = Arc::new(SequenceCounter::new());
        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = FxHashSet::default();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(all.insert(seq));
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
