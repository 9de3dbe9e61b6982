use std::sync::atomic::{AtomicI64, Ordering};

/// A signed counter whose every operation is a full barrier.
///
/// All operations use `SeqCst`, so no load or store around them may be
/// reordered across. Reference counts and dependency counts are built on it.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI64);

impl AtomicCounter {
    pub const fn new(value: i64) -> Self {
        Self(AtomicI64::new(value))
    }

    pub fn load(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i64) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Adds `delta` and returns the value before the update.
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::SeqCst)
    }

    /// Adds `delta` and returns the value after the update.
    pub fn add_and_fetch(&self, delta: i64) -> i64 {
        self.fetch_add(delta) + delta
    }

    /// Stores `new` if the current value equals `expected`. Always returns the
    /// value observed before the operation.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> i64 {
        match self
            .0
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    pub fn inc(&self) -> i64 {
        self.add_and_fetch(1)
    }

    pub fn dec(&self) -> i64 {
        self.add_and_fetch(-1)
    }

    /// Decrements and reports whether the new value is zero, so exactly one
    /// of several concurrent releasers observes `true`.
    pub fn dec_and_test(&self) -> bool {
        self.fetch_add(-1) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fetch_add_returns_previous() {
        let counter = AtomicCounter::new(5);
        assert_eq!(counter.fetch_add(3), 5);
        assert_eq!(counter.add_and_fetch(-2), 6);
        assert_eq!(counter.load(), 6);
    }

    #[test]
    fn test_compare_and_swap() {
        let counter = AtomicCounter::new(1);
        assert_eq!(counter.compare_and_swap(0, 9), 1);
        assert_eq!(counter.load(), 1);
        assert_eq!(counter.compare_and_swap(1, 9), 1);
        assert_eq!(counter.load(), 9);
    }

    #[test]
    fn test_dec_and_test_fires_once() {
        let counter = Arc::new(AtomicCounter::new(64));
        let hits = Arc::new(AtomicCounter::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                let hits = hits.clone();
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        if counter.dec_and_test() {
                            hits.inc();
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.load(), 0);
        assert_eq!(hits.load(), 1);
    }
}
