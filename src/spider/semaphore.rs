use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{Condvar, Mutex};
use super::QUEUE_SLEEP;

/// Counting semaphore able to move n tokens at a time, created empty.
/// Every acquire polls a termination flag on a bounded interval so a
/// stalled rendezvous cannot survive shutdown.
pub struct SemaphoreN {
    count: Mutex<usize>,
    cond:  Condvar,
}

impl SemaphoreN {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond:  Condvar::new(),
        }
    }

    pub fn release(&self) {
        self.release_n(1);
    }

    pub fn release_n(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        self.cond.notify_all();
    }

    /// Take one token. Returns false if `running` was cleared while
    /// waiting.
    pub fn acquire(&self, running: &AtomicBool) -> bool {
        self.acquire_n(1, running)
    }

    /// Take n tokens, possibly over several wakeups.
    pub fn acquire_n(&self, n: usize, running: &AtomicBool) -> bool {
        let mut taken = 0;
        let mut count = self.count.lock();

        while taken < n {
            if *count > 0 {
                let take = (*count).min(n - taken);
                *count -= take;
                taken += take;
                continue;
            }

            self.cond.wait_for(&mut count, QUEUE_SLEEP);

            if !running.load(Ordering::Acquire) {
                *count += taken;
                self.cond.notify_all();
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use super::*;

    #[test]
    fn tokens_move_in_batches() {
        let sem = Arc::new(SemaphoreN::new());
        let run = Arc::new(AtomicBool::new(true));

        let threads: Vec<_> = (0..4).map(|_| {
            let sem = sem.clone();
            let run = run.clone();
            thread::spawn(move || sem.acquire(&run))
        }).collect();

        sem.release_n(4);

        for t in threads {
            assert!(t.join().unwrap());
        }
    }

    #[test]
    fn acquire_interrupted_by_flag() {
        let sem = Arc::new(SemaphoreN::new());
        let run = Arc::new(AtomicBool::new(true));

        let t = {
            let sem = sem.clone();
            let run = run.clone();
            thread::spawn(move || sem.acquire_n(2, &run))
        };

        run.store(false, Ordering::Release);

        assert!(!t.join().unwrap());
    }
}
