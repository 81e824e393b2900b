use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    sense: bool,
}

/// A reusable synchronization barrier that puts threads to sleep.
///
/// Used to line up collector threads between stop-the-world phases.
#[derive(Debug, Default)]
pub struct SenseBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `participants` threads have called this function.
    /// Returns `true` on exactly one of them, the last to arrive.
    pub fn wait(&self, participants: usize) -> bool {
        let mut state = self.state.lock();
        let my_sense = state.sense;
        state.arrived += 1;

        if state.arrived == participants {
            // LAST
            state.arrived = 0;
            state.sense = !my_sense;
            self.cvar.notify_all();
            true
        } else {
            // FOLLOWER
            while state.sense == my_sense {
                self.cvar.wait(&mut state);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    #[test]
    fn single_participant_passes() {
        let barrier = SenseBarrier::new();
        assert!(barrier.wait(1));
        assert!(barrier.wait(1));
    }

    #[test]
    fn one_leader_per_round_and_no_overtaking() {
        let threads = 6;
        let rounds = 50;
        let barrier = Arc::new(SenseBarrier::new());
        let leaders = Arc::new(AtomicUsize::new(0));
        let arrivals = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let barrier = barrier.clone();
                let leaders = leaders.clone();
                let arrivals = arrivals.clone();
                thread::spawn(move || {
                    for round in 0..rounds {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait(threads) {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(
                            arrivals.load(Ordering::SeqCst) >= (round + 1) * threads,
                            "thread passed the barrier early"
                        );
                        barrier.wait(threads);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("participant panicked");
        }
        assert_eq!(leaders.load(Ordering::SeqCst), rounds);
    }
}
