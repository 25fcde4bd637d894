//! Deadline/timeout helper built on `tokio::time`, used for the election
//! timer, the heartbeat ticker, and per-round vote deadlines.

use std::time::Duration;

use rand::Rng;

use tokio::time::{self, Instant, Sleep};

/// A restartable countdown. `kickoff` (re)arms it for a duration; `sleep()`
/// returns a future that resolves when the countdown fires. Re-arming while
/// a previous sleep is outstanding simply replaces the deadline — callers
/// poll `sleep()` in a `tokio::select!` loop and call `kickoff` again after
/// each fire or each externally-observed reset event (e.g. a heartbeat).
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Timer { deadline: None }
    }

    /// Arms the timer to fire after `dur` from now.
    pub fn kickoff(&mut self, dur: Duration) {
        self.deadline = Some(Instant::now() + dur);
    }

    /// Arms the timer to fire after a uniformly random duration in
    /// `[lo, hi)`. Used for the randomized election timeout.
    pub fn kickoff_rand(&mut self, lo: Duration, hi: Duration) {
        let lo_ns = lo.as_nanos() as u64;
        let hi_ns = hi.as_nanos().max(lo.as_nanos() + 1) as u64;
        let dur = Duration::from_nanos(rand::thread_rng().gen_range(lo_ns..hi_ns));
        self.kickoff(dur);
    }

    /// Disarms the timer; `sleep()` will never resolve until `kickoff`
    /// is called again.
    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Returns a future resolving at the current deadline, or one that
    /// never resolves if the timer is disarmed. Must be re-polled from a
    /// fresh call after each fire (tokio `Sleep` is one-shot).
    pub fn sleep(&self) -> TimerSleep {
        match self.deadline {
            Some(d) => TimerSleep::Armed(Box::pin(time::sleep_until(d))),
            None => TimerSleep::Disarmed,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub enum TimerSleep {
    Armed(std::pin::Pin<Box<Sleep>>),
    Disarmed,
}

impl std::future::Future for TimerSleep {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        match self.get_mut() {
            TimerSleep::Armed(sleep) => sleep.as_mut().poll(cx),
            TimerSleep::Disarmed => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_duration() {
        let mut t = Timer::new();
        t.kickoff(Duration::from_millis(10));
        let start = Instant::now();
        t.sleep().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn rand_kickoff_within_bounds() {
        let mut t = Timer::new();
        let lo = Duration::from_millis(5);
        let hi = Duration::from_millis(15);
        t.kickoff_rand(lo, hi);
        let start = Instant::now();
        t.sleep().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= lo && elapsed < hi + Duration::from_millis(5));
    }
}
