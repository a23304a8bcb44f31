//! Fixed-capacity moving-average window of probe outcomes.

use std::time::Duration;

/// Ring buffer of the last `capacity` probe rounds for one path.
///
/// Each slot holds the round's latency (`Duration::ZERO` when no reply
/// arrived) and a binary loss indicator. The capacity is fixed at
/// construction; once full, every new round overwrites the oldest slot.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    latency: Box<[Duration]>,
    lost: Box<[bool]>,
    /// Slot the next round is written to.
    next: usize,
    /// Rounds recorded since creation or the last reset.
    recorded: u64,
}

impl SampleWindow {
    /// Create an empty window. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            latency: vec![Duration::ZERO; capacity].into_boxed_slice(),
            lost: vec![false; capacity].into_boxed_slice(),
            next: 0,
            recorded: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.latency.len()
    }

    /// Number of slots written so far (saturates at capacity).
    pub fn len(&self) -> usize {
        (self.recorded.min(self.capacity() as u64)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    /// Total rounds recorded.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Record one probe round.
    pub fn record(&mut self, latency: Duration, loss_hit: bool) {
        self.latency[self.next] = latency;
        self.lost[self.next] = loss_hit;
        self.next = (self.next + 1) % self.capacity();
        self.recorded = self.recorded.saturating_add(1);
    }

    /// Mean latency over slots holding a real sample.
    ///
    /// Unresponsive rounds do not pull the mean towards zero; they only show
    /// up in [`loss`](Self::loss).
    pub fn latency(&self) -> Duration {
        let (sum, count) = self
            .latency
            .iter()
            .filter(|l| !l.is_zero())
            .fold((Duration::ZERO, 0u32), |(sum, n), l| (sum + *l, n + 1));

        if count == 0 {
            Duration::ZERO
        } else {
            sum / count
        }
    }

    /// Mean loss indicator over all slots, written or not.
    pub fn loss(&self) -> f64 {
        self.loss_hits() as f64 / self.capacity() as f64
    }

    /// Number of slots holding a lost round.
    pub fn loss_hits(&self) -> usize {
        self.lost.iter().filter(|l| **l).count()
    }

    /// Whether loss reaches `percent` of the window, compared exactly.
    pub fn loss_reaches(&self, percent: u8) -> bool {
        self.loss_hits() * 100 >= usize::from(percent) * self.capacity()
    }

    /// True while any slot lacks a real latency sample.
    pub fn incomplete(&self) -> bool {
        self.latency.iter().any(Duration::is_zero)
    }

    /// Forget all samples, keeping the capacity.
    pub fn reset(&mut self) {
        self.latency.fill(Duration::ZERO);
        self.lost.fill(false);
        self.next = 0;
        self.recorded = 0;
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(super::DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_empty_window() {
        let window = SampleWindow::new(4);
        assert!(window.is_empty());
        assert!(window.incomplete());
        assert_eq!(window.latency(), Duration::ZERO);
        assert_eq!(window.loss(), 0.0);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut window = SampleWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.record(ms(5), false);
        assert!(!window.incomplete());
    }

    #[test]
    fn test_latency_ignores_unresponsive_rounds() {
        let mut window = SampleWindow::new(4);
        window.record(ms(10), false);
        window.record(Duration::ZERO, true);
        window.record(ms(30), false);

        assert_eq!(window.latency(), ms(20));
        // Loss averages over every slot, including the unwritten one.
        assert!((window.loss() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut window = SampleWindow::new(3);
        // k = 2 distinct early samples
        window.record(ms(1000), true);
        window.record(ms(1000), true);
        // W = 3 recent samples
        for _ in 0..3 {
            window.record(ms(10), false);
        }

        assert_eq!(window.capacity(), 3);
        assert_eq!(window.len(), 3);
        assert_eq!(window.recorded(), 5);
        assert_eq!(window.latency(), ms(10));
        assert_eq!(window.loss(), 0.0);
    }

    #[test]
    fn test_incomplete_until_every_slot_has_latency() {
        let mut window = SampleWindow::new(3);
        window.record(ms(10), false);
        window.record(ms(10), false);
        assert!(window.incomplete());

        window.record(ms(10), false);
        assert!(!window.incomplete());

        // A lost round puts a hole back into the window.
        window.record(Duration::ZERO, true);
        assert!(window.incomplete());
    }

    #[test]
    fn test_loss_reaches_exact_percentage() {
        let mut window = SampleWindow::new(100);
        for i in 0..100 {
            window.record(if i < 29 { Duration::ZERO } else { ms(10) }, i < 29);
        }
        assert_eq!(window.loss_hits(), 29);
        assert!(window.loss_reaches(29));
        assert!(!window.loss_reaches(30));
    }

    #[test]
    fn test_reset() {
        let mut window = SampleWindow::new(2);
        window.record(ms(10), true);
        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 2);
        assert_eq!(window.loss(), 0.0);
    }
}
