//! Frame-drop and foreign-traffic trackers
//!
//! `FrameDropTracker` decides, with hysteresis and a post-change grace
//! delay, whether the video bitrate must be reduced. `ForeignTrafficTracker`
//! converts cumulative received-vs-valid packet counters into a
//! foreign-packets-per-second interference estimate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// How often dropped frames are evaluated.
pub const FRAME_DROP_CHECK_INTERVAL: Duration = Duration::from_secs(3);
/// More drops than this per check window trigger a reduction.
pub const MAX_DROPPED_FRAMES_ALLOWED: u32 = 3;

/// Counts dropped video frames over a sliding window and decides whether
/// the bitrate needs to be reduced.
///
/// Every time the bitrate is changed it can take a while until the camera
/// reacts - `delay_for` suppresses the check during that period such that
/// drops caused by the encoder still converging are not reported as an
/// error (otherwise the control loop would oscillate, over-correcting on
/// drops caused by its own prior correction).
pub struct FrameDropTracker {
    frame_drop_counter: AtomicU32,
    last_check: Instant,
    /// While set, needs_bitrate_reduction() returns false.
    no_error_until: Option<Instant>,
}

impl FrameDropTracker {
    pub fn new() -> Self {
        Self {
            frame_drop_counter: AtomicU32::new(0),
            last_check: Instant::now(),
            no_error_until: None,
        }
    }

    /// Thread-safe, called from the thread injecting frame(s).
    pub fn notify_dropped_frame(&self, n_dropped: u32) {
        self.frame_drop_counter.fetch_add(n_dropped, Ordering::Relaxed);
    }

    /// Suppress error detection for the given delay, starting now.
    pub fn delay_for(&mut self, delay: Duration) {
        self.delay_for_at(delay, Instant::now());
    }

    fn delay_for_at(&mut self, delay: Duration, now: Instant) {
        self.no_error_until = Some(now + delay);
    }

    /// Only to be called from the thread performing link management.
    pub fn needs_bitrate_reduction(&mut self) -> bool {
        self.needs_bitrate_reduction_at(Instant::now())
    }

    fn needs_bitrate_reduction_at(&mut self, now: Instant) -> bool {
        if let Some(until) = self.no_error_until {
            if now >= until {
                // Grace period over - flush drops accumulated during it
                // without signaling.
                self.last_check = now;
                let absorbed = self.frame_drop_counter.swap(0, Ordering::Relaxed);
                log::debug!("Dropped {} frames during adjust period (no bitrate reduction)", absorbed);
                self.no_error_until = None;
            }
            return false;
        }
        let elapsed = now.duration_since(self.last_check);
        if elapsed >= FRAME_DROP_CHECK_INTERVAL {
            self.last_check = now;
            let dropped_since_last_check = self.frame_drop_counter.swap(0, Ordering::Relaxed);
            if dropped_since_last_check > MAX_DROPPED_FRAMES_ALLOWED {
                log::debug!("Dropped {} frames during {:?} delta period", dropped_since_last_check, elapsed);
                return true;
            }
        }
        false
    }
}

impl Default for FrameDropTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts cumulative (any, valid) packet counters into a foreign
/// packets-per-second estimate, recalculated on a >= 1 s window.
pub struct ForeignTrafficTracker {
    foreign_packets_last_time: u64,
    pps_foreign_packets_count: u64,
    pps_last_recalculation: Instant,
    pps_current: i32,
}

impl ForeignTrafficTracker {
    pub fn new() -> Self {
        Self {
            foreign_packets_last_time: 0,
            pps_foreign_packets_count: 0,
            pps_last_recalculation: Instant::now(),
            pps_current: -1,
        }
    }

    /// Feed the cumulative counters from the transport.
    pub fn update(&mut self, count_p_any: u64, count_p_valid: u64) {
        self.update_at(count_p_any, count_p_valid, Instant::now());
    }

    fn update_at(&mut self, count_p_any: u64, count_p_valid: u64, now: Instant) {
        let n_foreign_packets = count_p_any.saturating_sub(count_p_valid);
        if self.foreign_packets_last_time > n_foreign_packets {
            // Counter regression (e.g. driver reset) - re-baseline.
            self.foreign_packets_last_time = n_foreign_packets;
            return;
        }
        let delta = n_foreign_packets - self.foreign_packets_last_time;
        self.foreign_packets_last_time = n_foreign_packets;
        self.update_n_foreign_packets(delta, now);
    }

    fn update_n_foreign_packets(&mut self, n_foreign_packets: u64, now: Instant) {
        self.pps_foreign_packets_count += n_foreign_packets;
        let elapsed = now.duration_since(self.pps_last_recalculation);
        if elapsed > Duration::from_secs(1) {
            self.pps_last_recalculation = now;
            if self.pps_foreign_packets_count == 0 {
                self.pps_current = 0;
                return;
            }
            let elapsed_us = elapsed.as_micros() as u64;
            self.pps_current = (self.pps_foreign_packets_count * 1_000_000 / elapsed_us) as i32;
            self.pps_foreign_packets_count = 0;
        }
    }

    /// -1 until the first recalculation window has passed.
    pub fn foreign_packets_per_second(&self) -> i32 {
        self.pps_current
    }
}

impl Default for ForeignTrafficTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_reduction_within_tolerance() {
        let mut tracker = FrameDropTracker::new();
        let t0 = Instant::now();
        for _ in 0..MAX_DROPPED_FRAMES_ALLOWED {
            tracker.notify_dropped_frame(1);
        }
        // 3 drops in the window is within tolerance
        assert!(!tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_reduction_signaled_once_and_counter_reset() {
        let mut tracker = FrameDropTracker::new();
        let t0 = Instant::now();
        for _ in 0..4 {
            tracker.notify_dropped_frame(1);
        }
        // before the check boundary nothing is signaled
        assert!(!tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(1)));
        // at the boundary: exactly one true, counter flushed
        assert!(tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(4)));
        assert!(!tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(8)));
    }

    #[test]
    fn test_grace_period_absorbs_drops() {
        let mut tracker = FrameDropTracker::new();
        let t0 = Instant::now();
        tracker.delay_for_at(Duration::from_secs(2), t0);
        tracker.notify_dropped_frame(100);
        // during the grace period the check never fires
        assert!(!tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(1)));
        // first check past the grace period flushes without signaling
        assert!(!tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(3)));
        // normal evaluation resumed: fresh drops count again
        for _ in 0..5 {
            tracker.notify_dropped_frame(1);
        }
        assert!(tracker.needs_bitrate_reduction_at(t0 + Duration::from_secs(7)));
    }

    #[test]
    fn test_foreign_traffic_pps() {
        let mut tracker = ForeignTrafficTracker::new();
        let t0 = Instant::now();
        assert_eq!(tracker.foreign_packets_per_second(), -1);
        tracker.update_at(0, 0, t0);
        // 2000 foreign packets over 2 seconds -> ~1000 pps
        tracker.update_at(2500, 500, t0 + Duration::from_secs(2));
        let pps = tracker.foreign_packets_per_second();
        assert!((990..=1010).contains(&pps), "pps={}", pps);
    }

    #[test]
    fn test_foreign_traffic_counter_regression() {
        let mut tracker = ForeignTrafficTracker::new();
        let t0 = Instant::now();
        tracker.update_at(1000, 100, t0);
        // driver reset: fewer cumulative foreign packets than before.
        // The regression only re-baselines, it never produces a negative
        // delta.
        tracker.update_at(10, 5, t0 + Duration::from_secs(2));
        tracker.update_at(10, 5, t0 + Duration::from_secs(4));
        // only the 900 pre-reset foreign packets count, over ~4 s
        let pps = tracker.foreign_packets_per_second();
        assert!((200..=250).contains(&pps), "pps={}", pps);
        // next full window without traffic decays to zero
        tracker.update_at(10, 5, t0 + Duration::from_secs(6));
        assert_eq!(tracker.foreign_packets_per_second(), 0);
    }
}
