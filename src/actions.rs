//! Shared context between the link and the rest of the system
//!
//! The link engine does not know about video encoders, telemetry routers
//! or UIs. It talks to them through this injected context: arming state
//! flows in, recommended bitrate and statistics flow out. Everything here
//! is safe to call from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::rc_channels::RcChannelState;
use crate::stats::{AnalyzeResult, LinkStatistics, ScanProgress};

/// Callback invoked with (stream index, recommended kbit/s) whenever the
/// achievable video rate changes.
pub type BitrateCallback = Box<dyn Fn(u8, u32) + Send + Sync>;

/// Listener notified on armed / disarmed transitions.
pub type ArmingCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Whether the vehicle is currently armed. The link uses this to switch
/// between the armed and disarmed TX power settings.
#[derive(Default)]
pub struct ArmingState {
    armed: AtomicBool,
    listeners: Mutex<Vec<ArmingCallback>>,
}

impl ArmingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Update the arming state, notifying listeners on an actual change.
    pub fn update(&self, armed: bool) {
        if self.armed.swap(armed, Ordering::SeqCst) == armed {
            return;
        }
        log::info!("arming state changed: {}", if armed { "armed" } else { "disarmed" });
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(armed);
        }
    }

    pub fn register_listener(&self, listener: ArmingCallback) {
        self.listeners.lock().unwrap().push(listener);
    }
}

/// Sink for the recommended video bitrate. Last writer wins, there is at
/// most one consumer at a time.
#[derive(Default)]
pub struct BitrateSink {
    callback: Mutex<Option<BitrateCallback>>,
}

impl BitrateSink {
    pub fn set_callback(&self, callback: Option<BitrateCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    pub fn notify(&self, stream_index: u8, rate_kbits: u32) {
        let callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(stream_index, rate_kbits);
        }
    }

    pub fn has_consumer(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

/// Outbound event surface: statistics snapshots plus drainable progress
/// queues for long-running operations.
#[derive(Default)]
pub struct LinkEvents {
    stats: Mutex<LinkStatistics>,
    scan_progress: Mutex<Vec<ScanProgress>>,
    analyze_results: Mutex<Vec<AnalyzeResult>>,
}

impl LinkEvents {
    /// Replace the published statistics wholesale.
    pub fn update_stats(&self, stats: LinkStatistics) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn get_stats(&self) -> LinkStatistics {
        *self.stats.lock().unwrap()
    }

    pub fn push_scan_progress(&self, progress: ScanProgress) {
        self.scan_progress.lock().unwrap().push(progress);
    }

    /// Drain all scan progress entries published since the last call.
    pub fn drain_scan_progress(&self) -> Vec<ScanProgress> {
        std::mem::take(&mut *self.scan_progress.lock().unwrap())
    }

    pub fn push_analyze_result(&self, result: AnalyzeResult) {
        self.analyze_results.lock().unwrap().push(result);
    }

    /// Drain all analyze results published since the last call.
    pub fn drain_analyze_results(&self) -> Vec<AnalyzeResult> {
        std::mem::take(&mut *self.analyze_results.lock().unwrap())
    }
}

/// Requests the platform to bring up / tear down the WiFi hotspot. The
/// link asks for the hotspot as a fallback when no air unit is reachable;
/// actually (de)configuring the interface is the platform's job.
#[derive(Default)]
pub struct HotspotControl {
    requested: AtomicBool,
}

impl HotspotControl {
    pub fn request(&self, enable: bool) {
        if self.requested.swap(enable, Ordering::SeqCst) != enable {
            log::info!("wifi hotspot {}", if enable { "requested" } else { "released" });
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// One-shot fatal error latch. Once set, the link gives up on the current
/// hardware and the supervisor is expected to restart the process.
#[derive(Default)]
pub struct FatalError {
    raised: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FatalError {
    /// Latch a fatal error. Only the first call wins.
    pub fn raise(&self, message: &str) {
        if self.raised.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("fatal link error: {}", message);
        *self.message.lock().unwrap() = Some(message.to_string());
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().unwrap().clone()
    }
}

/// Everything the link engine needs from its environment, injected at
/// construction time.
#[derive(Default)]
pub struct LinkContext {
    pub arming: ArmingState,
    pub bitrate: BitrateSink,
    pub events: LinkEvents,
    pub hotspot: HotspotControl,
    pub fatal: FatalError,
    pub rc_channels: RcChannelState,
}

impl LinkContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_arming_listener_fires_on_change_only() {
        let state = ArmingState::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        state.register_listener(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        state.update(true);
        state.update(true);
        state.update(false);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!state.is_armed());
    }

    #[test]
    fn test_bitrate_sink_last_writer_wins() {
        let sink = BitrateSink::default();
        assert!(!sink.has_consumer());
        let first = Arc::new(AtomicU32::new(0));
        let first2 = first.clone();
        sink.set_callback(Some(Box::new(move |_, rate| first2.store(rate, Ordering::SeqCst))));
        let second = Arc::new(AtomicU32::new(0));
        let second2 = second.clone();
        sink.set_callback(Some(Box::new(move |_, rate| second2.store(rate, Ordering::SeqCst))));
        sink.notify(0, 8000);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 8000);
    }

    #[test]
    fn test_events_drain() {
        let events = LinkEvents::default();
        events.push_scan_progress(ScanProgress {
            frequency_mhz: 5745,
            channel_width_mhz: 20,
            progress_percent: 50,
            success: false,
        });
        assert_eq!(events.drain_scan_progress().len(), 1);
        assert!(events.drain_scan_progress().is_empty());
    }

    #[test]
    fn test_fatal_error_first_call_wins() {
        let fatal = FatalError::default();
        assert!(!fatal.is_raised());
        fatal.raise("card vanished");
        fatal.raise("something else");
        assert!(fatal.is_raised());
        assert_eq!(fatal.message().as_deref(), Some("card vanished"));
    }
}
