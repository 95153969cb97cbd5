//! Link statistics and long-running operation progress reports

use serde::{Deserialize, Serialize};

/// Number of video streams (cameras) tracked for dropped-frame counts.
pub const MAX_VIDEO_STREAMS: usize = 2;

/// Periodically recomputed snapshot of the link state. Consumers always
/// receive a complete snapshot (wholesale overwrite), never incremental
/// field updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStatistics {
    /// Currently achievable video rate, kbit/s, after FEC overhead.
    pub curr_video_rate_kbits: u32,
    /// Theoretical max injection rate for the current MCS / width, kbit/s.
    pub curr_max_rate_kbits: u32,
    /// Packets received on the monitor interface, regardless of origin.
    pub count_p_any: u64,
    /// Packets received that belong to this link.
    pub count_p_valid: u64,
    pub count_tx_injected: u64,
    pub count_tx_errors: u64,
    /// Estimated foreign (non-link) packets per second, -1 if unknown.
    pub foreign_packets_per_second: i32,
    pub curr_frequency_mhz: u32,
    pub curr_channel_width_mhz: u8,
    pub curr_mcs_index: u8,
    /// Effective TX power in mW; 0 while the index override path is the
    /// active control path.
    pub curr_tx_power_milli_watt: u32,
    /// Effective rtl8812au TX power index; 0 while the mW path is active.
    pub curr_tx_power_index: u32,
    /// Cumulative dropped frames reported per video stream.
    pub count_dropped_frames: [u32; MAX_VIDEO_STREAMS],
    /// Age of the last received management frame in ms, -1 if none was
    /// ever received. A stale value means the peer is possibly lost.
    pub management_age_ms: i64,
    /// Current rate adjustment applied by the variable bitrate logic, in
    /// percent of the theoretical max (100 = no reduction).
    pub curr_rate_adjustment_percent: u8,
}

/// Progress of an ongoing channel scan, published incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub frequency_mhz: u32,
    pub channel_width_mhz: u8,
    /// 0..=100
    pub progress_percent: u8,
    /// True once a valid air unit was found (terminal).
    pub success: bool,
}

/// Per-channel result of an ongoing pollution analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub frequency_mhz: u32,
    /// Foreign packets observed while dwelling on this frequency.
    pub foreign_packets: u32,
    /// 0..=100, 100 marks the analysis as finished.
    pub progress_percent: u8,
}
