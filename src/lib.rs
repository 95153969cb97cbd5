//! # Wifibroadcast link management engine
//!
//! Control and data plane for a bidirectional, lossy, broadcast-style
//! wireless link between an air unit (vehicle) and a ground unit (operator
//! station), carried over commodity WiFi radios operating in
//! monitor/injection mode.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `channel`: WiFi channel space model and parameter validation
//! - `rates`: bench-measured rate tables and FEC arithmetic
//! - `radio`: radio transport seam, card model and radio set
//! - `settings`: persisted link/networking parameters and setting surface
//! - `trackers`: frame-drop and foreign-traffic trackers
//! - `rc_channels`: RC channel state for MCS/BW overrides
//! - `management`: air/ground management channel (20/40 MHz sync)
//! - `work`: single-slot deferred work queue
//! - `actions`: injected collaborator context (arming, bitrate sink, events)
//! - `stats`: link statistics snapshot types
//! - `controller`: the orchestrating link controller and its worker loop

pub mod actions;
pub mod channel;
pub mod controller;
pub mod management;
pub mod radio;
pub mod rates;
pub mod rc_channels;
pub mod settings;
pub mod stats;
pub mod trackers;
pub mod work;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Work queue busy")]
    Busy,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

// Constants
/// Channel 149 / race band 2, the default on 5.8 GHz capable hardware.
pub const DEFAULT_5GHZ_FREQUENCY: u32 = 5745;
/// Channel 9, a 20 MHz channel. Used when no card supports 5.8 GHz.
pub const DEFAULT_2GHZ_FREQUENCY: u32 = 2452;
/// Highest MCS index where modulation is still QPSK.
pub const DEFAULT_MCS_INDEX: u8 = 2;
pub const DEFAULT_CHANNEL_WIDTH_MHZ: u8 = 20;
/// About 18.0 dBm.
pub const DEFAULT_TX_POWER_MILLI_WATT: u32 = 25;
pub const DEFAULT_FEC_PERCENTAGE: u8 = 20;
/// Distinguished first byte of management frames on the transport.
pub const MANAGEMENT_FRAME_MAGIC: u8 = 0x4d;

// Utility functions
pub fn init_logging() {
    env_logger::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_5GHZ_FREQUENCY, 5745);
        assert_eq!(DEFAULT_MCS_INDEX, 2);
        assert_eq!(DEFAULT_CHANNEL_WIDTH_MHZ, 20);
    }
}
