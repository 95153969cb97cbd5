//! RC channel state
//!
//! Thread-safe store of the last RC channel values reported by the flight
//! controller, translated into optional discrete MCS-index / bandwidth
//! overrides ("MCS via RC channel" feature).

use std::sync::Mutex;

use crate::channel::ChannelWidth;

/// Number of RC channels in a report.
pub const N_RC_CHANNELS: usize = 18;

/// Before this PWM value a channel is considered not driven.
const PWM_MIN_US: u16 = 998;
/// PWM bucket size for the MCS mapping.
const PWM_BUCKET_US: u16 = 125;
/// We only map (and recommend) MCS 0..=3 via RC.
const MAX_MCS_VIA_RC: u16 = 3;

/// Atomic / thread-safe setter / getter for the RC channels as reported
/// by the flight controller.
#[derive(Debug, Default)]
pub struct RcChannelState {
    channels: Mutex<Option<[u16; N_RC_CHANNELS]>>,
}

impl RcChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called every time an RC channels report is received, regardless of
    /// whether any channel actually changed.
    pub fn update(&self, channels: [u16; N_RC_CHANNELS]) {
        *self.channels.lock().unwrap() = Some(channels);
    }

    /// Last reported channel values, None until the first report.
    pub fn channels(&self) -> Option<[u16; N_RC_CHANNELS]> {
        *self.channels.lock().unwrap()
    }

    /// Map the PWM value of the given channel (1-based index, as
    /// configured by the user) to an MCS index. None if no RC data has
    /// been supplied yet, the index is out of range or the PWM value is
    /// not in the mapped range.
    pub fn mcs_from_channel(&self, channel_index: u32) -> Option<u8> {
        let pwm = self.pwm_value(channel_index)?;
        if pwm < PWM_MIN_US {
            return None;
        }
        let bucket = (pwm - PWM_MIN_US) / PWM_BUCKET_US;
        if bucket > MAX_MCS_VIA_RC {
            return None;
        }
        Some(bucket as u8)
    }

    /// Map the PWM value of the given channel to a channel width. Low PWM
    /// selects 20 MHz, high PWM 40 MHz; mid-range is treated as "no
    /// override".
    pub fn bw_from_channel(&self, channel_index: u32) -> Option<ChannelWidth> {
        let pwm = self.pwm_value(channel_index)?;
        if pwm < PWM_MIN_US {
            return None;
        }
        if pwm <= 1300 {
            Some(ChannelWidth::Mhz20)
        } else if pwm >= 1700 {
            Some(ChannelWidth::Mhz40)
        } else {
            None
        }
    }

    fn pwm_value(&self, channel_index: u32) -> Option<u16> {
        if channel_index == 0 || channel_index as usize > N_RC_CHANNELS {
            return None;
        }
        let channels = (*self.channels.lock().unwrap())?;
        Some(channels[channel_index as usize - 1])
    }
}
