//! WiFi channel space model
//!
//! This module contains the channel/band/width model used by the link
//! controller, the supported channel tables and the validators applied to
//! user-requested parameters before they may touch hardware.

use serde::{Deserialize, Serialize};

use crate::{LinkError, Result};

/// Frequency band a channel lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiSpace {
    /// 2.4 GHz band
    G2_4,
    /// 5.8 GHz band
    G5_8,
}

impl WifiSpace {
    pub fn name(&self) -> &'static str {
        match self {
            WifiSpace::G2_4 => "2.4GHz",
            WifiSpace::G5_8 => "5.8GHz",
        }
    }
}

/// Channel bandwidth used for injection / reception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelWidth {
    /// 20 MHz bandwidth
    Mhz20 = 20,
    /// 40 MHz bandwidth
    Mhz40 = 40,
}

impl ChannelWidth {
    /// Parse width from its MHz value
    pub fn from_mhz(value: u8) -> Result<Self> {
        match value {
            20 => Ok(ChannelWidth::Mhz20),
            40 => Ok(ChannelWidth::Mhz40),
            _ => Err(LinkError::Parse(format!("Invalid channel width: {}", value))),
        }
    }

    /// Get bandwidth in MHz
    pub fn mhz(&self) -> u8 {
        *self as u8
    }

    pub fn is_40mhz(&self) -> bool {
        matches!(self, ChannelWidth::Mhz40)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelWidth::Mhz20 => "20MHz",
            ChannelWidth::Mhz40 => "40MHz",
        }
    }
}

impl Default for ChannelWidth {
    fn default() -> Self {
        ChannelWidth::Mhz20
    }
}

/// A single WiFi channel the link can operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiChannel {
    /// Center frequency in MHz
    pub frequency_mhz: u32,
    /// 802.11 channel number
    pub channel_number: u8,
    /// Band this channel lives in
    pub space: WifiSpace,
    /// Whether this is a regular (non country-restricted) channel
    pub is_standard: bool,
    /// Whether this channel is part of the 40 MHz channel plan
    pub in_40mhz_plan: bool,
}

impl WifiChannel {
    pub fn description(&self) -> String {
        format!("Ch{} ({} MHz, {})", self.channel_number, self.frequency_mhz, self.space.name())
    }
}

const fn ch(frequency_mhz: u32, channel_number: u8, space: WifiSpace, in_40mhz_plan: bool) -> WifiChannel {
    WifiChannel {
        frequency_mhz,
        channel_number,
        space,
        is_standard: true,
        in_40mhz_plan,
    }
}

/// All 2.4 GHz channels usable for injection (channels 1..=13).
pub fn channels_2g() -> Vec<WifiChannel> {
    vec![
        ch(2412, 1, WifiSpace::G2_4, false),
        ch(2417, 2, WifiSpace::G2_4, false),
        ch(2422, 3, WifiSpace::G2_4, false),
        ch(2427, 4, WifiSpace::G2_4, false),
        ch(2432, 5, WifiSpace::G2_4, false),
        ch(2437, 6, WifiSpace::G2_4, false),
        ch(2442, 7, WifiSpace::G2_4, false),
        ch(2447, 8, WifiSpace::G2_4, false),
        ch(2452, 9, WifiSpace::G2_4, false),
        ch(2457, 10, WifiSpace::G2_4, false),
        ch(2462, 11, WifiSpace::G2_4, false),
        ch(2467, 12, WifiSpace::G2_4, false),
        ch(2472, 13, WifiSpace::G2_4, false),
    ]
}

/// All 5.8 GHz channels usable for injection, including the race bands.
pub fn channels_5g() -> Vec<WifiChannel> {
    vec![
        ch(5180, 36, WifiSpace::G5_8, true),
        ch(5200, 40, WifiSpace::G5_8, true),
        ch(5220, 44, WifiSpace::G5_8, true),
        ch(5240, 48, WifiSpace::G5_8, true),
        ch(5260, 52, WifiSpace::G5_8, true),
        ch(5280, 56, WifiSpace::G5_8, true),
        ch(5300, 60, WifiSpace::G5_8, true),
        ch(5320, 64, WifiSpace::G5_8, true),
        ch(5500, 100, WifiSpace::G5_8, true),
        ch(5520, 104, WifiSpace::G5_8, true),
        ch(5540, 108, WifiSpace::G5_8, true),
        ch(5560, 112, WifiSpace::G5_8, true),
        ch(5580, 116, WifiSpace::G5_8, true),
        ch(5600, 120, WifiSpace::G5_8, true),
        ch(5620, 124, WifiSpace::G5_8, true),
        ch(5640, 128, WifiSpace::G5_8, true),
        ch(5660, 132, WifiSpace::G5_8, true),
        ch(5680, 136, WifiSpace::G5_8, true),
        ch(5700, 140, WifiSpace::G5_8, true),
        ch(5745, 149, WifiSpace::G5_8, true),
        ch(5765, 153, WifiSpace::G5_8, true),
        ch(5785, 157, WifiSpace::G5_8, true),
        ch(5805, 161, WifiSpace::G5_8, true),
        ch(5825, 165, WifiSpace::G5_8, true),
    ]
}

/// All channels, 2.4 GHz first.
pub fn all_channels() -> Vec<WifiChannel> {
    let mut ret = channels_2g();
    ret.extend(channels_5g());
    ret
}

/// Look up the channel for a given center frequency.
pub fn find_channel(frequency_mhz: u32) -> Option<WifiChannel> {
    all_channels().into_iter().find(|c| c.frequency_mhz == frequency_mhz)
}

/// Which band a given frequency belongs to. None for frequencies outside
/// both supported bands.
pub fn frequency_to_space(frequency_mhz: u32) -> Option<WifiSpace> {
    match frequency_mhz {
        2400..=2500 => Some(WifiSpace::G2_4),
        5100..=5900 => Some(WifiSpace::G5_8),
        _ => None,
    }
}

/// Validate a 2.4 GHz frequency against the supported channel table.
pub fn is_valid_frequency_2g(frequency_mhz: u32) -> bool {
    channels_2g().iter().any(|c| c.frequency_mhz == frequency_mhz)
}

/// Validate a 5.8 GHz frequency against the supported channel table.
pub fn is_valid_frequency_5g(frequency_mhz: u32) -> bool {
    channels_5g().iter().any(|c| c.frequency_mhz == frequency_mhz)
}

pub fn is_valid_channel_width(channel_width_mhz: u32) -> bool {
    channel_width_mhz == 20 || channel_width_mhz == 40
}

/// MCS 0..=31 - in practice only 0..=12 are used for injection.
pub fn is_valid_mcs_index(mcs_index: u32) -> bool {
    mcs_index <= 31
}

/// No WiFi card will ever do 30 W, but some cards increase their tx power
/// a bit more when given a higher value.
pub fn is_valid_tx_power_milli_watt(tx_power_mw: i64) -> bool {
    (10..=30 * 1000).contains(&tx_power_mw)
}

/// rtl8812au tx power index override, passed through to the driver.
pub fn is_valid_tx_power_index_override(value: i64) -> bool {
    (0..=63).contains(&value)
}

/// 0 means auto (variable) block length.
pub fn is_valid_fec_block_length(block_length: i64) -> bool {
    (0..100).contains(&block_length)
}

/// More than 100% FEC (2x the data) is already a lot; up to 400% is
/// allowed for testing.
pub fn is_valid_fec_percentage(fec_perc: i64) -> bool {
    (1..=400).contains(&fec_perc)
}

/// P(dBm) = 10 * log10(P(mW) / 1mW) - returned in milli-dBm as consumed
/// by nl80211.
pub fn milli_watt_to_milli_dbm(milli_watt: u32) -> u32 {
    let tmp = (milli_watt as f64).log10();
    (tmp * 10.0 * 100.0).round() as u32
}

/// P(mW) = 1mW * 10^(P(dBm)/10)
pub fn milli_dbm_to_milli_watt(milli_dbm: f64) -> f64 {
    let exponent = milli_dbm / 1000.0 / 10.0;
    10f64.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_width() {
        let bw = ChannelWidth::from_mhz(40).unwrap();
        assert_eq!(bw.mhz(), 40);
        assert!(bw.is_40mhz());
        assert_eq!(bw.name(), "40MHz");
        assert!(ChannelWidth::from_mhz(80).is_err());
    }

    #[test]
    fn test_channel_tables() {
        let c = find_channel(5745).unwrap();
        assert_eq!(c.channel_number, 149);
        assert_eq!(c.space, WifiSpace::G5_8);

        let c = find_channel(2452).unwrap();
        assert_eq!(c.channel_number, 9);
        assert_eq!(c.space, WifiSpace::G2_4);

        assert!(find_channel(5746).is_none());
    }

    #[test]
    fn test_frequency_to_space() {
        assert_eq!(frequency_to_space(2412), Some(WifiSpace::G2_4));
        assert_eq!(frequency_to_space(5745), Some(WifiSpace::G5_8));
        assert_eq!(frequency_to_space(900), None);
    }

    #[test]
    fn test_validators() {
        assert!(is_valid_frequency_5g(5745));
        assert!(!is_valid_frequency_5g(2452));
        assert!(is_valid_frequency_2g(2452));

        assert!(is_valid_mcs_index(0));
        assert!(is_valid_mcs_index(31));
        assert!(!is_valid_mcs_index(32));

        assert!(is_valid_tx_power_milli_watt(10));
        assert!(is_valid_tx_power_milli_watt(30000));
        assert!(!is_valid_tx_power_milli_watt(9));
        assert!(!is_valid_tx_power_milli_watt(30001));

        assert!(is_valid_fec_percentage(1));
        assert!(is_valid_fec_percentage(400));
        assert!(!is_valid_fec_percentage(0));
        assert!(!is_valid_fec_percentage(401));

        assert!(is_valid_fec_block_length(0));
        assert!(!is_valid_fec_block_length(100));
    }

    #[test]
    fn test_milli_watt_to_milli_dbm() {
        // 100 mW == 20 dBm
        assert_eq!(milli_watt_to_milli_dbm(100), 2000);
        // 25 mW ~= 14 dBm
        assert_eq!(milli_watt_to_milli_dbm(25), 1398);
    }
}
