//! Rate tables and FEC arithmetic
//!
//! Pure lookup/calculation functions mapping (card type, band, MCS index,
//! channel width) to the maximum injection rate achievable in practice.
//! The table values come from bench measurements minus a hand-tuned safety
//! margin per entry - they encode empirical measurement, not a formula.
//! Theoretical rates can be found at <https://mcsindex.com/>.

use crate::channel::WifiSpace;
use crate::radio::WifiCardType;

/// Maximum rate for a (MCS, band) combination at 20 and 40 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate20Mhz40Mhz {
    pub rate_20mhz_kbits: u32,
    pub rate_40mhz_kbits: u32,
}

/// Max injection rate on 5.8 GHz for the rtl8812au family.
pub fn rtl8812au_max_rate_5g_kbits(mcs_index: u8) -> Rate20Mhz40Mhz {
    match mcs_index {
        0 => {
            // theoretical: 6.5 | 13.5, measured on the bench: 5.7 | 10.4
            Rate20Mhz40Mhz {
                rate_20mhz_kbits: 5700 - 1000,   // minus 1MBit/s
                rate_40mhz_kbits: 10400 - 3000,  // minus 3MBit/s
            }
        }
        1 => {
            // theoretical: 13 | 27, measured: 10.8 | 18.8
            Rate20Mhz40Mhz {
                rate_20mhz_kbits: 10800 - 1000,  // minus 1MBit/s
                rate_40mhz_kbits: 18800 - 3500,  // minus 3.5MBit/s
            }
        }
        2 => {
            // theoretical: 19.5 | 40.5, measured: 15.2 | 26.6
            Rate20Mhz40Mhz {
                rate_20mhz_kbits: 15200 - 2000,  // minus 2MBit/s
                rate_40mhz_kbits: 26600 - 6000,  // minus 6MBit/s
            }
        }
        3 => {
            // theoretical: 26 | 54, measured: 19.2 | 30+ (beyond encoder)
            Rate20Mhz40Mhz {
                rate_20mhz_kbits: 19200 - 3000,  // minus 3MBit/s
                rate_40mhz_kbits: 30000 - 5000,  // minus 5MBit/s
            }
        }
        // In general, we only use / recommend MCS 0..3
        4 => Rate20Mhz40Mhz { rate_20mhz_kbits: 20000, rate_40mhz_kbits: 30000 },
        5 => Rate20Mhz40Mhz { rate_20mhz_kbits: 23000, rate_40mhz_kbits: 40000 },
        6 => Rate20Mhz40Mhz { rate_20mhz_kbits: 26000, rate_40mhz_kbits: 50000 },
        7 => Rate20Mhz40Mhz { rate_20mhz_kbits: 29000, rate_40mhz_kbits: 55000 },
        // MCS 8 == MCS 0 with 2 spatial streams
        8 => Rate20Mhz40Mhz {
            // theoretical 13 | 27, measured: ~11.7 | 22.1
            rate_20mhz_kbits: 11700 - 3000,
            rate_40mhz_kbits: 22100 - 4000,
        },
        9 => Rate20Mhz40Mhz {
            // theoretical 26 | 54, measured: ~21 | 30+
            rate_20mhz_kbits: 21000 - 3000,
            rate_40mhz_kbits: 32000 - 4000,
        },
        10 => Rate20Mhz40Mhz {
            // theoretical 39 | 81 - here we pretty much reach the limit of
            // what encoding hardware can do
            rate_20mhz_kbits: 25000 - 3000,
            rate_40mhz_kbits: 37000 - 4000,
        },
        11 => Rate20Mhz40Mhz {
            // theoretical 52 | 108
            rate_20mhz_kbits: 30000 - 3000,
            rate_40mhz_kbits: 50000 - 4000,
        },
        12 => Rate20Mhz40Mhz {
            // theoretical 78 | 162
            rate_20mhz_kbits: 30000 - 3000,
            rate_40mhz_kbits: 50000 - 4000,
        },
        _ => Rate20Mhz40Mhz { rate_20mhz_kbits: 5000, rate_40mhz_kbits: 5000 },
    }
}

/// Max injection rate on 2.4 GHz for the rtl8812au family.
pub fn rtl8812au_max_rate_2g_kbits(mcs_index: u8) -> Rate20Mhz40Mhz {
    match mcs_index {
        0 => Rate20Mhz40Mhz {
            // theoretical: 6.5 | 13.5
            rate_20mhz_kbits: 4600 - 1000,  // minus 1MBit/s
            rate_40mhz_kbits: 6500 - 2000,  // minus 2MBit/s
        },
        1 => Rate20Mhz40Mhz {
            // theoretical: 13 | 27
            rate_20mhz_kbits: 10100 - 1000,  // minus 1MBit/s
            rate_40mhz_kbits: 15900 - 2000,  // minus 2MBit/s
        },
        2 => Rate20Mhz40Mhz {
            // theoretical: 19.5 | 40.5
            rate_20mhz_kbits: 13500 - 2000,  // minus 2MBit/s
            rate_40mhz_kbits: 20000 - 2000,  // minus 2MBit/s
        },
        // In general, we only recommend MCS 0..2, but also map 3 and 4
        3 => Rate20Mhz40Mhz {
            // theoretical: 26 | 54
            rate_20mhz_kbits: 16600 - 2000,
            rate_40mhz_kbits: 24000 - 2000,
        },
        4 => Rate20Mhz40Mhz { rate_20mhz_kbits: 20000, rate_40mhz_kbits: 30000 },
        _ => {
            log::warn!("MCS >4 not recommended on 2.4GHz");
            Rate20Mhz40Mhz { rate_20mhz_kbits: 20000, rate_40mhz_kbits: 30000 }
        }
    }
}

/// Width-selected 5.8 GHz rate.
pub fn rtl8812au_max_rate_5g_kbits_for_width(mcs_index: u8, is_40_mhz: bool) -> u32 {
    let rate = rtl8812au_max_rate_5g_kbits(mcs_index);
    if is_40_mhz {
        rate.rate_40mhz_kbits
    } else {
        rate.rate_20mhz_kbits
    }
}

/// Width-selected 2.4 GHz rate.
pub fn rtl8812au_max_rate_2g_kbits_for_width(mcs_index: u8, is_40_mhz: bool) -> u32 {
    let rate = rtl8812au_max_rate_2g_kbits(mcs_index);
    if is_40_mhz {
        rate.rate_40mhz_kbits
    } else {
        rate.rate_20mhz_kbits
    }
}

fn max_rate_possible_5g_kbits(card_type: WifiCardType, mcs_index: u8, is_40_mhz: bool) -> u32 {
    if card_type.is_rtl8812au_family() || card_type == WifiCardType::Emulated {
        return rtl8812au_max_rate_5g_kbits_for_width(mcs_index, is_40_mhz);
    }
    // fallback for any other (weak) hardware
    5000
}

fn max_rate_possible_2g_kbits(card_type: WifiCardType, mcs_index: u8, is_40_mhz: bool) -> u32 {
    let rate_5g = max_rate_possible_5g_kbits(card_type, mcs_index, is_40_mhz);
    // 2.4G is (always) quite crowded
    rate_5g * 100 / 80
}

/// Max possible injection rate for a given card / band / MCS / width.
pub fn max_rate_possible(card_type: WifiCardType, space: WifiSpace, mcs_index: u8, is_40_mhz: bool) -> u32 {
    match space {
        WifiSpace::G2_4 => max_rate_possible_2g_kbits(card_type, mcs_index, is_40_mhz),
        WifiSpace::G5_8 => max_rate_possible_5g_kbits(card_type, mcs_index, is_40_mhz),
    }
}

/// Usable payload bandwidth after FEC overhead:
/// effective = raw * 100 / (100 + fec_percent), rounded.
pub fn deduce_fec_overhead(bandwidth_kbits: u32, fec_overhead_perc: u32) -> u32 {
    let tmp = bandwidth_kbits as f64 * 100.0 / (100.0 + fec_overhead_perc as f64);
    tmp.round() as u32
}

/// Scale a bandwidth by a percentage (integer arithmetic).
pub fn multiply_by_percent(bandwidth_kbits: u32, percentage: u32) -> u32 {
    bandwidth_kbits * percentage / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtl8812au_5g_table_values() {
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(0, false), 4700);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(0, true), 7400);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(1, false), 9800);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(1, true), 15300);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(2, false), 13200);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(2, true), 20600);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(3, false), 16200);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(3, true), 25000);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(8, false), 8700);
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(8, true), 18100);
        // out of table -> conservative default
        assert_eq!(rtl8812au_max_rate_5g_kbits_for_width(13, false), 5000);
    }

    #[test]
    fn test_rtl8812au_2g_table_values() {
        assert_eq!(rtl8812au_max_rate_2g_kbits_for_width(0, false), 3600);
        assert_eq!(rtl8812au_max_rate_2g_kbits_for_width(0, true), 4500);
        assert_eq!(rtl8812au_max_rate_2g_kbits_for_width(2, false), 11500);
        assert_eq!(rtl8812au_max_rate_2g_kbits_for_width(2, true), 18000);
    }

    #[test]
    fn test_max_rate_possible_unknown_card() {
        assert_eq!(max_rate_possible(WifiCardType::Unknown, WifiSpace::G5_8, 2, true), 5000);
        assert_eq!(max_rate_possible(WifiCardType::Rtl8812au, WifiSpace::G5_8, 2, true), 20600);
    }

    #[test]
    fn test_deduce_fec_overhead() {
        assert_eq!(deduce_fec_overhead(12000, 20), 10000);
        assert_eq!(deduce_fec_overhead(10000, 0), 10000);
        assert_eq!(deduce_fec_overhead(10000, 100), 5000);
    }

    #[test]
    fn test_multiply_by_percent() {
        assert_eq!(multiply_by_percent(10000, 100), 10000);
        assert_eq!(multiply_by_percent(10000, 80), 8000);
        assert_eq!(multiply_by_percent(12345, 50), 6172);
    }
}
