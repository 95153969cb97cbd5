//! Radio transport seam and WiFi card model
//!
//! The actual 802.11 injection/monitor primitive is an external
//! collaborator. This module defines the narrow trait the link controller
//! consumes, the card capability model used for validation, and an
//! in-memory emulated transport for the daemon binary and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelWidth, WifiChannel};
use crate::{LinkError, Result};

/// Hardware class of a broadcast card. The rtl8812au family does not
/// support setting tx power in mW - only via a driver specific tx power
/// index override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiCardType {
    Rtl8812au,
    Rtl8812bu,
    Rtl8812cu,
    Rtl8812eu,
    Rtl8852bu,
    Emulated,
    Unknown,
}

impl WifiCardType {
    /// True for chipsets whose tx power is controlled via the index
    /// override instead of a mW value.
    pub fn is_rtl8812au_family(&self) -> bool {
        matches!(
            self,
            WifiCardType::Rtl8812au
                | WifiCardType::Rtl8812bu
                | WifiCardType::Rtl8812cu
                | WifiCardType::Rtl8812eu
                | WifiCardType::Rtl8852bu
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            WifiCardType::Rtl8812au => "rtl8812au",
            WifiCardType::Rtl8812bu => "rtl8812bu",
            WifiCardType::Rtl8812cu => "rtl8812cu",
            WifiCardType::Rtl8812eu => "rtl8812eu",
            WifiCardType::Rtl8852bu => "rtl8852bu",
            WifiCardType::Emulated => "emulated",
            WifiCardType::Unknown => "unknown",
        }
    }
}

/// A discovered monitor-mode capable WiFi card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiCard {
    /// Interface name, e.g. "wlan0"
    pub name: String,
    pub card_type: WifiCardType,
    /// Frequencies (MHz) this card can be tuned to
    pub supported_frequencies_mhz: Vec<u32>,
    pub supports_40mhz: bool,
    pub supports_injection: bool,
}

impl WifiCard {
    pub fn supports_frequency(&self, frequency_mhz: u32) -> bool {
        self.supported_frequencies_mhz.contains(&frequency_mhz)
    }

    pub fn supports_frequency_and_width(&self, frequency_mhz: u32, width: ChannelWidth) -> bool {
        if width.is_40mhz() && !self.supports_40mhz {
            return false;
        }
        self.supports_frequency(frequency_mhz)
    }

    /// Convenience constructor for an emulated card supporting the full
    /// channel tables.
    pub fn emulated(name: &str) -> Self {
        let supported = crate::channel::all_channels()
            .iter()
            .map(|c: &WifiChannel| c.frequency_mhz)
            .collect();
        Self {
            name: name.to_string(),
            card_type: WifiCardType::Emulated,
            supported_frequencies_mhz: supported,
            supports_40mhz: true,
            supports_injection: true,
        }
    }
}

/// Raw RX/TX counters as reported by the transport. Cumulative since
/// transport creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxTxCounters {
    /// All packets seen on the monitor interface, ours or not
    pub count_p_any: u64,
    /// Packets that decrypted / validated as belonging to this link
    pub count_p_valid: u64,
    /// Packets injected by us
    pub count_tx_injected: u64,
    /// Injection errors reported by the driver
    pub count_tx_errors: u64,
}

/// The raw 802.11 frame send/receive primitive consumed by the link
/// controller. All hardware-mutating calls may block for up to hundreds
/// of milliseconds and may fail; failures must never crash the worker
/// loop.
pub trait RadioTransport: Send + Sync {
    /// Broadcast a management frame (fire and forget).
    fn send_management_frame(&self, data: &[u8]) -> Result<()>;

    /// Blocking receive of the next management frame, up to `timeout`.
    /// Returns Ok(None) on timeout.
    fn recv_management_frame(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Current cumulative RX/TX counters.
    fn counters(&self) -> Result<RxTxCounters>;

    /// Tune all cards to the given frequency and width. Slow.
    fn set_frequency_and_width(&self, frequency_mhz: u32, width: ChannelWidth) -> Result<()>;

    /// Set tx power in mW (non-rtl8812au hardware).
    fn set_tx_power_mw(&self, tx_power_mw: u32) -> Result<()>;

    /// Set the rtl8812au tx power index override.
    fn set_tx_power_index(&self, index: u32) -> Result<()>;

    /// Set the MCS index used for injection.
    fn set_mcs_index(&self, mcs_index: u8) -> Result<()>;

    /// Disable injection entirely, the unit becomes a passive listener.
    fn set_listen_only(&self, enabled: bool) -> Result<()>;

    /// Developer knob: ask the injection layer for an aggressive
    /// retransmit count.
    fn set_high_retransmit_count(&self, enabled: bool) -> Result<()>;
}

/// The fixed, ordered set of cards participating in the link. The first
/// card is the primary (TX + RX); any further cards are RX-only.
#[derive(Debug, Clone)]
pub struct RadioSet {
    cards: Vec<WifiCard>,
}

impl RadioSet {
    pub fn new(cards: Vec<WifiCard>) -> Result<Self> {
        if cards.is_empty() {
            return Err(LinkError::Config("at least one broadcast card required".to_string()));
        }
        if !cards[0].supports_injection {
            return Err(LinkError::Config(format!(
                "primary card {} does not support injection",
                cards[0].name
            )));
        }
        Ok(Self { cards })
    }

    pub fn primary(&self) -> &WifiCard {
        &self.cards[0]
    }

    pub fn cards(&self) -> &[WifiCard] {
        &self.cards
    }

    pub fn card_names(&self) -> Vec<String> {
        self.cards.iter().map(|c| c.name.clone()).collect()
    }

    pub fn all_cards_support_frequency(&self, frequency_mhz: u32) -> bool {
        self.cards.iter().all(|c| c.supports_frequency(frequency_mhz))
    }

    pub fn all_cards_support_frequency_and_width(&self, frequency_mhz: u32, width: ChannelWidth) -> bool {
        self.cards
            .iter()
            .all(|c| c.supports_frequency_and_width(frequency_mhz, width))
    }

    pub fn any_card_supports_frequency(&self, frequency_mhz: u32) -> bool {
        self.cards.iter().any(|c| c.supports_frequency(frequency_mhz))
    }

    pub fn has_any_rtl8812au(&self) -> bool {
        self.cards.iter().any(|c| c.card_type.is_rtl8812au_family())
    }

    pub fn has_any_non_rtl8812au(&self) -> bool {
        self.cards.iter().any(|c| !c.card_type.is_rtl8812au_family())
    }
}

/// Shared state of a pair of emulated radios (one air side, one ground
/// side) connected over an in-memory "ether".
#[derive(Debug, Default)]
struct EmulatedEther {
    air_to_ground: Mutex<VecDeque<Vec<u8>>>,
    ground_to_air: Mutex<VecDeque<Vec<u8>>>,
}

/// In-memory transport used by the daemon binary in emulation mode and
/// by the test suite. Counters can be advanced and hardware failures
/// injected from the outside.
pub struct EmulatedRadio {
    ether: Arc<EmulatedEther>,
    is_air: bool,
    fail_hardware: AtomicBool,
    count_p_any: AtomicU64,
    count_p_valid: AtomicU64,
    count_tx_injected: AtomicU64,
    state: Mutex<EmulatedRadioState>,
}

#[derive(Debug, Clone, Copy)]
struct EmulatedRadioState {
    frequency_mhz: u32,
    width: ChannelWidth,
    tx_power_mw: u32,
    tx_power_index: u32,
    mcs_index: u8,
    listen_only: bool,
    high_retransmit: bool,
}

impl EmulatedRadio {
    /// Create a connected (air, ground) pair.
    pub fn new_pair() -> (Arc<Self>, Arc<Self>) {
        let ether = Arc::new(EmulatedEther::default());
        let mk = |is_air: bool, ether: Arc<EmulatedEther>| {
            Arc::new(Self {
                ether,
                is_air,
                fail_hardware: AtomicBool::new(false),
                count_p_any: AtomicU64::new(0),
                count_p_valid: AtomicU64::new(0),
                count_tx_injected: AtomicU64::new(0),
                state: Mutex::new(EmulatedRadioState {
                    frequency_mhz: crate::DEFAULT_5GHZ_FREQUENCY,
                    width: ChannelWidth::Mhz20,
                    tx_power_mw: crate::DEFAULT_TX_POWER_MILLI_WATT,
                    tx_power_index: 0,
                    mcs_index: crate::DEFAULT_MCS_INDEX,
                    listen_only: false,
                    high_retransmit: false,
                }),
            })
        };
        (mk(true, ether.clone()), mk(false, ether))
    }

    /// Make every subsequent hardware-mutating call fail.
    pub fn set_fail_hardware(&self, fail: bool) {
        self.fail_hardware.store(fail, Ordering::SeqCst);
    }

    /// Advance the raw RX counters, as a real driver would while traffic
    /// flows.
    pub fn advance_counters(&self, any: u64, valid: u64) {
        self.count_p_any.fetch_add(any, Ordering::SeqCst);
        self.count_p_valid.fetch_add(valid, Ordering::SeqCst);
    }

    pub fn current_frequency(&self) -> u32 {
        self.state.lock().unwrap().frequency_mhz
    }

    pub fn current_width(&self) -> ChannelWidth {
        self.state.lock().unwrap().width
    }

    pub fn current_mcs_index(&self) -> u8 {
        self.state.lock().unwrap().mcs_index
    }

    pub fn current_tx_power_mw(&self) -> u32 {
        self.state.lock().unwrap().tx_power_mw
    }

    pub fn current_tx_power_index(&self) -> u32 {
        self.state.lock().unwrap().tx_power_index
    }

    pub fn is_listen_only(&self) -> bool {
        self.state.lock().unwrap().listen_only
    }

    pub fn is_high_retransmit(&self) -> bool {
        self.state.lock().unwrap().high_retransmit
    }

    fn check_hardware(&self) -> Result<()> {
        if self.fail_hardware.load(Ordering::SeqCst) {
            return Err(LinkError::Hardware("emulated driver failure".to_string()));
        }
        Ok(())
    }
}

impl RadioTransport for EmulatedRadio {
    fn send_management_frame(&self, data: &[u8]) -> Result<()> {
        self.count_tx_injected.fetch_add(1, Ordering::SeqCst);
        let queue = if self.is_air {
            &self.ether.air_to_ground
        } else {
            &self.ether.ground_to_air
        };
        queue.lock().unwrap().push_back(data.to_vec());
        Ok(())
    }

    fn recv_management_frame(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let queue = if self.is_air {
            &self.ether.ground_to_air
        } else {
            &self.ether.air_to_ground
        };
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = queue.lock().unwrap().pop_front() {
                self.count_p_any.fetch_add(1, Ordering::SeqCst);
                self.count_p_valid.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(frame));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn counters(&self) -> Result<RxTxCounters> {
        self.check_hardware().map_err(|_| LinkError::Transport("emulated counter read failure".to_string()))?;
        Ok(RxTxCounters {
            count_p_any: self.count_p_any.load(Ordering::SeqCst),
            count_p_valid: self.count_p_valid.load(Ordering::SeqCst),
            count_tx_injected: self.count_tx_injected.load(Ordering::SeqCst),
            count_tx_errors: 0,
        })
    }

    fn set_frequency_and_width(&self, frequency_mhz: u32, width: ChannelWidth) -> Result<()> {
        self.check_hardware()?;
        let mut state = self.state.lock().unwrap();
        state.frequency_mhz = frequency_mhz;
        state.width = width;
        Ok(())
    }

    fn set_tx_power_mw(&self, tx_power_mw: u32) -> Result<()> {
        self.check_hardware()?;
        self.state.lock().unwrap().tx_power_mw = tx_power_mw;
        Ok(())
    }

    fn set_tx_power_index(&self, index: u32) -> Result<()> {
        self.check_hardware()?;
        self.state.lock().unwrap().tx_power_index = index;
        Ok(())
    }

    fn set_mcs_index(&self, mcs_index: u8) -> Result<()> {
        self.check_hardware()?;
        self.state.lock().unwrap().mcs_index = mcs_index;
        Ok(())
    }

    fn set_listen_only(&self, enabled: bool) -> Result<()> {
        self.check_hardware()?;
        self.state.lock().unwrap().listen_only = enabled;
        Ok(())
    }

    fn set_high_retransmit_count(&self, enabled: bool) -> Result<()> {
        self.check_hardware()?;
        self.state.lock().unwrap().high_retransmit = enabled;
        Ok(())
    }
}
