//! Persisted link parameters
//!
//! Parameters survive reboots as JSON files under a settings directory.
//! A missing or corrupt file is replaced with defaults instead of failing
//! startup; every successful mutation is persisted immediately.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::radio::RadioSet;
use crate::{
    Result, DEFAULT_2GHZ_FREQUENCY, DEFAULT_5GHZ_FREQUENCY, DEFAULT_CHANNEL_WIDTH_MHZ,
    DEFAULT_FEC_PERCENTAGE, DEFAULT_MCS_INDEX, DEFAULT_TX_POWER_MILLI_WATT,
};

/// Default rtl8812au TX power index when the override path is active.
pub const DEFAULT_TX_POWER_INDEX: u32 = 22;
/// 0 disables the armed variant of a TX power setting (the unarmed value
/// is used regardless of arming state).
pub const ARMED_POWER_DISABLED: u32 = 0;

/// All persisted link parameters.
///
/// TX power has two paths: `tx_power_milli_watt` for cards with a sane
/// mW control, `rtl8812au_tx_power_index_override` for the rtl8812au
/// family where the raw index is the only reliable knob. The hardware
/// class decides which path is effective, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParameters {
    pub frequency_mhz: u32,
    /// TX channel width of the air unit, 20 or 40 (MHz). The ground unit
    /// follows via the management channel.
    pub air_tx_channel_width: u8,
    pub air_mcs_index: u8,
    pub tx_power_milli_watt: u32,
    /// TX power while armed, 0 = same as unarmed.
    pub tx_power_milli_watt_armed: u32,
    pub rtl8812au_tx_power_index_override: u32,
    /// TX power index while armed, 0 = same as unarmed.
    pub rtl8812au_tx_power_index_override_armed: u32,
    pub fec_percentage: u8,
    /// Fixed FEC block length, 0 = auto.
    pub fec_block_length: u8,
    /// Percentage of the theoretical max rate handed to the encoder,
    /// for users whose environment never achieves the bench numbers.
    pub rate_for_mcs_adjustment_percent: u8,
    pub variable_bitrate_enabled: bool,
    /// Ground: never transmit, only listen.
    pub listen_only_mode: bool,
    /// RC channel number (1-based) controlling the MCS index, 0 = off.
    pub mcs_via_rc_channel: u8,
    /// RC channel number (1-based) controlling the channel width, 0 = off.
    pub bw_via_rc_channel: u8,
    /// Dev: tell the injection layer to use a high retransmit count.
    pub dev_high_retransmit_count: bool,
}

impl Default for LinkParameters {
    fn default() -> Self {
        Self {
            frequency_mhz: DEFAULT_5GHZ_FREQUENCY,
            air_tx_channel_width: DEFAULT_CHANNEL_WIDTH_MHZ,
            air_mcs_index: DEFAULT_MCS_INDEX,
            tx_power_milli_watt: DEFAULT_TX_POWER_MILLI_WATT,
            tx_power_milli_watt_armed: ARMED_POWER_DISABLED,
            rtl8812au_tx_power_index_override: DEFAULT_TX_POWER_INDEX,
            rtl8812au_tx_power_index_override_armed: ARMED_POWER_DISABLED,
            fec_percentage: DEFAULT_FEC_PERCENTAGE,
            fec_block_length: 0,
            rate_for_mcs_adjustment_percent: 100,
            variable_bitrate_enabled: true,
            listen_only_mode: false,
            mcs_via_rc_channel: 0,
            bw_via_rc_channel: 0,
            dev_high_retransmit_count: false,
        }
    }
}

/// Defaults adjusted to what the cards can actually do: cards without
/// 5.8 GHz support start on a 2.4 GHz channel.
pub fn default_link_parameters(radios: &RadioSet) -> LinkParameters {
    let mut params = LinkParameters::default();
    if !radios.all_cards_support_frequency(DEFAULT_5GHZ_FREQUENCY)
        && radios.all_cards_support_frequency(DEFAULT_2GHZ_FREQUENCY)
    {
        log::info!("cards lack 5.8 GHz support, defaulting to 2.4 GHz");
        params.frequency_mhz = DEFAULT_2GHZ_FREQUENCY;
    }
    params
}

/// Platform networking parameters, second settings group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkingParameters {
    /// Allow the ground unit to bring up a WiFi hotspot as a fallback.
    pub hotspot_enabled: bool,
    /// Seconds without valid link traffic before the hotspot fallback
    /// triggers.
    pub hotspot_fallback_timeout_seconds: u32,
}

impl Default for NetworkingParameters {
    fn default() -> Self {
        Self { hotspot_enabled: false, hotspot_fallback_timeout_seconds: 30 }
    }
}

/// Generic JSON-file persistence for a settings struct.
pub struct SettingsStore<T> {
    path: PathBuf,
    value: T,
}

impl<T: Serialize + DeserializeOwned + Default> SettingsStore<T> {
    /// Load the settings file under `base_dir`, falling back to (and
    /// writing) defaults if it is absent or unreadable.
    pub fn open(base_dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let path = base_dir.join(format!("{}.json", name));
        let value = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("corrupt settings file {:?} ({}), rewriting defaults", path, e);
                    T::default()
                }
            },
            Err(_) => {
                log::info!("no settings file at {:?}, using defaults", path);
                T::default()
            }
        };
        let mut store = Self { path, value };
        store.persist()?;
        Ok(store)
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutate the settings and persist the result.
    pub fn update(&mut self, mutate: impl FnOnce(&mut T)) -> Result<()> {
        mutate(&mut self.value);
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.value)
            .map_err(|e| crate::LinkError::Config(format!("cannot serialize settings: {}", e)))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Callback applying a new integer value for one setting, validating it
/// first.
pub type SettingCallback = Box<dyn Fn(i64) -> Result<()> + Send + Sync>;

/// One externally visible setting: stable id, current value, apply hook.
/// The ids mirror the names ground stations already know.
pub struct Setting {
    pub id: &'static str,
    pub value: i64,
    pub on_change: SettingCallback,
}

impl Setting {
    pub fn new(id: &'static str, value: i64, on_change: SettingCallback) -> Self {
        Self { id, value, on_change }
    }
}

pub const SETTING_FREQUENCY: &str = "WB_FREQUENCY";
pub const SETTING_CHANNEL_WIDTH: &str = "WB_CHANNEL_W";
pub const SETTING_MCS_INDEX: &str = "WB_MCS_INDEX";
pub const SETTING_TX_POWER_MW: &str = "TX_POWER_MW";
pub const SETTING_TX_POWER_MW_ARMED: &str = "TX_POWER_MW_ARM";
pub const SETTING_TX_POWER_INDEX: &str = "TX_POWER_I";
pub const SETTING_TX_POWER_INDEX_ARMED: &str = "TX_POWER_I_ARM";
pub const SETTING_FEC_PERCENTAGE: &str = "WB_V_FEC_PERC";
pub const SETTING_FEC_BLOCK_LENGTH: &str = "WB_V_FEC_BLK_L";
pub const SETTING_RATE_ADJUSTMENT_PERCENT: &str = "WB_V_RATE_PERC";
pub const SETTING_VARIABLE_BITRATE: &str = "VARIABLE_BITRATE";
pub const SETTING_MCS_VIA_RC: &str = "MCS_VIA_RC";
pub const SETTING_BW_VIA_RC: &str = "BW_VIA_RC";
pub const SETTING_LISTEN_ONLY: &str = "WB_LISTEN_ONLY";
pub const SETTING_DEV_HIGH_RETRANSMIT: &str = "DEV_HIGH_RETR";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wb_link_settings_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_load_or_default_and_persist() {
        let dir = temp_dir("roundtrip");
        let mut store: SettingsStore<LinkParameters> = SettingsStore::open(&dir, "link").unwrap();
        assert_eq!(store.get().frequency_mhz, DEFAULT_5GHZ_FREQUENCY);
        store.update(|p| p.frequency_mhz = 5785).unwrap();
        drop(store);
        let store: SettingsStore<LinkParameters> = SettingsStore::open(&dir, "link").unwrap();
        assert_eq!(store.get().frequency_mhz, 5785);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_file_rewritten_with_defaults() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("link.json"), "not json at all").unwrap();
        let store: SettingsStore<LinkParameters> = SettingsStore::open(&dir, "link").unwrap();
        assert_eq!(store.get(), &LinkParameters::default());
        // the corrupt file was replaced
        let content = fs::read_to_string(dir.join("link.json")).unwrap();
        assert!(serde_json::from_str::<LinkParameters>(&content).is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_setting_callback_applies() {
        let applied = std::sync::Arc::new(AtomicU64::new(0));
        let applied2 = applied.clone();
        let setting = Setting::new(
            SETTING_FREQUENCY,
            5745,
            Box::new(move |value| {
                applied2.store(value as u64, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert_eq!(setting.id, "WB_FREQUENCY");
        (setting.on_change)(5785).unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 5785);
    }
}
