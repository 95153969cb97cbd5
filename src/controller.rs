//! Link controller and worker loop
//!
//! Single public entry point for mutating the link. Every request is
//! validated on the caller's thread, then either rejected (invalid value,
//! or another operation still in flight) or enqueued for the worker
//! thread. A positive return value acknowledges the request, not its
//! completion on the hardware.
//!
//! The worker thread owns all hardware access. Per iteration it executes
//! at most one ready work item, recomputes statistics on a fixed
//! interval, runs the variable bitrate logic, applies RC channel
//! overrides, mirrors the air-reported channel width (ground), reapplies
//! TX power on arming transitions and drives the hotspot fallback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::actions::LinkContext;
use crate::channel::{
    find_channel, frequency_to_space, is_valid_channel_width, is_valid_fec_block_length,
    is_valid_fec_percentage, is_valid_mcs_index, is_valid_tx_power_index_override,
    is_valid_tx_power_milli_watt, ChannelWidth, WifiSpace,
};
use crate::management::{ManagementAir, ManagementGround};
use crate::radio::{RadioSet, RadioTransport};
use crate::rates::{deduce_fec_overhead, max_rate_possible, multiply_by_percent};
use crate::settings::{
    default_link_parameters, LinkParameters, NetworkingParameters, Setting, SettingsStore,
    ARMED_POWER_DISABLED, SETTING_BW_VIA_RC, SETTING_CHANNEL_WIDTH, SETTING_DEV_HIGH_RETRANSMIT,
    SETTING_FEC_BLOCK_LENGTH, SETTING_FEC_PERCENTAGE, SETTING_FREQUENCY, SETTING_LISTEN_ONLY,
    SETTING_MCS_INDEX, SETTING_MCS_VIA_RC, SETTING_RATE_ADJUSTMENT_PERCENT,
    SETTING_TX_POWER_INDEX, SETTING_TX_POWER_INDEX_ARMED, SETTING_TX_POWER_MW,
    SETTING_TX_POWER_MW_ARMED, SETTING_VARIABLE_BITRATE,
};
use crate::stats::{AnalyzeResult, LinkStatistics, ScanProgress, MAX_VIDEO_STREAMS};
use crate::trackers::{ForeignTrafficTracker, FrameDropTracker};
use crate::work::{WorkItem, WorkQueue};
use crate::{LinkError, Result};

/// How often the statistics snapshot is recomputed.
pub const STATS_RECALC_INTERVAL: Duration = Duration::from_millis(500);
const WORKER_LOOP_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_SCAN_DWELL: Duration = Duration::from_secs(1);

/// Rate adjustment step, percent points per reduction / increase.
const RATE_ADJUSTMENT_STEP: u32 = 10;
const RATE_ADJUSTMENT_MIN_PERCENT: u32 = 20;
/// Grace period after a reduction during which further drops are ignored.
const RATE_REDUCTION_GRACE: Duration = Duration::from_secs(3);
/// Minimum time at a stable rate before trying to raise it again.
const RATE_INCREASE_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive consistent air width reports before the ground follows.
const GND_WIDTH_DEBOUNCE_COUNT: u32 = 3;
/// Consecutive counter read failures before the radio is declared dead.
const MAX_CONSECUTIVE_COUNTER_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Air,
    Ground,
}

impl LinkRole {
    pub fn name(&self) -> &'static str {
        match self {
            LinkRole::Air => "air",
            LinkRole::Ground => "ground",
        }
    }
}

/// Which parts of the spectrum a channel scan / analysis covers.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub check_2g: bool,
    pub check_5g: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { check_2g: false, check_5g: true }
    }
}

/// Construction-time knobs. The intervals exist so tests can run the
/// worker loop at full speed; production uses the defaults.
pub struct LinkConfig {
    pub role: LinkRole,
    pub settings_dir: PathBuf,
    pub stats_interval: Duration,
    pub loop_interval: Duration,
    pub scan_dwell: Duration,
}

impl LinkConfig {
    pub fn new(role: LinkRole, settings_dir: PathBuf) -> Self {
        Self {
            role,
            settings_dir,
            stats_interval: STATS_RECALC_INTERVAL,
            loop_interval: WORKER_LOOP_INTERVAL,
            scan_dwell: DEFAULT_SCAN_DWELL,
        }
    }
}

pub struct LinkController {
    shared: Arc<ControllerShared>,
    worker: Option<JoinHandle<()>>,
}

struct ControllerShared {
    role: LinkRole,
    radios: RadioSet,
    transport: Arc<dyn RadioTransport>,
    context: Arc<LinkContext>,
    settings: Mutex<SettingsStore<LinkParameters>>,
    networking: Mutex<SettingsStore<NetworkingParameters>>,
    queue: WorkQueue,
    frame_drop: Mutex<FrameDropTracker>,
    /// Cumulative dropped frames per video stream, for the statistics
    /// snapshot. The windowed rate logic lives in `frame_drop`.
    dropped_frames: [AtomicU32; MAX_VIDEO_STREAMS],
    /// Set while a channel scan / analysis is pending or running; all
    /// requests are rejected with Busy for its duration.
    long_operation: AtomicBool,
    run: AtomicBool,
    management_air: Option<ManagementAir>,
    management_ground: Option<ManagementGround>,
    stats_interval: Duration,
    loop_interval: Duration,
    scan_dwell: Duration,
}

impl LinkController {
    pub fn new(
        config: LinkConfig,
        radios: RadioSet,
        transport: Arc<dyn RadioTransport>,
        context: Arc<LinkContext>,
    ) -> Result<Self> {
        let mut settings: SettingsStore<LinkParameters> =
            SettingsStore::open(&config.settings_dir, "wb_link")?;
        // A settings file written for different hardware may ask for a
        // frequency the current cards cannot do.
        if !radios.all_cards_support_frequency(settings.get().frequency_mhz) {
            log::warn!(
                "persisted frequency {} MHz unsupported by the current cards, resetting",
                settings.get().frequency_mhz
            );
            let defaults = default_link_parameters(&radios);
            settings.update(|p| *p = defaults)?;
        }
        let networking: SettingsStore<NetworkingParameters> =
            SettingsStore::open(&config.settings_dir, "networking")?;

        let params = settings.get().clone();
        let initial_width = ChannelWidth::from_mhz(params.air_tx_channel_width)?;
        let (management_air, management_ground) = match config.role {
            LinkRole::Air => {
                let mut air =
                    ManagementAir::new(transport.clone(), params.frequency_mhz, initial_width);
                air.start()?;
                (Some(air), None)
            }
            LinkRole::Ground => {
                let mut ground = ManagementGround::new(transport.clone());
                ground.start()?;
                (None, Some(ground))
            }
        };

        let shared = Arc::new(ControllerShared {
            role: config.role,
            radios,
            transport,
            context,
            settings: Mutex::new(settings),
            networking: Mutex::new(networking),
            queue: WorkQueue::new(),
            frame_drop: Mutex::new(FrameDropTracker::new()),
            dropped_frames: Default::default(),
            long_operation: AtomicBool::new(false),
            run: AtomicBool::new(true),
            management_air,
            management_ground,
            stats_interval: config.stats_interval,
            loop_interval: config.loop_interval,
            scan_dwell: config.scan_dwell,
        });

        // bring the hardware to the persisted state before the worker runs
        if let Err(e) = shared.apply_rf_state(&params) {
            log::warn!("cannot apply initial RF state: {}", e);
        }

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("wb_link_worker".to_string())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| LinkError::Config(format!("cannot spawn worker thread: {}", e)))?;

        log::info!(
            "link controller up, role {}, cards [{}]",
            shared.role.name(),
            shared.radios.card_names().join(", ")
        );
        Ok(Self { shared, worker: Some(worker) })
    }

    pub fn role(&self) -> LinkRole {
        self.shared.role
    }

    /// Last published statistics snapshot.
    pub fn stats(&self) -> LinkStatistics {
        self.shared.context.events.get_stats()
    }

    pub fn current_parameters(&self) -> LinkParameters {
        self.shared.params_snapshot()
    }

    /// Report frames the encoder had to drop because the link could not
    /// keep up. Feeds the variable bitrate logic and the per-stream
    /// counters in the statistics snapshot.
    pub fn notify_dropped_frames(&self, stream_index: u8, n_dropped: u32) {
        self.shared.frame_drop.lock().unwrap().notify_dropped_frame(n_dropped);
        let slot = (stream_index as usize).min(MAX_VIDEO_STREAMS - 1);
        self.shared.dropped_frames[slot].fetch_add(n_dropped, Ordering::Relaxed);
    }

    pub fn request_set_frequency(&self, frequency_mhz: u32) -> Result<()> {
        ControllerShared::request_set_frequency(&self.shared, frequency_mhz)
    }

    pub fn request_set_air_tx_channel_width(&self, channel_width_mhz: u8) -> Result<()> {
        ControllerShared::request_set_air_tx_channel_width(&self.shared, channel_width_mhz)
    }

    pub fn request_set_tx_power_mw(&self, tx_power_mw: u32) -> Result<()> {
        ControllerShared::request_set_tx_power_mw(&self.shared, tx_power_mw)
    }

    pub fn request_set_tx_power_index(&self, index: u32) -> Result<()> {
        ControllerShared::request_set_tx_power_index(&self.shared, index)
    }

    pub fn request_set_air_mcs_index(&self, mcs_index: u8) -> Result<()> {
        ControllerShared::request_set_air_mcs_index(&self.shared, mcs_index)
    }

    pub fn request_start_scan_channels(&self, options: ScanOptions) -> Result<()> {
        ControllerShared::request_start_scan_channels(&self.shared, options)
    }

    pub fn request_start_analyze_channels(&self, options: ScanOptions) -> Result<()> {
        ControllerShared::request_start_analyze_channels(&self.shared, options)
    }

    pub fn set_fec_percentage(&self, fec_percentage: u8) -> Result<()> {
        self.shared.set_fec_percentage(fec_percentage)
    }

    pub fn set_fec_block_length(&self, block_length: u8) -> Result<()> {
        self.shared.set_fec_block_length(block_length)
    }

    pub fn set_rate_for_mcs_adjustment_percent(&self, percent: u8) -> Result<()> {
        self.shared.set_rate_for_mcs_adjustment_percent(percent)
    }

    pub fn set_variable_bitrate_enabled(&self, enabled: bool) -> Result<()> {
        self.shared.update_settings(|p| p.variable_bitrate_enabled = enabled)
    }

    pub fn set_mcs_via_rc_channel(&self, channel: u8) -> Result<()> {
        self.shared.set_rc_channel_mapping(channel, true)
    }

    pub fn set_bw_via_rc_channel(&self, channel: u8) -> Result<()> {
        self.shared.set_rc_channel_mapping(channel, false)
    }

    pub fn set_listen_only_mode(&self, enabled: bool) -> Result<()> {
        self.shared.update_settings(|p| p.listen_only_mode = enabled)
    }

    pub fn set_dev_high_retransmit_count(&self, enabled: bool) -> Result<()> {
        self.shared.update_settings(|p| p.dev_high_retransmit_count = enabled)
    }

    /// The full settings surface for ground station UIs: stable ids plus
    /// validate-and-apply hooks.
    pub fn get_all_settings(&self) -> Vec<Setting> {
        let params = self.shared.params_snapshot();
        let mut settings = Vec::new();
        let s = &self.shared;

        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_FREQUENCY,
            params.frequency_mhz as i64,
            Box::new(move |v| ControllerShared::request_set_frequency(&shared, v as u32)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_CHANNEL_WIDTH,
            params.air_tx_channel_width as i64,
            Box::new(move |v| ControllerShared::request_set_air_tx_channel_width(&shared, v as u8)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_MCS_INDEX,
            params.air_mcs_index as i64,
            Box::new(move |v| ControllerShared::request_set_air_mcs_index(&shared, v as u8)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_TX_POWER_MW,
            params.tx_power_milli_watt as i64,
            Box::new(move |v| ControllerShared::request_set_tx_power_mw(&shared, v as u32)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_TX_POWER_MW_ARMED,
            params.tx_power_milli_watt_armed as i64,
            Box::new(move |v| shared.set_tx_power_mw_armed(v)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_TX_POWER_INDEX,
            params.rtl8812au_tx_power_index_override as i64,
            Box::new(move |v| ControllerShared::request_set_tx_power_index(&shared, v as u32)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_TX_POWER_INDEX_ARMED,
            params.rtl8812au_tx_power_index_override_armed as i64,
            Box::new(move |v| shared.set_tx_power_index_armed(v)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_FEC_PERCENTAGE,
            params.fec_percentage as i64,
            Box::new(move |v| shared.set_fec_percentage(v as u8)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_FEC_BLOCK_LENGTH,
            params.fec_block_length as i64,
            Box::new(move |v| shared.set_fec_block_length(v as u8)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_RATE_ADJUSTMENT_PERCENT,
            params.rate_for_mcs_adjustment_percent as i64,
            Box::new(move |v| shared.set_rate_for_mcs_adjustment_percent(v as u8)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_VARIABLE_BITRATE,
            params.variable_bitrate_enabled as i64,
            Box::new(move |v| shared.update_settings(|p| p.variable_bitrate_enabled = v != 0)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_MCS_VIA_RC,
            params.mcs_via_rc_channel as i64,
            Box::new(move |v| shared.set_rc_channel_mapping(v as u8, true)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_BW_VIA_RC,
            params.bw_via_rc_channel as i64,
            Box::new(move |v| shared.set_rc_channel_mapping(v as u8, false)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_LISTEN_ONLY,
            params.listen_only_mode as i64,
            Box::new(move |v| shared.update_settings(|p| p.listen_only_mode = v != 0)),
        ));
        let shared = s.clone();
        settings.push(Setting::new(
            SETTING_DEV_HIGH_RETRANSMIT,
            params.dev_high_retransmit_count as i64,
            Box::new(move |v| shared.update_settings(|p| p.dev_high_retransmit_count = v != 0)),
        ));
        settings
    }
}

impl Drop for LinkController {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ControllerShared {
    fn params_snapshot(&self) -> LinkParameters {
        self.settings.lock().unwrap().get().clone()
    }

    fn update_settings(&self, mutate: impl FnOnce(&mut LinkParameters)) -> Result<()> {
        self.settings.lock().unwrap().update(mutate)
    }

    fn guard_not_busy(&self) -> Result<()> {
        if self.long_operation.load(Ordering::SeqCst) {
            return Err(LinkError::Busy);
        }
        Ok(())
    }

    /// Apply frequency, width, MCS, TX power and injection flags from a
    /// parameter set.
    fn apply_rf_state(&self, params: &LinkParameters) -> Result<()> {
        let width = ChannelWidth::from_mhz(params.air_tx_channel_width)?;
        self.transport.set_frequency_and_width(params.frequency_mhz, width)?;
        self.transport.set_mcs_index(params.air_mcs_index)?;
        self.apply_tx_power(params, self.context.arming.is_armed())?;
        self.transport.set_listen_only(params.listen_only_mode)?;
        self.transport.set_high_retransmit_count(params.dev_high_retransmit_count)?;
        Ok(())
    }

    /// Effective TX power as (mW, index). Exactly one side is non-zero:
    /// the rtl8812au family only reacts reliably to the raw power index,
    /// everything else takes mW.
    fn effective_tx_power(&self, params: &LinkParameters, armed: bool) -> (u32, u32) {
        if self.radios.primary().card_type.is_rtl8812au_family() {
            let mut index = params.rtl8812au_tx_power_index_override;
            if armed && params.rtl8812au_tx_power_index_override_armed != ARMED_POWER_DISABLED {
                index = params.rtl8812au_tx_power_index_override_armed;
            }
            (0, index)
        } else {
            let mut milli_watt = params.tx_power_milli_watt;
            if armed && params.tx_power_milli_watt_armed != ARMED_POWER_DISABLED {
                milli_watt = params.tx_power_milli_watt_armed;
            }
            (milli_watt, 0)
        }
    }

    fn apply_tx_power(&self, params: &LinkParameters, armed: bool) -> Result<()> {
        let (milli_watt, index) = self.effective_tx_power(params, armed);
        if self.radios.primary().card_type.is_rtl8812au_family() {
            log::debug!("applying tx power index {} (armed: {})", index, armed);
            self.transport.set_tx_power_index(index)
        } else {
            log::debug!("applying tx power {} mW (armed: {})", milli_watt, armed);
            self.transport.set_tx_power_mw(milli_watt)
        }
    }

    fn request_set_frequency(this: &Arc<Self>, frequency_mhz: u32) -> Result<()> {
        this.guard_not_busy()?;
        if find_channel(frequency_mhz).is_none() {
            return Err(LinkError::InvalidParameter(format!(
                "unknown frequency {} MHz",
                frequency_mhz
            )));
        }
        let width = ChannelWidth::from_mhz(this.params_snapshot().air_tx_channel_width)
            .unwrap_or(ChannelWidth::Mhz20);
        if !this.radios.all_cards_support_frequency_and_width(frequency_mhz, width) {
            return Err(LinkError::InvalidParameter(format!(
                "frequency {} MHz not supported by all cards at {}",
                frequency_mhz,
                width.name()
            )));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "set_frequency",
            move || {
                let params = shared.params_snapshot();
                let width = match ChannelWidth::from_mhz(params.air_tx_channel_width) {
                    Ok(width) => width,
                    Err(_) => ChannelWidth::Mhz20,
                };
                match shared.transport.set_frequency_and_width(frequency_mhz, width) {
                    Ok(()) => {
                        log::info!("frequency changed to {} MHz", frequency_mhz);
                        if let Err(e) = shared.update_settings(|p| p.frequency_mhz = frequency_mhz)
                        {
                            log::warn!("cannot persist frequency change: {}", e);
                        }
                        if let Some(air) = &shared.management_air {
                            air.set_frequency(frequency_mhz);
                        }
                    }
                    Err(e) => log::warn!("frequency change to {} MHz failed: {}", frequency_mhz, e),
                }
            },
            Instant::now(),
        ))
    }

    fn request_set_air_tx_channel_width(this: &Arc<Self>, channel_width_mhz: u8) -> Result<()> {
        this.guard_not_busy()?;
        if this.role != LinkRole::Air {
            return Err(LinkError::InvalidParameter(
                "channel width is controlled by the air unit".to_string(),
            ));
        }
        if !is_valid_channel_width(channel_width_mhz as u32) {
            return Err(LinkError::InvalidParameter(format!(
                "invalid channel width {} MHz",
                channel_width_mhz
            )));
        }
        let width = ChannelWidth::from_mhz(channel_width_mhz)?;
        if width.is_40mhz() && !this.radios.cards().iter().all(|c| c.supports_40mhz) {
            return Err(LinkError::InvalidParameter(
                "not all cards support 40 MHz".to_string(),
            ));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "set_channel_width",
            move || {
                let params = shared.params_snapshot();
                match shared.transport.set_frequency_and_width(params.frequency_mhz, width) {
                    Ok(()) => {
                        log::info!("channel width changed to {}", width.name());
                        if let Err(e) =
                            shared.update_settings(|p| p.air_tx_channel_width = width.mhz())
                        {
                            log::warn!("cannot persist channel width change: {}", e);
                        }
                        if let Some(air) = &shared.management_air {
                            air.set_channel_width(width);
                        }
                    }
                    Err(e) => log::warn!("channel width change failed: {}", e),
                }
            },
            Instant::now(),
        ))
    }

    fn request_set_tx_power_mw(this: &Arc<Self>, tx_power_mw: u32) -> Result<()> {
        this.guard_not_busy()?;
        if !is_valid_tx_power_milli_watt(tx_power_mw as i64) {
            return Err(LinkError::InvalidParameter(format!(
                "invalid tx power {} mW",
                tx_power_mw
            )));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "set_tx_power_mw",
            move || {
                let mut params = shared.params_snapshot();
                params.tx_power_milli_watt = tx_power_mw;
                let armed = shared.context.arming.is_armed();
                match shared.apply_tx_power(&params, armed) {
                    Ok(()) => {
                        log::info!("tx power changed to {} mW", tx_power_mw);
                        if let Err(e) =
                            shared.update_settings(|p| p.tx_power_milli_watt = tx_power_mw)
                        {
                            log::warn!("cannot persist tx power change: {}", e);
                        }
                    }
                    Err(e) => log::warn!("tx power change to {} mW failed: {}", tx_power_mw, e),
                }
            },
            Instant::now(),
        ))
    }

    fn request_set_tx_power_index(this: &Arc<Self>, index: u32) -> Result<()> {
        this.guard_not_busy()?;
        if !this.radios.has_any_rtl8812au() {
            return Err(LinkError::InvalidParameter(
                "tx power index requires a rtl8812au family card".to_string(),
            ));
        }
        if !is_valid_tx_power_index_override(index as i64) {
            return Err(LinkError::InvalidParameter(format!("invalid tx power index {}", index)));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "set_tx_power_index",
            move || {
                let mut params = shared.params_snapshot();
                params.rtl8812au_tx_power_index_override = index;
                let armed = shared.context.arming.is_armed();
                match shared.apply_tx_power(&params, armed) {
                    Ok(()) => {
                        log::info!("tx power index changed to {}", index);
                        if let Err(e) =
                            shared.update_settings(|p| p.rtl8812au_tx_power_index_override = index)
                        {
                            log::warn!("cannot persist tx power index change: {}", e);
                        }
                    }
                    Err(e) => log::warn!("tx power index change to {} failed: {}", index, e),
                }
            },
            Instant::now(),
        ))
    }

    fn request_set_air_mcs_index(this: &Arc<Self>, mcs_index: u8) -> Result<()> {
        this.guard_not_busy()?;
        if !is_valid_mcs_index(mcs_index as u32) {
            return Err(LinkError::InvalidParameter(format!("invalid MCS index {}", mcs_index)));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "set_mcs_index",
            move || match shared.transport.set_mcs_index(mcs_index) {
                Ok(()) => {
                    log::info!("MCS index changed to {}", mcs_index);
                    if let Err(e) = shared.update_settings(|p| p.air_mcs_index = mcs_index) {
                        log::warn!("cannot persist MCS change: {}", e);
                    }
                }
                Err(e) => log::warn!("MCS change to {} failed: {}", mcs_index, e),
            },
            Instant::now(),
        ))
    }

    fn scan_candidates(&self, options: ScanOptions) -> Vec<u32> {
        crate::channel::all_channels()
            .iter()
            .filter(|ch| match ch.space {
                WifiSpace::G2_4 => options.check_2g,
                WifiSpace::G5_8 => options.check_5g,
            })
            .filter(|ch| self.radios.any_card_supports_frequency(ch.frequency_mhz))
            .map(|ch| ch.frequency_mhz)
            .collect()
    }

    /// Sleep `dwell` in small steps so shutdown stays responsive.
    fn dwell(&self, dwell: Duration) {
        let deadline = Instant::now() + dwell;
        while self.run.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn request_start_scan_channels(this: &Arc<Self>, options: ScanOptions) -> Result<()> {
        this.guard_not_busy()?;
        if this.role != LinkRole::Ground {
            return Err(LinkError::InvalidParameter(
                "channel scan only runs on the ground unit".to_string(),
            ));
        }
        let candidates = this.scan_candidates(options);
        if candidates.is_empty() {
            return Err(LinkError::InvalidParameter("no channels to scan".to_string()));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "scan_channels",
            move || shared.run_scan(&candidates),
            Instant::now(),
        ))?;
        this.long_operation.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_scan(&self, candidates: &[u32]) {
        log::info!("scanning {} channels for an air unit", candidates.len());
        let original = self.params_snapshot();
        // scan narrowband, an air unit on 40 MHz is still visible
        let width = ChannelWidth::Mhz20;
        let total = candidates.len();
        let mut found: Option<u32> = None;
        for (i, &frequency_mhz) in candidates.iter().enumerate() {
            if !self.run.load(Ordering::SeqCst) {
                break;
            }
            let progress_percent = ((i + 1) * 100 / total) as u8;
            if let Err(e) = self.transport.set_frequency_and_width(frequency_mhz, width) {
                log::warn!("cannot tune to {} MHz: {}", frequency_mhz, e);
                continue;
            }
            let Ok(before) = self.transport.counters() else { continue };
            self.dwell(self.scan_dwell);
            let Ok(after) = self.transport.counters() else { continue };
            let valid = after.count_p_valid.saturating_sub(before.count_p_valid);
            let success = valid > 0;
            self.context.events.push_scan_progress(ScanProgress {
                frequency_mhz,
                channel_width_mhz: width.mhz(),
                progress_percent,
                success,
            });
            if success {
                log::info!("found air unit on {} MHz", frequency_mhz);
                found = Some(frequency_mhz);
                break;
            }
        }
        let final_frequency = match found {
            Some(frequency_mhz) => {
                if let Err(e) = self.update_settings(|p| p.frequency_mhz = frequency_mhz) {
                    log::warn!("cannot persist scan result: {}", e);
                }
                frequency_mhz
            }
            None => {
                log::info!("scan finished, no air unit found");
                original.frequency_mhz
            }
        };
        // leave the scan width behind, go back to the configured one
        let restore_width =
            ChannelWidth::from_mhz(original.air_tx_channel_width).unwrap_or(ChannelWidth::Mhz20);
        if let Err(e) = self.transport.set_frequency_and_width(final_frequency, restore_width) {
            log::warn!("cannot retune after scan: {}", e);
        }
        self.long_operation.store(false, Ordering::SeqCst);
    }

    fn request_start_analyze_channels(this: &Arc<Self>, options: ScanOptions) -> Result<()> {
        this.guard_not_busy()?;
        if this.role != LinkRole::Ground {
            return Err(LinkError::InvalidParameter(
                "channel analysis only runs on the ground unit".to_string(),
            ));
        }
        let candidates = this.scan_candidates(options);
        if candidates.is_empty() {
            return Err(LinkError::InvalidParameter("no channels to analyze".to_string()));
        }
        let shared = this.clone();
        this.queue.try_enqueue(WorkItem::new(
            "analyze_channels",
            move || shared.run_analyze(&candidates),
            Instant::now(),
        ))?;
        this.long_operation.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn run_analyze(&self, candidates: &[u32]) {
        log::info!("analyzing pollution on {} channels", candidates.len());
        let original = self.params_snapshot();
        let width = ChannelWidth::Mhz20;
        let total = candidates.len();
        for (i, &frequency_mhz) in candidates.iter().enumerate() {
            if !self.run.load(Ordering::SeqCst) {
                break;
            }
            let progress_percent = ((i + 1) * 100 / total) as u8;
            if let Err(e) = self.transport.set_frequency_and_width(frequency_mhz, width) {
                log::warn!("cannot tune to {} MHz: {}", frequency_mhz, e);
                continue;
            }
            let Ok(before) = self.transport.counters() else { continue };
            self.dwell(self.scan_dwell);
            let Ok(after) = self.transport.counters() else { continue };
            let any = after.count_p_any.saturating_sub(before.count_p_any);
            let valid = after.count_p_valid.saturating_sub(before.count_p_valid);
            self.context.events.push_analyze_result(AnalyzeResult {
                frequency_mhz,
                foreign_packets: any.saturating_sub(valid) as u32,
                progress_percent,
            });
        }
        // analysis never changes the link, always go back
        if let Ok(width) = ChannelWidth::from_mhz(original.air_tx_channel_width) {
            if let Err(e) = self.transport.set_frequency_and_width(original.frequency_mhz, width) {
                log::warn!("cannot restore frequency after analysis: {}", e);
            }
        }
        self.long_operation.store(false, Ordering::SeqCst);
    }

    fn set_fec_percentage(&self, fec_percentage: u8) -> Result<()> {
        if !is_valid_fec_percentage(fec_percentage as i64) {
            return Err(LinkError::InvalidParameter(format!(
                "invalid FEC percentage {}",
                fec_percentage
            )));
        }
        self.update_settings(|p| p.fec_percentage = fec_percentage)
    }

    fn set_fec_block_length(&self, block_length: u8) -> Result<()> {
        if !is_valid_fec_block_length(block_length as i64) {
            return Err(LinkError::InvalidParameter(format!(
                "invalid FEC block length {}",
                block_length
            )));
        }
        self.update_settings(|p| p.fec_block_length = block_length)
    }

    fn set_rate_for_mcs_adjustment_percent(&self, percent: u8) -> Result<()> {
        if percent == 0 || percent > 100 {
            return Err(LinkError::InvalidParameter(format!(
                "invalid rate adjustment percentage {}",
                percent
            )));
        }
        self.update_settings(|p| p.rate_for_mcs_adjustment_percent = percent)
    }

    fn set_rc_channel_mapping(&self, channel: u8, for_mcs: bool) -> Result<()> {
        if channel as usize > crate::rc_channels::N_RC_CHANNELS {
            return Err(LinkError::InvalidParameter(format!("invalid RC channel {}", channel)));
        }
        self.update_settings(|p| {
            if for_mcs {
                p.mcs_via_rc_channel = channel;
            } else {
                p.bw_via_rc_channel = channel;
            }
        })
    }

    fn set_tx_power_mw_armed(&self, value: i64) -> Result<()> {
        if value != ARMED_POWER_DISABLED as i64 && !is_valid_tx_power_milli_watt(value) {
            return Err(LinkError::InvalidParameter(format!("invalid armed tx power {} mW", value)));
        }
        self.update_settings(|p| p.tx_power_milli_watt_armed = value as u32)
    }

    fn set_tx_power_index_armed(&self, value: i64) -> Result<()> {
        if value != ARMED_POWER_DISABLED as i64 && !is_valid_tx_power_index_override(value) {
            return Err(LinkError::InvalidParameter(format!(
                "invalid armed tx power index {}",
                value
            )));
        }
        self.update_settings(|p| p.rtl8812au_tx_power_index_override_armed = value as u32)
    }
}

/// Worker-local state of the variable bitrate logic.
struct RateAdjustmentState {
    percent: u32,
    last_change: Instant,
    n_reductions: u32,
}

fn worker_loop(shared: Arc<ControllerShared>) {
    log::debug!("worker thread running");
    let mut foreign = ForeignTrafficTracker::new();
    let mut rate = RateAdjustmentState {
        percent: 100,
        last_change: Instant::now(),
        n_reductions: 0,
    };
    let mut last_stats_recalc = Instant::now() - shared.stats_interval;
    let mut last_armed = shared.context.arming.is_armed();
    let initial = shared.params_snapshot();
    let mut last_listen_only = initial.listen_only_mode;
    let mut last_high_retransmit = initial.dev_high_retransmit_count;
    let mut consecutive_counter_errors = 0u32;
    let mut last_valid_count = 0u64;
    let mut last_valid_change = Instant::now();
    let mut last_notified_rate = 0u32;
    // ground width mirroring debounce
    let mut mirror_last_report_ts: i64 = -1;
    let mut mirror_width: i64 = -1;
    let mut mirror_count = 0u32;

    while shared.run.load(Ordering::SeqCst) {
        if let Some(item) = shared.queue.take_ready(Instant::now()) {
            log::debug!("executing work item {:?}", item.tag());
            item.execute();
        }
        let params = shared.params_snapshot();

        if last_stats_recalc.elapsed() >= shared.stats_interval {
            last_stats_recalc = Instant::now();

            let counters = match shared.transport.counters() {
                Ok(counters) => {
                    consecutive_counter_errors = 0;
                    Some(counters)
                }
                Err(e) => {
                    consecutive_counter_errors += 1;
                    log::warn!("cannot read radio counters: {}", e);
                    if consecutive_counter_errors >= MAX_CONSECUTIVE_COUNTER_ERRORS {
                        shared.context.fatal.raise("radio stopped responding");
                    }
                    None
                }
            };
            if let Some(counters) = &counters {
                foreign.update(counters.count_p_any, counters.count_p_valid);
                if counters.count_p_valid != last_valid_count {
                    last_valid_count = counters.count_p_valid;
                    last_valid_change = Instant::now();
                }
            }

            // variable bitrate: react to dropped frames, then creep back up
            if params.variable_bitrate_enabled {
                let mut tracker = shared.frame_drop.lock().unwrap();
                if tracker.needs_bitrate_reduction() {
                    rate.percent =
                        rate.percent.saturating_sub(RATE_ADJUSTMENT_STEP).max(RATE_ADJUSTMENT_MIN_PERCENT);
                    rate.last_change = Instant::now();
                    rate.n_reductions += 1;
                    tracker.delay_for(RATE_REDUCTION_GRACE);
                    log::warn!(
                        "link cannot keep up, reducing rate to {}% (reduction #{})",
                        rate.percent,
                        rate.n_reductions
                    );
                } else if rate.percent < 100
                    && rate.last_change.elapsed() >= RATE_INCREASE_INTERVAL
                {
                    rate.percent = (rate.percent + RATE_ADJUSTMENT_STEP).min(100);
                    rate.last_change = Instant::now();
                    log::info!("link stable, raising rate to {}%", rate.percent);
                }
            } else {
                rate.percent = 100;
            }

            let space =
                frequency_to_space(params.frequency_mhz).unwrap_or(WifiSpace::G5_8);
            let max_rate_kbits = max_rate_possible(
                shared.radios.primary().card_type,
                space,
                params.air_mcs_index,
                params.air_tx_channel_width == 40,
            );
            let user_adjusted =
                multiply_by_percent(max_rate_kbits, params.rate_for_mcs_adjustment_percent as u32);
            let dynamic_adjusted = multiply_by_percent(user_adjusted, rate.percent);
            let video_rate_kbits =
                deduce_fec_overhead(dynamic_adjusted, params.fec_percentage as u32);
            if video_rate_kbits != last_notified_rate {
                last_notified_rate = video_rate_kbits;
                shared.context.bitrate.notify(0, video_rate_kbits);
            }

            let (count_p_any, count_p_valid, count_tx_injected, count_tx_errors) = counters
                .map(|c| (c.count_p_any, c.count_p_valid, c.count_tx_injected, c.count_tx_errors))
                .unwrap_or_default();
            let armed = shared.context.arming.is_armed();
            let (curr_tx_power_milli_watt, curr_tx_power_index) =
                shared.effective_tx_power(&params, armed);
            let mut count_dropped_frames = [0u32; MAX_VIDEO_STREAMS];
            for (slot, counter) in count_dropped_frames.iter_mut().zip(&shared.dropped_frames) {
                *slot = counter.load(Ordering::Relaxed);
            }
            let management_age_ms = match shared.role {
                LinkRole::Air => shared
                    .management_air
                    .as_ref()
                    .and_then(|air| air.last_received_age_ms()),
                LinkRole::Ground => shared
                    .management_ground
                    .as_ref()
                    .and_then(|ground| ground.last_received_age_ms()),
            }
            .unwrap_or(-1);
            shared.context.events.update_stats(LinkStatistics {
                curr_video_rate_kbits: video_rate_kbits,
                curr_max_rate_kbits: max_rate_kbits,
                count_p_any,
                count_p_valid,
                count_tx_injected,
                count_tx_errors,
                foreign_packets_per_second: foreign.foreign_packets_per_second(),
                curr_frequency_mhz: params.frequency_mhz,
                curr_channel_width_mhz: params.air_tx_channel_width,
                curr_mcs_index: params.air_mcs_index,
                curr_tx_power_milli_watt,
                curr_tx_power_index,
                count_dropped_frames,
                management_age_ms,
                curr_rate_adjustment_percent: rate.percent as u8,
            });

            // hotspot fallback: ground without link traffic for too long,
            // but never while armed (the radio must stay on the link)
            if shared.role == LinkRole::Ground {
                let networking = shared.networking.lock().unwrap().get().clone();
                if networking.hotspot_enabled {
                    let timeout =
                        Duration::from_secs(networking.hotspot_fallback_timeout_seconds as u64);
                    let want = !shared.context.arming.is_armed()
                        && last_valid_change.elapsed() >= timeout;
                    shared.context.hotspot.request(want);
                }
            }
        }

        // RC channel overrides go through the regular request path; a busy
        // queue just means we retry next iteration
        if shared.role == LinkRole::Air {
            if params.mcs_via_rc_channel != 0 {
                if let Some(mcs) = shared
                    .context
                    .rc_channels
                    .mcs_from_channel(params.mcs_via_rc_channel as u32)
                {
                    if mcs != params.air_mcs_index {
                        let _ = ControllerShared::request_set_air_mcs_index(&shared, mcs);
                    }
                }
            }
            if params.bw_via_rc_channel != 0 {
                if let Some(width) = shared
                    .context
                    .rc_channels
                    .bw_from_channel(params.bw_via_rc_channel as u32)
                {
                    if width.mhz() != params.air_tx_channel_width {
                        let _ =
                            ControllerShared::request_set_air_tx_channel_width(&shared, width.mhz());
                    }
                }
            }
        }

        // ground follows the air-reported width, debounced over several
        // distinct reports (RX-only change, no RF impact on the air side)
        if let Some(ground) = &shared.management_ground {
            let report_ts = ground.get_last_received_packet_ts_ms();
            if report_ts >= 0 && report_ts != mirror_last_report_ts {
                mirror_last_report_ts = report_ts;
                let reported = ground.air_reported_channel_width_mhz();
                if reported > 0 && reported != params.air_tx_channel_width as i64 {
                    if reported == mirror_width {
                        mirror_count += 1;
                    } else {
                        mirror_width = reported;
                        mirror_count = 1;
                    }
                    if mirror_count >= GND_WIDTH_DEBOUNCE_COUNT {
                        mirror_count = 0;
                        mirror_width = -1;
                        if let Ok(width) = ChannelWidth::from_mhz(reported as u8) {
                            log::info!("following air channel width {}", width.name());
                            match shared
                                .transport
                                .set_frequency_and_width(params.frequency_mhz, width)
                            {
                                Ok(()) => {
                                    if let Err(e) = shared
                                        .update_settings(|p| p.air_tx_channel_width = width.mhz())
                                    {
                                        log::warn!("cannot persist width change: {}", e);
                                    }
                                }
                                Err(e) => log::warn!("cannot follow air channel width: {}", e),
                            }
                        }
                    }
                } else {
                    mirror_width = -1;
                    mirror_count = 0;
                }
            }
        }

        // armed / disarmed TX power switch
        let armed = shared.context.arming.is_armed();
        if armed != last_armed {
            last_armed = armed;
            if let Err(e) = shared.apply_tx_power(&params, armed) {
                log::warn!("cannot reapply tx power after arming change: {}", e);
            }
        }

        // injection flags are persisted immediately by their setters, the
        // hardware follows from here
        if params.listen_only_mode != last_listen_only {
            last_listen_only = params.listen_only_mode;
            match shared.transport.set_listen_only(last_listen_only) {
                Ok(()) => log::info!("listen-only mode set to {}", last_listen_only),
                Err(e) => log::warn!("cannot change listen-only mode: {}", e),
            }
        }
        if params.dev_high_retransmit_count != last_high_retransmit {
            last_high_retransmit = params.dev_high_retransmit_count;
            match shared.transport.set_high_retransmit_count(last_high_retransmit) {
                Ok(()) => log::info!("high retransmit count set to {}", last_high_retransmit),
                Err(e) => log::warn!("cannot change retransmit count: {}", e),
            }
        }

        std::thread::sleep(shared.loop_interval);
    }
    log::debug!("worker thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::ManagementFrame;
    use crate::radio::{EmulatedRadio, WifiCard};
    use std::path::Path;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wb_link_ctrl_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn make_controller(
        role: LinkRole,
        dir: &Path,
        loop_interval: Duration,
        stats_interval: Duration,
        scan_dwell: Duration,
    ) -> (LinkController, Arc<EmulatedRadio>, Arc<EmulatedRadio>, Arc<LinkContext>) {
        let (local, remote) = EmulatedRadio::new_pair();
        let radios = RadioSet::new(vec![WifiCard::emulated("emu0")]).unwrap();
        let context = LinkContext::new();
        let mut config = LinkConfig::new(role, dir.to_path_buf());
        config.loop_interval = loop_interval;
        config.stats_interval = stats_interval;
        config.scan_dwell = scan_dwell;
        let controller =
            LinkController::new(config, radios, local.clone(), context.clone()).unwrap();
        (controller, local, remote, context)
    }

    fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    #[test]
    fn test_second_request_busy_then_ok_after_drain() {
        let dir = test_dir("busy");
        let (controller, local, _remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(300),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        controller.request_set_frequency(5785).unwrap();
        // the worker sleeps between iterations, the slot is still occupied
        assert!(matches!(
            controller.request_set_frequency(5805),
            Err(LinkError::Busy)
        ));
        assert!(wait_until(Duration::from_secs(3), || local.current_frequency() == 5785));
        assert_eq!(controller.current_parameters().frequency_mhz, 5785);
        // slot drained, next request goes through
        assert!(wait_until(Duration::from_secs(3), || controller
            .request_set_frequency(5805)
            .is_ok()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_frequency_rejected_without_side_effects() {
        let dir = test_dir("invalid");
        let (controller, local, _remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        let before = controller.current_parameters();
        let result = controller.request_set_frequency(5746);
        assert!(matches!(result, Err(LinkError::InvalidParameter(_))));
        // rejected twice in a row, never Busy: nothing was enqueued
        let result = controller.request_set_frequency(5746);
        assert!(matches!(result, Err(LinkError::InvalidParameter(_))));
        assert_eq!(controller.current_parameters(), before);
        assert_eq!(local.current_frequency(), before.frequency_mhz);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_requests_rejected_while_analysis_runs() {
        let dir = test_dir("analyze");
        let (controller, _local, _remote, context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        controller.request_start_analyze_channels(ScanOptions::default()).unwrap();
        assert!(matches!(
            controller.request_start_scan_channels(ScanOptions::default()),
            Err(LinkError::Busy)
        ));
        assert!(matches!(controller.request_set_frequency(5785), Err(LinkError::Busy)));
        // 24 channels x 50 ms dwell, wait for completion
        assert!(wait_until(Duration::from_secs(10), || {
            context
                .events
                .drain_analyze_results()
                .iter()
                .any(|r| r.progress_percent == 100)
        }));
        assert!(wait_until(Duration::from_secs(3), || controller
            .request_set_frequency(5785)
            .is_ok()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_scan_finds_air_unit() {
        let dir = test_dir("scan");
        let (controller, local, _remote, context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        // fake an air unit transmitting on 5745: valid packets show up
        // whenever the receiver dwells on that frequency
        let traffic_radio = local.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let traffic = std::thread::spawn(move || {
            while !stop2.load(Ordering::SeqCst) {
                if traffic_radio.current_frequency() == 5745 {
                    traffic_radio.advance_counters(5, 5);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        controller.request_start_scan_channels(ScanOptions::default()).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            context.events.drain_scan_progress().iter().any(|p| p.success)
        }));
        assert!(wait_until(Duration::from_secs(3), || controller
            .current_parameters()
            .frequency_mhz
            == 5745));
        stop.store(true, Ordering::SeqCst);
        traffic.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_ground_follows_air_reported_width() {
        let dir = test_dir("mirror");
        let (controller, local, remote, _context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert_eq!(controller.current_parameters().air_tx_channel_width, 20);
        let frame =
            ManagementFrame { frequency_mhz: 5745, channel_width_mhz: 40 }.encode();
        // several distinct reports are needed before the ground follows
        for _ in 0..8 {
            remote.send_management_frame(&frame).unwrap();
            std::thread::sleep(Duration::from_millis(30));
        }
        assert!(wait_until(Duration::from_secs(3), || {
            controller.current_parameters().air_tx_channel_width == 40
        }));
        assert_eq!(local.current_width(), ChannelWidth::Mhz40);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_armed_tx_power_applied_on_arming() {
        let dir = test_dir("armed");
        let (controller, local, _remote, context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        let settings = controller.get_all_settings();
        let armed_power = settings
            .iter()
            .find(|s| s.id == SETTING_TX_POWER_MW_ARMED)
            .unwrap();
        (armed_power.on_change)(500).unwrap();
        context.arming.update(true);
        assert!(wait_until(Duration::from_secs(3), || local.current_tx_power_mw() == 500));
        context.arming.update(false);
        assert!(wait_until(Duration::from_secs(3), || {
            local.current_tx_power_mw() == crate::DEFAULT_TX_POWER_MILLI_WATT
        }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fatal_raised_after_persistent_counter_failures() {
        let dir = test_dir("fatal");
        let (_controller, local, _remote, context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(5),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        local.set_fail_hardware(true);
        assert!(wait_until(Duration::from_secs(5), || context.fatal.is_raised()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_immediate_setters_validate_and_persist() {
        let dir = test_dir("setters");
        let (controller, _local, _remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert!(controller.set_fec_percentage(0).is_err());
        controller.set_fec_percentage(50).unwrap();
        assert!(controller.set_rate_for_mcs_adjustment_percent(0).is_err());
        controller.set_rate_for_mcs_adjustment_percent(80).unwrap();
        controller.set_variable_bitrate_enabled(false).unwrap();
        let params = controller.current_parameters();
        assert_eq!(params.fec_percentage, 50);
        assert_eq!(params.rate_for_mcs_adjustment_percent, 80);
        assert!(!params.variable_bitrate_enabled);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_mcs_change_applied_and_visible_in_stats() {
        let dir = test_dir("mcs");
        let (controller, local, _remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        controller.request_set_air_mcs_index(3).unwrap();
        assert!(wait_until(Duration::from_secs(3), || local.current_mcs_index() == 3));
        assert!(wait_until(Duration::from_secs(3), || {
            controller.stats().curr_mcs_index == 3
        }));
        // emulated cards use the rtl8812au 5.8 GHz rate table
        assert_eq!(controller.stats().curr_max_rate_kbits, 19200 - 3000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_tx_power_not_persisted_on_hardware_failure() {
        let dir = test_dir("txp_fail");
        let (controller, local, _remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        local.set_fail_hardware(true);
        controller.request_set_tx_power_mw(800).unwrap();
        // the slot drains even though the driver rejected the change
        assert!(wait_until(Duration::from_secs(3), || controller
            .request_set_tx_power_mw(800)
            .is_ok()));
        assert_eq!(
            controller.current_parameters().tx_power_milli_watt,
            crate::DEFAULT_TX_POWER_MILLI_WATT
        );
        assert_eq!(local.current_tx_power_mw(), crate::DEFAULT_TX_POWER_MILLI_WATT);
        // once the driver recovers the change goes through and sticks
        local.set_fail_hardware(false);
        assert!(wait_until(Duration::from_secs(3), || controller
            .request_set_tx_power_mw(800)
            .is_ok()));
        assert!(wait_until(Duration::from_secs(3), || local.current_tx_power_mw() == 800));
        assert!(wait_until(Duration::from_secs(3), || {
            controller.current_parameters().tx_power_milli_watt == 800
        }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_stats_carry_tx_power_drops_and_management_age() {
        let dir = test_dir("stats_fields");
        let (controller, _local, remote, _context) = make_controller(
            LinkRole::Air,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        assert!(wait_until(Duration::from_secs(3), || {
            controller.stats().curr_tx_power_milli_watt == crate::DEFAULT_TX_POWER_MILLI_WATT
        }));
        // nothing received from the ground yet, freshness is unknown
        assert_eq!(controller.stats().management_age_ms, -1);
        controller.notify_dropped_frames(0, 2);
        controller.notify_dropped_frames(1, 1);
        assert!(wait_until(Duration::from_secs(3), || {
            controller.stats().count_dropped_frames == [2, 1]
        }));
        // any ground frame refreshes the liveness age
        let frame = ManagementFrame { frequency_mhz: 5745, channel_width_mhz: 20 }.encode();
        remote.send_management_frame(&frame).unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            controller.stats().management_age_ms >= 0
        }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_frequency_rejected_when_width_unsupported() {
        let dir = test_dir("freq_width");
        std::fs::create_dir_all(&dir).unwrap();
        // persisted 40 MHz on a card that can only do 20
        let params = LinkParameters { air_tx_channel_width: 40, ..Default::default() };
        std::fs::write(dir.join("wb_link.json"), serde_json::to_string(&params).unwrap())
            .unwrap();
        let (local, _remote) = EmulatedRadio::new_pair();
        let mut card = WifiCard::emulated("emu0");
        card.supports_40mhz = false;
        let radios = RadioSet::new(vec![card]).unwrap();
        let context = LinkContext::new();
        let mut config = LinkConfig::new(LinkRole::Air, dir.clone());
        config.loop_interval = Duration::from_millis(10);
        let controller = LinkController::new(config, radios, local, context).unwrap();
        assert!(matches!(
            controller.request_set_frequency(5785),
            Err(LinkError::InvalidParameter(_))
        ));
        assert_eq!(controller.current_parameters().frequency_mhz, 5745);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hotspot_fallback_suppressed_while_armed() {
        let dir = test_dir("hotspot");
        std::fs::create_dir_all(&dir).unwrap();
        let net = NetworkingParameters {
            hotspot_enabled: true,
            hotspot_fallback_timeout_seconds: 0,
        };
        std::fs::write(dir.join("networking.json"), serde_json::to_string(&net).unwrap())
            .unwrap();
        let (controller, _local, _remote, context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        // no link traffic and disarmed: fallback kicks in
        assert!(wait_until(Duration::from_secs(3), || context.hotspot.is_requested()));
        context.arming.update(true);
        assert!(wait_until(Duration::from_secs(3), || !context.hotspot.is_requested()));
        context.arming.update(false);
        assert!(wait_until(Duration::from_secs(3), || context.hotspot.is_requested()));
        drop(controller);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_injection_flags_reach_the_radio() {
        let dir = test_dir("inj_flags");
        let (controller, local, _remote, _context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        assert!(!local.is_listen_only());
        controller.set_listen_only_mode(true).unwrap();
        assert!(wait_until(Duration::from_secs(3), || local.is_listen_only()));
        controller.set_dev_high_retransmit_count(true).unwrap();
        assert!(wait_until(Duration::from_secs(3), || local.is_high_retransmit()));
        controller.set_listen_only_mode(false).unwrap();
        assert!(wait_until(Duration::from_secs(3), || !local.is_listen_only()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_scan_restores_width_when_no_air_unit_found() {
        let dir = test_dir("scan_width");
        std::fs::create_dir_all(&dir).unwrap();
        let params = LinkParameters { air_tx_channel_width: 40, ..Default::default() };
        std::fs::write(dir.join("wb_link.json"), serde_json::to_string(&params).unwrap())
            .unwrap();
        let (controller, local, _remote, context) = make_controller(
            LinkRole::Ground,
            &dir,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        assert_eq!(local.current_width(), ChannelWidth::Mhz40);
        controller.request_start_scan_channels(ScanOptions::default()).unwrap();
        // the scan itself sweeps narrowband
        assert!(wait_until(Duration::from_secs(3), || {
            local.current_width() == ChannelWidth::Mhz20
        }));
        assert!(wait_until(Duration::from_secs(10), || {
            context
                .events
                .drain_scan_progress()
                .iter()
                .any(|p| p.progress_percent == 100 && !p.success)
        }));
        // nothing found: back to the configured frequency and width
        assert!(wait_until(Duration::from_secs(3), || {
            local.current_frequency() == 5745 && local.current_width() == ChannelWidth::Mhz40
        }));
        assert_eq!(controller.current_parameters().frequency_mhz, 5745);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
