//! Air / ground management channel
//!
//! Quite a lot of machinery to support 40 MHz without a synchronous
//! handshake between air and ground - worth it, though. The air side
//! periodically broadcasts a tiny frame carrying its authoritative
//! current frequency and channel width; the ground side passively listens
//! and mirrors what the air reports. Resilience comes from periodic,
//! idempotent broadcast, not acknowledgement.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::ChannelWidth;
use crate::radio::RadioTransport;
use crate::{LinkError, Result, MANAGEMENT_FRAME_MAGIC};

/// Default broadcast interval for management frames.
pub const MANAGEMENT_FRAME_INTERVAL: Duration = Duration::from_millis(500);
/// Accelerated interval right after a local frequency / width change, to
/// propagate the change faster.
pub const MANAGEMENT_FRAME_INTERVAL_FAST: Duration = Duration::from_millis(100);
/// For how long after a change the accelerated interval is used.
pub const MANAGEMENT_FAST_WINDOW: Duration = Duration::from_secs(1);

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Payload of a management frame: the air side's actual current RF state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementFrame {
    pub frequency_mhz: u32,
    pub channel_width_mhz: u8,
}

impl ManagementFrame {
    /// Serialized size: magic + frequency + width.
    pub const SIZE: usize = 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(MANAGEMENT_FRAME_MAGIC);
        buf.put_u32_le(self.frequency_mhz);
        buf.put_u8(self.channel_width_mhz);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(LinkError::Parse(format!(
                "management frame too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let magic = buf.get_u8();
        if magic != MANAGEMENT_FRAME_MAGIC {
            return Err(LinkError::Parse(format!("invalid management frame magic: {:#x}", magic)));
        }
        let frequency_mhz = buf.get_u32_le();
        let channel_width_mhz = buf.get_u8();
        if ChannelWidth::from_mhz(channel_width_mhz).is_err() {
            return Err(LinkError::Parse(format!(
                "invalid channel width in management frame: {}",
                channel_width_mhz
            )));
        }
        Ok(Self { frequency_mhz, channel_width_mhz })
    }
}

fn steady_clock_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

/// Air side of the management channel. Owns a broadcast thread that
/// periodically sends the current (frequency, width); the interval is
/// temporarily shortened after a local change.
pub struct ManagementAir {
    shared: Arc<ManagementAirShared>,
    thread: Option<JoinHandle<()>>,
}

struct ManagementAirShared {
    transport: Arc<dyn RadioTransport>,
    run: AtomicBool,
    /// The authoritative current air frequency, written by the worker
    /// thread via set_frequency.
    curr_frequency_mhz: AtomicU32,
    curr_channel_width_mhz: AtomicU8,
    /// ms since start_ts, -1 before the first received frame
    last_received_packet_ts_ms: AtomicI64,
    /// ms since start_ts of the last local change, drives the fast window
    last_change_ts_ms: AtomicI64,
    start_ts: Instant,
}

impl ManagementAir {
    pub fn new(transport: Arc<dyn RadioTransport>, initial_frequency_mhz: u32, initial_width: ChannelWidth) -> Self {
        Self {
            shared: Arc::new(ManagementAirShared {
                transport,
                run: AtomicBool::new(true),
                curr_frequency_mhz: AtomicU32::new(initial_frequency_mhz),
                curr_channel_width_mhz: AtomicU8::new(initial_width.mhz()),
                last_received_packet_ts_ms: AtomicI64::new(-1),
                last_change_ts_ms: AtomicI64::new(-1),
                start_ts: Instant::now(),
            }),
            thread: None,
        }
    }

    /// Spawn the broadcast thread.
    pub fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name("management_air".to_string())
            .spawn(move || shared.loop_broadcast())
            .map_err(|e| LinkError::Config(format!("cannot spawn management thread: {}", e)))?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Update the broadcast frequency; temporarily shortens the broadcast
    /// interval.
    pub fn set_frequency(&self, frequency_mhz: u32) {
        self.shared.curr_frequency_mhz.store(frequency_mhz, Ordering::SeqCst);
        self.shared.mark_changed();
    }

    /// Update the broadcast channel width; temporarily shortens the
    /// broadcast interval.
    pub fn set_channel_width(&self, width: ChannelWidth) {
        self.shared.curr_channel_width_mhz.store(width.mhz(), Ordering::SeqCst);
        self.shared.mark_changed();
    }

    pub fn curr_frequency_mhz(&self) -> u32 {
        self.shared.curr_frequency_mhz.load(Ordering::SeqCst)
    }

    pub fn curr_channel_width_mhz(&self) -> u8 {
        self.shared.curr_channel_width_mhz.load(Ordering::SeqCst)
    }

    /// Timestamp (ms, monotonic since channel creation) of the last
    /// received management frame, -1 if none was ever received. Lets
    /// callers detect a dead / out-of-range peer.
    pub fn get_last_received_packet_ts_ms(&self) -> i64 {
        self.shared.last_received_packet_ts_ms.load(Ordering::SeqCst)
    }

    /// Age of the last received frame in ms, None if nothing was received
    /// yet.
    pub fn last_received_age_ms(&self) -> Option<i64> {
        let ts = self.get_last_received_packet_ts_ms();
        if ts < 0 {
            return None;
        }
        Some(steady_clock_ms(self.shared.start_ts) - ts)
    }
}

impl ManagementAirShared {
    fn mark_changed(&self) {
        self.last_change_ts_ms.store(steady_clock_ms(self.start_ts), Ordering::SeqCst);
    }

    fn current_interval(&self) -> Duration {
        let last_change = self.last_change_ts_ms.load(Ordering::SeqCst);
        if last_change >= 0 {
            let elapsed_ms = steady_clock_ms(self.start_ts) - last_change;
            if elapsed_ms <= MANAGEMENT_FAST_WINDOW.as_millis() as i64 {
                return MANAGEMENT_FRAME_INTERVAL_FAST;
            }
        }
        MANAGEMENT_FRAME_INTERVAL
    }

    fn loop_broadcast(&self) {
        log::debug!("management air thread running");
        let mut last_sent = Instant::now() - MANAGEMENT_FRAME_INTERVAL;
        while self.run.load(Ordering::SeqCst) {
            if last_sent.elapsed() >= self.current_interval() {
                last_sent = Instant::now();
                let frame = ManagementFrame {
                    frequency_mhz: self.curr_frequency_mhz.load(Ordering::SeqCst),
                    channel_width_mhz: self.curr_channel_width_mhz.load(Ordering::SeqCst),
                };
                if let Err(e) = self.transport.send_management_frame(&frame.encode()) {
                    log::warn!("cannot send management frame: {}", e);
                }
            }
            // The ground has nothing meaningful to send in this direction
            // in the minimal design, but the socket is bidirectional - any
            // received frame refreshes the liveness timestamp.
            match self.transport.recv_management_frame(RECV_TIMEOUT) {
                Ok(Some(_)) => {
                    self.last_received_packet_ts_ms
                        .store(steady_clock_ms(self.start_ts), Ordering::SeqCst);
                }
                Ok(None) => {}
                Err(e) => log::warn!("management frame receive error: {}", e),
            }
        }
        log::debug!("management air thread stopped");
    }
}

impl Drop for ManagementAir {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Ground side of the management channel. Passively listens; on receipt
/// atomically stores the reported frequency / width.
///
/// No cross-field atomicity between frequency and width is promised - a
/// reader may observe a transiently inconsistent pair. Consumers are
/// informational only, so this is acceptable (best effort).
pub struct ManagementGround {
    shared: Arc<ManagementGroundShared>,
    thread: Option<JoinHandle<()>>,
}

struct ManagementGroundShared {
    transport: Arc<dyn RadioTransport>,
    run: AtomicBool,
    /// -1 until the first air report was received
    air_reported_frequency_mhz: AtomicI64,
    air_reported_channel_width_mhz: AtomicI64,
    last_received_packet_ts_ms: AtomicI64,
    start_ts: Instant,
}

impl ManagementGround {
    pub fn new(transport: Arc<dyn RadioTransport>) -> Self {
        Self {
            shared: Arc::new(ManagementGroundShared {
                transport,
                run: AtomicBool::new(true),
                air_reported_frequency_mhz: AtomicI64::new(-1),
                air_reported_channel_width_mhz: AtomicI64::new(-1),
                last_received_packet_ts_ms: AtomicI64::new(-1),
                start_ts: Instant::now(),
            }),
            thread: None,
        }
    }

    /// Spawn the receive thread.
    pub fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name("management_gnd".to_string())
            .spawn(move || shared.loop_receive())
            .map_err(|e| LinkError::Config(format!("cannot spawn management thread: {}", e)))?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Frequency last reported by the air unit, -1 if none received yet.
    pub fn air_reported_frequency_mhz(&self) -> i64 {
        self.shared.air_reported_frequency_mhz.load(Ordering::SeqCst)
    }

    /// Channel width last reported by the air unit, -1 if none received
    /// yet.
    pub fn air_reported_channel_width_mhz(&self) -> i64 {
        self.shared.air_reported_channel_width_mhz.load(Ordering::SeqCst)
    }

    pub fn get_last_received_packet_ts_ms(&self) -> i64 {
        self.shared.last_received_packet_ts_ms.load(Ordering::SeqCst)
    }

    pub fn last_received_age_ms(&self) -> Option<i64> {
        let ts = self.get_last_received_packet_ts_ms();
        if ts < 0 {
            return None;
        }
        Some(steady_clock_ms(self.shared.start_ts) - ts)
    }
}

impl ManagementGroundShared {
    fn loop_receive(&self) {
        log::debug!("management ground thread running");
        while self.run.load(Ordering::SeqCst) {
            match self.transport.recv_management_frame(RECV_TIMEOUT) {
                Ok(Some(data)) => self.on_new_management_frame(&data),
                Ok(None) => {}
                Err(e) => log::warn!("management frame receive error: {}", e),
            }
        }
        log::debug!("management ground thread stopped");
    }

    fn on_new_management_frame(&self, data: &[u8]) {
        let frame = match ManagementFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("invalid management frame: {}", e);
                return;
            }
        };
        self.air_reported_frequency_mhz
            .store(frame.frequency_mhz as i64, Ordering::SeqCst);
        self.air_reported_channel_width_mhz
            .store(frame.channel_width_mhz as i64, Ordering::SeqCst);
        self.last_received_packet_ts_ms
            .store(steady_clock_ms(self.start_ts), Ordering::SeqCst);
    }
}

impl Drop for ManagementGround {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
