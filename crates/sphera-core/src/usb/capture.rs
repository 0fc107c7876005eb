//! UAC capture state machine
//!
//! Owns the whole life of an isochronous capture session against a
//! pre-opened USB device:
//!
//! 1. fetch and parse the configuration descriptor, score the
//!    AudioStreaming alternate settings and pick the capture endpoint;
//! 2. resolve the UAC2 clock topology to a concrete Clock Source and
//!    program the sample rate (with the UAC1 endpoint control as fallback);
//! 3. run the flush → rate → pitch → SET_INTERFACE enable sequence the
//!    Linux USB audio driver uses, with bounded retries on EPROTO/EBUSY;
//! 4. keep a 64-deep URB ring primed, reap completions into the caller's
//!    buffer at frame granularity, and watch for the stuck-URB failure mode
//!    some host controllers exhibit, tearing the ring down and rebuilding
//!    it when detected.
//!
//! `read` is called from the recorder's reader thread; everything else from
//! the controller thread. The two never run concurrently (the recorder
//! joins the reader before reconfiguring).

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

use super::clock::{ClockNode, ClockTopology};
use super::descriptor::{
    parse_configuration, select_capture_endpoint, ParsedConfig, SelectedStream, UacEndpoint,
};
use super::device::{ControlRequest, ReapMode, UsbDeviceIo, UsbIoError};
use super::protocol::*;
use super::urb::UrbSlot;
use crate::types::{BYTES_PER_SAMPLE, CHANNEL_COUNT, DEFAULT_SAMPLE_RATE};

/// Depth of the URB ring
pub const NUM_URBS: usize = 64;
/// Upper bound on one URB's transfer buffer
pub const MAX_URB_BYTES: usize = 128 * 1024;
/// Cap on the staging buffer holding bytes the caller had no room for
pub const MAX_PENDING_BYTES: usize = 512 * 1024;
/// Consecutive same-URB reaps that trigger a ring rebuild
pub const STUCK_URB_THRESHOLD: u32 = 50;
/// Reap attempts between stuck-pattern checks
pub const STUCK_URB_CHECK_INTERVAL: u64 = 100;

const SET_INTERFACE_RETRIES: u32 = 5;
const SET_INTERFACE_BACKOFF: Duration = Duration::from_millis(5);
const CLOCK_VALID_POLLS: u32 = 20;
const CLOCK_VALID_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SET_CUR_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);
const CONTROL_TIMEOUT_MS: u32 = 1000;
const FLUSH_SETTLE: Duration = Duration::from_millis(5);
const POST_ENABLE_SETTLE: Duration = Duration::from_millis(150);
const BLOCKING_REAP_TIMEOUT_MS: u32 = 10;

/// Capture session parameters
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channel_count: usize,
    pub bytes_per_sample: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_count: CHANNEL_COUNT,
            bytes_per_sample: BYTES_PER_SAMPLE,
        }
    }
}

impl CaptureConfig {
    pub fn frame_size(&self) -> usize {
        self.channel_count * self.bytes_per_sample
    }
}

/// Fatal capture failures. Transient conditions (EAGAIN on reap, EBUSY on
/// SET_CUR, EPROTO on SET_INTERFACE) are absorbed by bounded retries and
/// never surface here.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to fetch configuration descriptor: {0}")]
    DescriptorFetch(UsbIoError),

    #[error("no suitable isochronous audio IN endpoint found")]
    NoEndpoint,

    #[error("capture not initialized")]
    NotInitialized,

    #[error("failed to enable streaming interface: {0}")]
    EnableFailed(UsbIoError),

    #[error("device I/O failed: {0}")]
    Io(UsbIoError),
}

/// Polled diagnostic counters
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub reap_count: u64,
    pub reap_attempts: u64,
    pub eagain_count: u64,
    pub reap_error_count: u64,
    pub submit_error_count: u64,
    pub packet_error_count: u64,
    pub stuck_resets: u64,
    pub pending_dropped_bytes: u64,
}

/// USB Audio Class isochronous capture over a pre-opened device handle
pub struct UacCapture {
    device: Box<dyn UsbDeviceIo>,
    config: CaptureConfig,

    parsed: Option<ParsedConfig>,
    selected: Option<SelectedStream>,
    resolved_clock: Option<u8>,
    effective_rate: f64,

    streaming: bool,
    urbs: Vec<UrbSlot>,
    packets_per_urb: usize,
    primed: usize,

    /// Spillover staging: bytes reaped but not yet accepted by the caller
    pending: Vec<u8>,
    pending_overflow_warned: bool,

    last_reaped: Option<usize>,
    consecutive_same: u32,
    /// Completions in the current check window that repeated the previous
    /// URB index. Independent of `consecutive_same`: a lone healthy reap
    /// breaks the run but barely dents the window.
    window_same_count: u32,

    stats: CaptureStats,
    not_streaming_logs: u32,
}

impl UacCapture {
    pub fn new(device: Box<dyn UsbDeviceIo>, config: CaptureConfig) -> Self {
        let effective_rate = config.sample_rate as f64;
        Self {
            device,
            config,
            parsed: None,
            selected: None,
            resolved_clock: None,
            effective_rate,
            streaming: false,
            urbs: Vec::new(),
            packets_per_urb: 0,
            primed: 0,
            pending: Vec::new(),
            pending_overflow_warned: false,
            last_reaped: None,
            consecutive_same: 0,
            window_same_count: 0,
            stats: CaptureStats::default(),
            not_streaming_logs: 0,
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Initialization: descriptor walk and endpoint selection
    // ───────────────────────────────────────────────────────────────────

    /// Fetch the configuration descriptor and select the capture endpoint.
    pub fn initialize(&mut self) -> Result<(), CaptureError> {
        let blob = self.fetch_configuration_descriptor()?;
        let parsed = parse_configuration(&blob);

        let selected =
            select_capture_endpoint(&parsed, self.config.sample_rate, self.config.frame_size())
                .ok_or(CaptureError::NoEndpoint)?;

        log::info!(
            "Selected capture endpoint 0x{:02x}: interface {} alt {}, {} bytes/interval, interval={}, {}",
            selected.endpoint.ep_address,
            selected.endpoint.interface,
            selected.endpoint.alt_setting,
            selected.endpoint.iso_packet_size,
            selected.endpoint.packets_per_service_interval,
            if selected.endpoint.is_super_speed {
                "SuperSpeed"
            } else if selected.endpoint.is_high_speed {
                "high-speed"
            } else {
                "full-speed"
            }
        );

        if let Some(channels) = selected.num_channels {
            if channels as usize != self.config.channel_count {
                log::warn!(
                    "Device advertises {} channels, expected {}",
                    channels,
                    self.config.channel_count
                );
            }
        }

        self.packets_per_urb = packets_per_urb(&selected.endpoint);
        self.parsed = Some(parsed);
        self.selected = Some(selected);
        Ok(())
    }

    fn fetch_configuration_descriptor(&mut self) -> Result<Vec<u8>, CaptureError> {
        let request = ControlRequest {
            request_type: RT_D2H_STANDARD_DEVICE,
            request: REQ_GET_DESCRIPTOR,
            value: (DT_CONFIGURATION as u16) << 8,
            index: 0,
            timeout_ms: CONTROL_TIMEOUT_MS,
        };

        let mut header = [0u8; 9];
        self.device
            .control_in(&request, &mut header)
            .map_err(CaptureError::DescriptorFetch)?;
        let total_length = u16::from_le_bytes([header[2], header[3]]) as usize;
        if total_length < 9 {
            return Err(CaptureError::DescriptorFetch(UsbIoError::Invalid));
        }

        let mut blob = vec![0u8; total_length];
        let received = self
            .device
            .control_in(&request, &mut blob)
            .map_err(CaptureError::DescriptorFetch)?;
        blob.truncate(received);
        Ok(blob)
    }

    /// Selected endpoint geometry, once initialized
    pub fn endpoint(&self) -> Option<&UacEndpoint> {
        self.selected.as_ref().map(|s| &s.endpoint)
    }

    // ───────────────────────────────────────────────────────────────────
    // Clock topology resolution
    // ───────────────────────────────────────────────────────────────────

    /// Resolve the streaming interface's clock reference to a concrete
    /// Clock Source id. Returns None for UAC1 devices (no clock entities).
    fn resolve_clock(&mut self) -> Option<u8> {
        let parsed = self.parsed.as_ref()?;
        if parsed.clocks.is_empty() {
            return None;
        }
        let topology = parsed.clocks.clone();
        let control_interface = parsed.control_interface.unwrap_or(0);

        let link = self.selected.as_ref()?.terminal_link?;
        // The AS interface links a terminal; the terminal names the clock.
        // Some firmware links the clock entity directly, so fall back to
        // treating the link as an entity id.
        let start = parsed.terminal_clock(link).unwrap_or(link);

        let mut visited = HashSet::new();
        let resolved = self.resolve_entity(&topology, control_interface, start, &mut visited);
        match resolved {
            Some(id) => log::info!("Clock topology resolved: entity {} -> source {}", start, id),
            None => log::warn!("Clock topology resolution failed from entity {}", start),
        }
        resolved
    }

    fn resolve_entity(
        &mut self,
        topology: &ClockTopology,
        control_interface: u8,
        id: u8,
        visited: &mut HashSet<u8>,
    ) -> Option<u8> {
        if !visited.insert(id) {
            log::warn!("Clock topology cycle at entity {}", id);
            return None;
        }

        match topology.node(id)? {
            ClockNode::Source(source) => {
                if source.validity_readable() {
                    self.wait_clock_valid(source.id, control_interface);
                }
                Some(source.id)
            }
            ClockNode::Multiplier(multiplier) => {
                self.resolve_entity(topology, control_interface, multiplier.source_id, visited)
            }
            ClockNode::Selector(selector) => {
                let selector = selector.clone();
                if selector.pin_readable() {
                    if let Some(pin) = self.read_selector_pin(selector.id, control_interface) {
                        let pin_index = pin.saturating_sub(1) as usize;
                        if let Some(&input) = selector.inputs.get(pin_index) {
                            return self.resolve_entity(topology, control_interface, input, visited);
                        }
                    }
                }
                // No readable current pin: probe each input, switching the
                // selector where it is writable. Nothing to switch back to
                // without a readable original.
                for (pin_index, &input) in selector.inputs.iter().enumerate() {
                    if selector.pin_writable() {
                        let pin = (pin_index + 1) as u8;
                        if let Err(e) = self.write_selector_pin(selector.id, control_interface, pin)
                        {
                            log::debug!("Selector {} pin {} rejected: {}", selector.id, pin, e);
                            continue;
                        }
                    }
                    if let Some(source) =
                        self.resolve_entity(topology, control_interface, input, visited)
                    {
                        return Some(source);
                    }
                }
                None
            }
        }
    }

    fn wait_clock_valid(&mut self, clock_id: u8, control_interface: u8) {
        for poll in 0..CLOCK_VALID_POLLS {
            let request = ControlRequest {
                request_type: RT_D2H_CLASS_INTERFACE,
                request: UAC2_CUR,
                value: (CS_CLOCK_VALID_CONTROL as u16) << 8,
                index: ((clock_id as u16) << 8) | control_interface as u16,
                timeout_ms: CONTROL_TIMEOUT_MS,
            };
            let mut valid = [0u8; 1];
            match self.device.control_in(&request, &mut valid) {
                Ok(_) if valid[0] != 0 => return,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("CLOCK_VALID read failed on source {}: {}", clock_id, e);
                    return;
                }
            }
            if poll + 1 < CLOCK_VALID_POLLS {
                std::thread::sleep(CLOCK_VALID_POLL_INTERVAL);
            }
        }
        log::warn!("Clock source {} never reported valid; continuing", clock_id);
    }

    fn read_selector_pin(&mut self, selector_id: u8, control_interface: u8) -> Option<u8> {
        let request = ControlRequest {
            request_type: RT_D2H_CLASS_INTERFACE,
            request: UAC2_CUR,
            value: (CX_CLOCK_SELECTOR_CONTROL as u16) << 8,
            index: ((selector_id as u16) << 8) | control_interface as u16,
            timeout_ms: CONTROL_TIMEOUT_MS,
        };
        let mut pin = [0u8; 1];
        self.device.control_in(&request, &mut pin).ok()?;
        Some(pin[0])
    }

    fn write_selector_pin(
        &mut self,
        selector_id: u8,
        control_interface: u8,
        pin: u8,
    ) -> Result<(), UsbIoError> {
        let request = ControlRequest {
            request_type: RT_H2D_CLASS_INTERFACE,
            request: UAC2_CUR,
            value: (CX_CLOCK_SELECTOR_CONTROL as u16) << 8,
            index: ((selector_id as u16) << 8) | control_interface as u16,
            timeout_ms: CONTROL_TIMEOUT_MS,
        };
        self.device.control_out(&request, &[pin])
    }

    // ───────────────────────────────────────────────────────────────────
    // Sample-rate programming
    // ───────────────────────────────────────────────────────────────────

    /// Program the requested sample rate, then adopt whatever the device
    /// reports back as the effective rate.
    fn program_sample_rate(&mut self) {
        let rate = self.config.sample_rate;
        let rate_bytes = rate.to_le_bytes();
        let Some(selected) = self.selected.clone() else {
            return;
        };
        let control_interface = self
            .parsed
            .as_ref()
            .and_then(|p| p.control_interface)
            .unwrap_or(0);
        let streaming_interface = selected.endpoint.interface;

        let mut programmed = false;

        if let Some(clock_id) = self.resolved_clock {
            // SET_CUR on the clock source: wLength 4 then 3, across the
            // control interface, the streaming interface, then entity-only
            'outer: for length in [4usize, 3] {
                let indices = [
                    ((clock_id as u16) << 8) | control_interface as u16,
                    ((clock_id as u16) << 8) | streaming_interface as u16,
                    (clock_id as u16) << 8,
                ];
                for index in indices {
                    let request = ControlRequest {
                        request_type: RT_H2D_CLASS_INTERFACE,
                        request: UAC2_CUR,
                        value: (CS_SAM_FREQ_CONTROL as u16) << 8,
                        index,
                        timeout_ms: CONTROL_TIMEOUT_MS,
                    };
                    match self.device.control_out(&request, &rate_bytes[..length]) {
                        Ok(()) => {
                            log::info!(
                                "Sample rate {} programmed via clock source {} (wIndex=0x{:04x}, wLength={})",
                                rate,
                                clock_id,
                                index,
                                length
                            );
                            programmed = true;
                            break 'outer;
                        }
                        Err(UsbIoError::Busy) => {
                            log::debug!(
                                "SET_CUR busy (wIndex=0x{:04x}), retrying next candidate",
                                index
                            );
                            std::thread::sleep(SET_CUR_BUSY_RETRY_DELAY);
                        }
                        Err(e) => {
                            log::debug!("SET_CUR failed (wIndex=0x{:04x}): {}", index, e);
                        }
                    }
                }
            }
        }

        if !programmed {
            // UAC1 fallback: Sampling Frequency Control on the endpoint
            let request = ControlRequest {
                request_type: RT_H2D_CLASS_ENDPOINT,
                request: UAC_SET_CUR,
                value: (EP_SAMPLING_FREQ_CONTROL as u16) << 8,
                index: selected.endpoint.ep_address as u16,
                timeout_ms: CONTROL_TIMEOUT_MS,
            };
            match self.device.control_out(&request, &rate_bytes[..3]) {
                Ok(()) => {
                    log::info!("Sample rate {} programmed via endpoint control", rate);
                }
                Err(e) => {
                    log::info!(
                        "Endpoint sample-rate control failed ({}); rate may be implied by the alternate setting",
                        e
                    );
                }
            }
        }

        self.verify_sample_rate(control_interface, &selected);
    }

    fn verify_sample_rate(&mut self, control_interface: u8, selected: &SelectedStream) {
        if let Some(clock_id) = self.resolved_clock {
            let request = ControlRequest {
                request_type: RT_D2H_CLASS_INTERFACE,
                request: UAC2_CUR,
                value: (CS_SAM_FREQ_CONTROL as u16) << 8,
                index: ((clock_id as u16) << 8) | control_interface as u16,
                timeout_ms: CONTROL_TIMEOUT_MS,
            };
            let mut bytes = [0u8; 4];
            if let Ok(n) = self.device.control_in(&request, &mut bytes) {
                if n == 4 {
                    let reported = u32::from_le_bytes(bytes);
                    if reported > 0 {
                        self.adopt_effective_rate(reported);
                        return;
                    }
                }
            }
        }

        let request = ControlRequest {
            request_type: RT_D2H_CLASS_ENDPOINT,
            request: UAC_GET_CUR,
            value: (EP_SAMPLING_FREQ_CONTROL as u16) << 8,
            index: selected.endpoint.ep_address as u16,
            timeout_ms: CONTROL_TIMEOUT_MS,
        };
        let mut bytes = [0u8; 3];
        match self.device.control_in(&request, &mut bytes) {
            Ok(n) if n >= 3 => {
                let reported = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
                if reported > 0 {
                    self.adopt_effective_rate(reported);
                }
            }
            _ => {
                log::debug!("Device does not report its sample rate; keeping requested value");
            }
        }
    }

    fn adopt_effective_rate(&mut self, reported: u32) {
        if reported != self.config.sample_rate {
            log::warn!(
                "Device reports {} Hz for a {} Hz request; adopting the device value",
                reported,
                self.config.sample_rate
            );
        }
        self.effective_rate = reported as f64;
    }

    /// Device-reported sample rate (requested rate until verified)
    pub fn effective_sample_rate(&self) -> f64 {
        self.effective_rate
    }

    pub fn effective_sample_rate_rounded(&self) -> u32 {
        self.effective_rate.round() as u32
    }

    // ───────────────────────────────────────────────────────────────────
    // Enable sequence and streaming control
    // ───────────────────────────────────────────────────────────────────

    /// Run the flush + enable sequence and prime the URB ring.
    pub fn start_streaming(&mut self) -> Result<(), CaptureError> {
        if self.streaming {
            return Ok(());
        }
        if self.selected.is_none() {
            self.initialize()?;
        }
        let selected = self.selected.clone().ok_or(CaptureError::NotInitialized)?;
        let interface = selected.endpoint.interface;

        // Flush: known-idle interface, no in-flight URBs, clean endpoint
        self.set_interface_with_retry(interface, 0)
            .map_err(CaptureError::EnableFailed)?;
        self.teardown_ring();
        if let Err(e) = self.device.clear_halt(selected.endpoint.ep_address) {
            log::debug!("CLEAR_HALT failed (ignored): {}", e);
        }
        if let Some(frame) = self.device.current_frame() {
            log::debug!("USB frame counter at stream start: {}", frame);
        }
        std::thread::sleep(FLUSH_SETTLE);

        // Rate before enable, as the kernel driver sequences it
        self.resolved_clock = self.resolve_clock();
        self.program_sample_rate();
        self.enable_pitch_control(&selected);

        self.set_interface_with_retry(interface, selected.endpoint.alt_setting)
            .map_err(CaptureError::EnableFailed)?;

        self.allocate_ring(&selected.endpoint);
        self.prime_ring();

        // Devices need a beat before the first packets carry data
        std::thread::sleep(POST_ENABLE_SETTLE);

        self.streaming = true;
        log::info!(
            "USB audio streaming enabled on interface {} alt {} (effective rate {:.1} Hz)",
            interface,
            selected.endpoint.alt_setting,
            self.effective_rate
        );
        Ok(())
    }

    /// Cancel all in-flight transfers, disable the interface, release the
    /// ring and reset all counters.
    pub fn stop_streaming(&mut self) {
        if !self.streaming && self.urbs.is_empty() {
            return;
        }
        log::info!("Stopping USB audio streaming");
        self.streaming = false;

        self.teardown_ring();

        if let Some(selected) = &self.selected {
            let interface = selected.endpoint.interface;
            if let Err(e) = self.set_interface_with_retry(interface, 0) {
                log::warn!("Failed to reset interface {} to alt 0: {}", interface, e);
            }
        }

        self.pending.clear();
        self.pending_overflow_warned = false;
        self.last_reaped = None;
        self.consecutive_same = 0;
        self.window_same_count = 0;
        self.not_streaming_logs = 0;
        self.stats = CaptureStats::default();
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Staging size the reader thread should use: one full URB's payload
    pub fn recommended_buffer_size(&self) -> usize {
        let packet = self
            .selected
            .as_ref()
            .map(|s| s.endpoint.iso_packet_size)
            .unwrap_or(0);
        self.packets_per_urb * packet
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    fn enable_pitch_control(&mut self, selected: &SelectedStream) {
        // Best effort; plenty of devices have no pitch control
        let request = ControlRequest {
            request_type: RT_H2D_CLASS_ENDPOINT,
            request: UAC_SET_CUR,
            value: (EP_PITCH_CONTROL as u16) << 8,
            index: selected.endpoint.ep_address as u16,
            timeout_ms: CONTROL_TIMEOUT_MS,
        };
        match self.device.control_out(&request, &[1]) {
            Ok(()) => log::debug!("Endpoint pitch control enabled"),
            Err(e) => log::debug!("Pitch control not supported ({})", e),
        }
    }

    fn set_interface_with_retry(&mut self, interface: u8, alt: u8) -> Result<(), UsbIoError> {
        let mut backoff = SET_INTERFACE_BACKOFF;
        let mut last_error = UsbIoError::Proto;
        for attempt in 0..SET_INTERFACE_RETRIES {
            match self.device.set_interface(interface, alt) {
                Ok(()) => {
                    log::debug!("SET_INTERFACE({}, {}) ok", interface, alt);
                    return Ok(());
                }
                Err(UsbIoError::Proto) => {
                    log::debug!(
                        "SET_INTERFACE({}, {}) EPROTO, attempt {}/{}",
                        interface,
                        alt,
                        attempt + 1,
                        SET_INTERFACE_RETRIES
                    );
                    last_error = UsbIoError::Proto;
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    // ───────────────────────────────────────────────────────────────────
    // URB ring
    // ───────────────────────────────────────────────────────────────────

    fn allocate_ring(&mut self, endpoint: &UacEndpoint) {
        self.urbs.clear();
        self.primed = 0;
        self.packets_per_urb = packets_per_urb(endpoint);
        for index in 0..NUM_URBS {
            self.urbs.push(UrbSlot::new(
                index,
                endpoint.ep_address,
                self.packets_per_urb,
                endpoint.iso_packet_size,
            ));
        }
        log::debug!(
            "Allocated {} URBs: {} packets × {} bytes each",
            NUM_URBS,
            self.packets_per_urb,
            endpoint.iso_packet_size
        );
    }

    /// Submit every not-yet-submitted URB. All URBs are in flight before
    /// any read returns data.
    fn prime_ring(&mut self) {
        while self.primed < self.urbs.len() {
            let slot = &mut self.urbs[self.primed];
            slot.reset_packets();
            match self.device.submit_urb(slot) {
                Ok(()) => self.primed += 1,
                Err(e) => {
                    self.stats.submit_error_count += 1;
                    log::error!("Failed to submit URB[{}]: {}", self.primed, e);
                    return;
                }
            }
        }
    }

    fn teardown_ring(&mut self) {
        if self.urbs.is_empty() {
            return;
        }
        let mut discarded = 0usize;
        for slot in &mut self.urbs {
            if self.device.discard_urb(slot).is_ok() {
                discarded += 1;
            }
        }
        // Drain completions for everything we cancelled
        let mut drained = 0usize;
        while drained < discarded {
            match self.device.reap(ReapMode::NonBlocking) {
                Ok(Some(_)) => drained += 1,
                Ok(None) | Err(_) => break,
            }
        }
        log::debug!("URB ring torn down ({} discarded, {} drained)", discarded, drained);
        self.urbs.clear();
        self.primed = 0;
    }

    /// Read captured audio into `dest`, returning the number of bytes
    /// written: always a multiple of the frame size, always the next bytes
    /// of the stream. Returns 0 when no data is available yet.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        if !self.streaming {
            self.not_streaming_logs += 1;
            if self.not_streaming_logs <= 5 {
                log::error!("read called while not streaming");
            }
            return 0;
        }

        let frame_size = self.config.frame_size();
        let aligned_capacity = (dest.len() / frame_size) * frame_size;
        if aligned_capacity == 0 {
            return 0;
        }

        // Stuck-URB recovery path: the ring was torn down, rebuild it
        if self.urbs.is_empty() {
            if let Some(selected) = self.selected.clone() {
                self.allocate_ring(&selected.endpoint);
            }
        }
        if self.primed < self.urbs.len() {
            self.prime_ring();
            if self.primed < self.urbs.len() {
                return 0;
            }
        }

        let mut written = self.drain_pending(dest, aligned_capacity);

        let mut reaped_any = false;
        let mut blocked_once = false;
        loop {
            self.stats.reap_attempts += 1;
            match self.device.reap(ReapMode::NonBlocking) {
                Ok(Some(index)) => {
                    reaped_any = true;
                    if self.handle_completion(index, dest, aligned_capacity, &mut written) {
                        break; // watchdog tore the ring down
                    }
                }
                Ok(None) => {
                    // Nothing queued right now. If this call has produced
                    // nothing at all yet, wait once briefly for the next
                    // completion, then go back to non-blocking reaps.
                    if reaped_any || written > 0 || blocked_once {
                        if !reaped_any {
                            self.stats.eagain_count += 1;
                        }
                        break;
                    }
                    blocked_once = true;
                    self.stats.reap_attempts += 1;
                    match self.device.reap(ReapMode::BlockingMs(BLOCKING_REAP_TIMEOUT_MS)) {
                        Ok(Some(index)) => {
                            reaped_any = true;
                            if self.handle_completion(index, dest, aligned_capacity, &mut written) {
                                break;
                            }
                        }
                        Ok(None) => {
                            self.stats.eagain_count += 1;
                            break;
                        }
                        Err(e) => {
                            self.fatal_reap_error(e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.fatal_reap_error(e);
                    break;
                }
            }
        }

        self.finalize_alignment(dest, written, frame_size)
    }

    fn fatal_reap_error(&mut self, error: UsbIoError) {
        self.stats.reap_error_count += 1;
        log::error!("URB reap failed: {}; tearing down capture", error);
        self.teardown_ring();
        self.streaming = false;
    }

    /// Returns true when the stuck-URB watchdog reset the ring.
    fn handle_completion(
        &mut self,
        index: usize,
        dest: &mut [u8],
        aligned_capacity: usize,
        written: &mut usize,
    ) -> bool {
        self.stats.reap_count += 1;

        // Watchdog bookkeeping. Two independent criteria: an unbroken run
        // of the same URB, and a windowed repeat ratio that still trips
        // when the run is interleaved with the odd healthy completion.
        if self.last_reaped == Some(index) {
            self.consecutive_same += 1;
            self.window_same_count += 1;
        } else {
            self.last_reaped = Some(index);
            self.consecutive_same = 1;
        }

        let stuck_direct = self.consecutive_same >= STUCK_URB_THRESHOLD;

        let window_boundary = self.stats.reap_attempts > 0
            && self.stats.reap_attempts % STUCK_URB_CHECK_INTERVAL == 0;
        let stuck_pattern = window_boundary
            && self.stats.reap_attempts > STUCK_URB_CHECK_INTERVAL
            && self.window_same_count as u64 >= STUCK_URB_CHECK_INTERVAL * 8 / 10;
        let window_same = self.window_same_count;
        if window_boundary {
            self.window_same_count = 0;
        }

        if stuck_direct || stuck_pattern {
            if stuck_direct {
                log::error!(
                    "Stuck URB detected: slot {} reaped {} consecutive times; rebuilding ring",
                    index,
                    self.consecutive_same
                );
            } else {
                log::error!(
                    "Stuck URB pattern detected: {} of the last {} reap attempts repeated the same slot; rebuilding ring",
                    window_same,
                    STUCK_URB_CHECK_INTERVAL
                );
            }
            self.teardown_ring();
            self.last_reaped = None;
            self.consecutive_same = 0;
            self.window_same_count = 0;
            self.stats.stuck_resets += 1;
            return true;
        }

        if index >= self.urbs.len() {
            log::error!("Reaped unknown URB index {}", index);
            return false;
        }

        // Copy packet payloads, then put the slot straight back in flight
        for packet in 0..self.urbs[index].packets() {
            let (payload_ptr, payload_len, status) = {
                let (payload, status) = self.urbs[index].packet(packet);
                (payload.as_ptr(), payload.len(), status)
            };
            if status != 0 {
                self.stats.packet_error_count += 1;
                if self.stats.packet_error_count <= 20 {
                    log::warn!("URB[{}] packet {} status {}", index, packet, status as i32);
                }
            }
            if payload_len == 0 {
                continue;
            }
            // Safety: the payload lives in this slot's buffer; the copy
            // helpers below touch only `dest`, `pending` and counters.
            let payload = unsafe { std::slice::from_raw_parts(payload_ptr, payload_len) };
            self.deliver_bytes(payload, dest, aligned_capacity, written);
        }

        self.urbs[index].reset_packets();
        if let Err(e) = self.device.submit_urb(&mut self.urbs[index]) {
            self.stats.submit_error_count += 1;
            log::error!("Failed to resubmit URB[{}]: {}", index, e);
        }

        false
    }

    /// Copy payload bytes into `dest` up to its frame-aligned capacity;
    /// everything else goes to the pending staging buffer (bounded).
    fn deliver_bytes(
        &mut self,
        payload: &[u8],
        dest: &mut [u8],
        aligned_capacity: usize,
        written: &mut usize,
    ) {
        let space = aligned_capacity - *written;
        let direct = space.min(payload.len());
        dest[*written..*written + direct].copy_from_slice(&payload[..direct]);
        *written += direct;

        let spill = &payload[direct..];
        if spill.is_empty() {
            return;
        }
        let room = MAX_PENDING_BYTES.saturating_sub(self.pending.len());
        let kept = room.min(spill.len());
        self.pending.extend_from_slice(&spill[..kept]);
        if kept < spill.len() {
            let dropped = (spill.len() - kept) as u64;
            self.stats.pending_dropped_bytes += dropped;
            if !self.pending_overflow_warned {
                log::error!(
                    "Capture staging buffer overflow: consumer is falling behind, dropping {} bytes",
                    dropped
                );
                self.pending_overflow_warned = true;
            }
        } else if self.pending.len() < MAX_PENDING_BYTES {
            self.pending_overflow_warned = false;
        }
    }

    fn drain_pending(&mut self, dest: &mut [u8], aligned_capacity: usize) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let take = self.pending.len().min(aligned_capacity);
        dest[..take].copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        take
    }

    /// Keep only whole frames in `dest`; a trailing partial frame moves to
    /// the front of the pending buffer (it is the earliest undelivered
    /// data).
    fn finalize_alignment(&mut self, dest: &mut [u8], written: usize, frame_size: usize) -> usize {
        let tail = written % frame_size;
        if tail == 0 {
            return written;
        }
        let aligned = written - tail;
        let tail_bytes = dest[aligned..written].to_vec();
        self.pending.splice(0..0, tail_bytes);
        aligned
    }
}

impl Drop for UacCapture {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

fn packets_per_urb(endpoint: &UacEndpoint) -> usize {
    let by_interval = 8 * endpoint.packets_per_service_interval as usize;
    let by_size = (MAX_URB_BYTES / endpoint.iso_packet_size.max(1)).max(1);
    by_interval.clamp(1, by_size)
}
