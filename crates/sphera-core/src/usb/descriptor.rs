//! Configuration descriptor parsing and capture endpoint selection
//!
//! The device hands us one opaque configuration descriptor blob; everything
//! the capture path needs is discovered here at runtime: which
//! AudioStreaming interface and alternate setting to enable, which
//! isochronous IN endpoint carries the array data, how many bytes arrive
//! per service interval (including USB 2.0 high-bandwidth multipliers and
//! SuperSpeed companion bursts), and which clock entity governs the sample
//! rate.
//!
//! Parsing is pure slice walking; nothing here touches the device.

use super::clock::ClockTopology;
use super::protocol::*;

/// Discovered runtime geometry of the capture endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UacEndpoint {
    pub interface: u8,
    pub alt_setting: u8,
    /// IN endpoint address (bit 7 set)
    pub ep_address: u8,
    /// Payload bytes per service interval, multipliers included
    pub iso_packet_size: usize,
    /// Service-interval scale from bInterval (microframes on high/SuperSpeed,
    /// frames on full speed)
    pub packets_per_service_interval: u32,
    pub is_high_speed: bool,
    pub is_super_speed: bool,
}

/// Advertised sample-rate capability of one alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleRateSet {
    /// Nothing advertised in descriptors (UAC2: rates live behind the clock
    /// entity's RANGE control; endpoint-implied otherwise)
    Implied,
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32 },
}

impl SampleRateSet {
    pub fn contains(&self, rate: u32) -> bool {
        match self {
            SampleRateSet::Implied => false,
            SampleRateSet::Discrete(rates) => rates.contains(&rate),
            SampleRateSet::Continuous { min, max } => (*min..=*max).contains(&rate),
        }
    }
}

/// SuperSpeed endpoint companion fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsCompanion {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

/// One endpoint of an AudioStreaming alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEndpoint {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub companion: Option<SsCompanion>,
}

impl ParsedEndpoint {
    pub fn is_isochronous_in(&self) -> bool {
        self.address & EP_DIR_IN != 0 && self.attributes & EP_XFER_MASK == EP_XFER_ISOCHRONOUS
    }

    fn multiplier_bits(&self) -> u16 {
        (self.max_packet_size >> 11) & 0x3
    }

    pub fn is_super_speed(&self) -> bool {
        self.companion.is_some()
    }

    pub fn is_high_speed(&self) -> bool {
        !self.is_super_speed() && self.multiplier_bits() > 0
    }

    /// Payload bytes per service interval. SuperSpeed uses the companion's
    /// wBytesPerInterval (or burst×mult×base when the device left it zero);
    /// otherwise the wMaxPacketSize base with the high-bandwidth multiplier.
    pub fn bytes_per_interval(&self) -> usize {
        let base = (self.max_packet_size & 0x7FF) as usize;
        if let Some(companion) = &self.companion {
            if companion.bytes_per_interval != 0 {
                companion.bytes_per_interval as usize
            } else {
                let mult = (companion.attributes & 0x3) as usize;
                base * (companion.max_burst as usize + 1) * (mult + 1)
            }
        } else {
            base * (self.multiplier_bits() as usize + 1)
        }
    }

    /// bInterval decoded to service intervals: 2^(bInterval-1) microframes
    /// on high/SuperSpeed, bInterval frames on full speed.
    pub fn packets_per_service_interval(&self) -> u32 {
        if self.is_super_speed() || self.is_high_speed() {
            1u32 << (self.interval.clamp(1, 16) - 1)
        } else {
            self.interval.max(1) as u32
        }
    }

    /// Service callbacks per second for this endpoint
    pub fn service_rate(&self) -> f64 {
        let base = if self.is_super_speed() || self.is_high_speed() {
            8_000.0
        } else {
            1_000.0
        };
        base / self.packets_per_service_interval() as f64
    }
}

/// One AudioStreaming alternate setting (alt > 0 only)
#[derive(Debug, Clone)]
pub struct StreamingAltSetting {
    pub interface: u8,
    pub alt_setting: u8,
    /// bInterfaceProtocol; 0x20 marks UAC2
    pub protocol: u8,
    /// Clock/terminal entity referenced by AS_GENERAL
    pub terminal_link: Option<u8>,
    /// Channel count advertised by AS_GENERAL (UAC2) or FORMAT_TYPE (UAC1)
    pub num_channels: Option<u16>,
    pub rates: SampleRateSet,
    pub endpoints: Vec<ParsedEndpoint>,
}

impl StreamingAltSetting {
    pub fn is_uac2(&self) -> bool {
        self.protocol == PROTOCOL_UAC2
    }
}

/// Everything the capture path learns from the configuration descriptor
#[derive(Debug, Clone, Default)]
pub struct ParsedConfig {
    /// AudioControl interface number
    pub control_interface: Option<u8>,
    pub clocks: ClockTopology,
    /// (terminal id, referenced clock entity id) pairs from UAC2 terminals
    pub terminal_clocks: Vec<(u8, u8)>,
    pub streams: Vec<StreamingAltSetting>,
}

impl ParsedConfig {
    /// Clock entity referenced by a terminal id
    pub fn terminal_clock(&self, terminal: u8) -> Option<u8> {
        self.terminal_clocks
            .iter()
            .find(|(t, _)| *t == terminal)
            .map(|(_, c)| *c)
    }
}

/// Walk a full configuration descriptor blob.
///
/// Malformed trailing bytes end the walk; descriptors with a bogus zero
/// length abort it (the blob cannot be advanced past them).
pub fn parse_configuration(blob: &[u8]) -> ParsedConfig {
    let mut config = ParsedConfig::default();

    #[derive(PartialEq)]
    enum Section {
        Other,
        AudioControl,
        AudioStreaming,
    }

    let mut section = Section::Other;
    let mut current_protocol = 0u8;
    let mut offset = 0usize;

    while offset + 2 <= blob.len() {
        let length = blob[offset] as usize;
        if length < 2 || offset + length > blob.len() {
            break;
        }
        let descriptor = &blob[offset..offset + length];
        let descriptor_type = descriptor[1];

        match descriptor_type {
            DT_INTERFACE => {
                if length >= 9 {
                    let interface = descriptor[2];
                    let alt_setting = descriptor[3];
                    let class = descriptor[5];
                    let subclass = descriptor[6];
                    current_protocol = descriptor[7];

                    if class == CLASS_AUDIO && subclass == SUBCLASS_AUDIOCONTROL {
                        section = Section::AudioControl;
                        config.control_interface = Some(interface);
                    } else if class == CLASS_AUDIO
                        && subclass == SUBCLASS_AUDIOSTREAMING
                        && alt_setting > 0
                    {
                        section = Section::AudioStreaming;
                        config.streams.push(StreamingAltSetting {
                            interface,
                            alt_setting,
                            protocol: current_protocol,
                            terminal_link: None,
                            num_channels: None,
                            rates: SampleRateSet::Implied,
                            endpoints: Vec::new(),
                        });
                    } else {
                        section = Section::Other;
                    }
                }
            }
            DT_CS_INTERFACE => match section {
                Section::AudioControl => {
                    config.clocks.parse_entity(descriptor);
                    parse_terminal(descriptor, &mut config.terminal_clocks);
                }
                Section::AudioStreaming => {
                    if let Some(stream) = config.streams.last_mut() {
                        parse_streaming_cs(descriptor, stream);
                    }
                }
                Section::Other => {}
            },
            DT_ENDPOINT => {
                if section == Section::AudioStreaming && length >= 7 {
                    if let Some(stream) = config.streams.last_mut() {
                        stream.endpoints.push(ParsedEndpoint {
                            address: descriptor[2],
                            attributes: descriptor[3],
                            max_packet_size: u16::from_le_bytes([descriptor[4], descriptor[5]]),
                            interval: descriptor[6],
                            companion: None,
                        });
                    }
                }
            }
            DT_SS_ENDPOINT_COMPANION => {
                if section == Section::AudioStreaming && length >= 6 {
                    if let Some(endpoint) = config
                        .streams
                        .last_mut()
                        .and_then(|s| s.endpoints.last_mut())
                    {
                        endpoint.companion = Some(SsCompanion {
                            max_burst: descriptor[2],
                            attributes: descriptor[3],
                            bytes_per_interval: u16::from_le_bytes([descriptor[4], descriptor[5]]),
                        });
                    }
                }
            }
            _ => {}
        }

        offset += length;
    }

    config
}

/// UAC2 input/output terminals carry the clock entity reference
fn parse_terminal(descriptor: &[u8], terminal_clocks: &mut Vec<(u8, u8)>) {
    match descriptor[2] {
        AC_INPUT_TERMINAL if descriptor.len() >= 8 => {
            // bTerminalID @3, bCSourceID @7 (UAC2 layout)
            terminal_clocks.push((descriptor[3], descriptor[7]));
        }
        AC_OUTPUT_TERMINAL if descriptor.len() >= 9 => {
            // bTerminalID @3, bCSourceID @8 (UAC2 layout)
            terminal_clocks.push((descriptor[3], descriptor[8]));
        }
        _ => {}
    }
}

fn parse_streaming_cs(descriptor: &[u8], stream: &mut StreamingAltSetting) {
    match descriptor[2] {
        AS_GENERAL => {
            if stream.is_uac2() && descriptor.len() >= 16 {
                stream.terminal_link = Some(descriptor[3]);
                stream.num_channels = Some(descriptor[10] as u16);
            } else if descriptor.len() >= 5 {
                // UAC1: bTerminalLink @3, bDelay @4, wFormatTag @5
                stream.terminal_link = Some(descriptor[3]);
            }
        }
        AS_FORMAT_TYPE => {
            if stream.is_uac2() {
                // UAC2 Format Type I carries no rates; they come from the
                // clock entity at runtime
                return;
            }
            // UAC1 Format Type I: bNrChannels @4, bSamFreqType @7, rates @8
            if descriptor.len() < 8 {
                return;
            }
            stream.num_channels = Some(descriptor[4] as u16);
            let freq_type = descriptor[7] as usize;
            let rates = &descriptor[8..];
            if freq_type == 0 {
                if rates.len() >= 6 {
                    stream.rates = SampleRateSet::Continuous {
                        min: rate24(&rates[0..3]),
                        max: rate24(&rates[3..6]),
                    };
                }
            } else {
                let count = freq_type.min(rates.len() / 3);
                stream.rates = SampleRateSet::Discrete(
                    (0..count).map(|i| rate24(&rates[i * 3..i * 3 + 3])).collect(),
                );
            }
        }
        _ => {}
    }
}

#[inline]
fn rate24(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}

/// A scored capture candidate, ready for the enable sequence
#[derive(Debug, Clone)]
pub struct SelectedStream {
    pub endpoint: UacEndpoint,
    pub protocol: u8,
    pub terminal_link: Option<u8>,
    pub num_channels: Option<u16>,
    pub rates: SampleRateSet,
}

/// Pick the best isochronous IN endpoint for the requested sample rate.
///
/// Candidates are ranked by: advertised support for the requested rate,
/// then closeness of the endpoint-derived rate (`frames_per_interval ×
/// service_rate`), then smaller per-interval payload.
pub fn select_capture_endpoint(
    config: &ParsedConfig,
    requested_rate: u32,
    frame_size: usize,
) -> Option<SelectedStream> {
    let mut best: Option<(bool, f64, usize, SelectedStream)> = None;

    for stream in &config.streams {
        for endpoint in &stream.endpoints {
            if !endpoint.is_isochronous_in() {
                continue;
            }
            let bytes_per_interval = endpoint.bytes_per_interval();
            if bytes_per_interval == 0 {
                continue;
            }

            let advertised = stream.rates.contains(requested_rate);
            let frames_per_interval = bytes_per_interval as f64 / frame_size as f64;
            let derived_rate = frames_per_interval * endpoint.service_rate();
            let distance = (derived_rate - requested_rate as f64).abs();

            let candidate = SelectedStream {
                endpoint: UacEndpoint {
                    interface: stream.interface,
                    alt_setting: stream.alt_setting,
                    ep_address: endpoint.address,
                    iso_packet_size: bytes_per_interval,
                    packets_per_service_interval: endpoint.packets_per_service_interval(),
                    is_high_speed: endpoint.is_high_speed(),
                    is_super_speed: endpoint.is_super_speed(),
                },
                protocol: stream.protocol,
                terminal_link: stream.terminal_link,
                num_channels: stream.num_channels,
                rates: stream.rates.clone(),
            };

            let better = match &best {
                None => true,
                Some((best_advertised, best_distance, best_bytes, _)) => {
                    match (advertised, *best_advertised) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => {
                            if (distance - best_distance).abs() > f64::EPSILON {
                                distance < *best_distance
                            } else {
                                bytes_per_interval < *best_bytes
                            }
                        }
                    }
                }
            };
            if better {
                best = Some((advertised, distance, bytes_per_interval, candidate));
            }
        }
    }

    best.map(|(_, _, _, selected)| selected)
}
