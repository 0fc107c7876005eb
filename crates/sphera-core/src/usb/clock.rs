//! UAC2 clock entity topology
//!
//! UAC2 devices expose a graph of clock entities on the AudioControl
//! interface: Clock Sources (the actual oscillators), Clock Selectors
//! (n-to-1 switches) and Clock Multipliers. A streaming interface references
//! this graph through its terminal's `bCSourceID`; programming the sample
//! rate requires resolving that reference to a concrete Clock Source.
//!
//! This module holds the parsed topology and the pure graph walk; the
//! control transfers needed at selectors (GET/SET pin) and for CLOCK_VALID
//! polling live with the capture state machine, which owns the device.

use super::protocol::{control_readable, control_writable};

/// A Clock Source entity (bmAttributes bit 0-1: clock type)
#[derive(Debug, Clone)]
pub struct ClockSource {
    pub id: u8,
    pub attributes: u8,
    pub controls: u32,
}

impl ClockSource {
    /// Sampling-frequency control is control index 1
    pub fn freq_writable(&self) -> bool {
        control_writable(self.controls, 1)
    }

    pub fn freq_readable(&self) -> bool {
        control_readable(self.controls, 1)
    }

    /// Clock-validity control is control index 2
    pub fn validity_readable(&self) -> bool {
        control_readable(self.controls, 2)
    }
}

/// A Clock Selector entity with its input pin entity ids
#[derive(Debug, Clone)]
pub struct ClockSelector {
    pub id: u8,
    pub inputs: Vec<u8>,
    pub controls: u32,
}

impl ClockSelector {
    /// Selector pin control is control index 1
    pub fn pin_readable(&self) -> bool {
        control_readable(self.controls, 1)
    }

    pub fn pin_writable(&self) -> bool {
        control_writable(self.controls, 1)
    }
}

/// A Clock Multiplier entity deriving from one upstream entity
#[derive(Debug, Clone)]
pub struct ClockMultiplier {
    pub id: u8,
    pub source_id: u8,
}

/// Parsed clock entities of one AudioControl interface
#[derive(Debug, Clone, Default)]
pub struct ClockTopology {
    pub sources: Vec<ClockSource>,
    pub selectors: Vec<ClockSelector>,
    pub multipliers: Vec<ClockMultiplier>,
}

/// One step of the resolution walk, interpreted by the capture state machine
#[derive(Debug, Clone)]
pub enum ClockNode<'a> {
    Source(&'a ClockSource),
    Selector(&'a ClockSelector),
    Multiplier(&'a ClockMultiplier),
}

impl ClockTopology {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.selectors.is_empty() && self.multipliers.is_empty()
    }

    pub fn node(&self, id: u8) -> Option<ClockNode<'_>> {
        if let Some(source) = self.sources.iter().find(|s| s.id == id) {
            return Some(ClockNode::Source(source));
        }
        if let Some(selector) = self.selectors.iter().find(|s| s.id == id) {
            return Some(ClockNode::Selector(selector));
        }
        if let Some(multiplier) = self.multipliers.iter().find(|m| m.id == id) {
            return Some(ClockNode::Multiplier(multiplier));
        }
        None
    }

    pub fn source(&self, id: u8) -> Option<&ClockSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Parse one class-specific AudioControl descriptor into the topology.
    /// `body` is the full descriptor including length and type bytes.
    /// Unknown or malformed entities are skipped.
    pub fn parse_entity(&mut self, body: &[u8]) {
        use super::protocol::{AC_CLOCK_MULTIPLIER, AC_CLOCK_SELECTOR, AC_CLOCK_SOURCE};

        if body.len() < 3 {
            return;
        }
        match body[2] {
            AC_CLOCK_SOURCE => {
                // bClockID, bmAttributes, bmControls, bAssocTerminal, iClockSource
                if body.len() >= 7 {
                    self.sources.push(ClockSource {
                        id: body[3],
                        attributes: body[4],
                        controls: body[5] as u32,
                    });
                }
            }
            AC_CLOCK_SELECTOR => {
                // bClockID, bNrInPins, baCSourceID[p], bmControls, iClockSelector
                if body.len() >= 5 {
                    let pins = body[4] as usize;
                    if body.len() >= 5 + pins + 2 {
                        self.selectors.push(ClockSelector {
                            id: body[3],
                            inputs: body[5..5 + pins].to_vec(),
                            controls: body[5 + pins] as u32,
                        });
                    }
                }
            }
            AC_CLOCK_MULTIPLIER => {
                // bClockID, bCSourceID, bmControls, iClockMultiplier
                if body.len() >= 6 {
                    self.multipliers.push(ClockMultiplier {
                        id: body[3],
                        source_id: body[4],
                    });
                }
            }
            _ => {}
        }
    }
}
