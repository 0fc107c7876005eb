//! USB and USB Audio Class protocol constants
//!
//! Descriptor types, class/subclass codes and the UAC1/UAC2 request
//! vocabulary used during device negotiation. UAC1 programs the sample rate
//! through an endpoint control; UAC2 through a Clock Source entity reached
//! over the AudioControl interface.

// Standard descriptor types
pub const DT_CONFIGURATION: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_INTERFACE_ASSOCIATION: u8 = 0x0B;
pub const DT_SS_ENDPOINT_COMPANION: u8 = 0x30;

// Class-specific descriptor types
pub const DT_CS_INTERFACE: u8 = 0x24;
pub const DT_CS_ENDPOINT: u8 = 0x25;

// Audio interface class codes
pub const CLASS_AUDIO: u8 = 0x01;
pub const SUBCLASS_AUDIOCONTROL: u8 = 0x01;
pub const SUBCLASS_AUDIOSTREAMING: u8 = 0x02;
/// bInterfaceProtocol for UAC2 (IP version 02.00)
pub const PROTOCOL_UAC2: u8 = 0x20;

// AudioControl class-specific interface subtypes (UAC2 numbering)
pub const AC_HEADER: u8 = 0x01;
pub const AC_INPUT_TERMINAL: u8 = 0x02;
pub const AC_OUTPUT_TERMINAL: u8 = 0x03;
pub const AC_CLOCK_SOURCE: u8 = 0x0A;
pub const AC_CLOCK_SELECTOR: u8 = 0x0B;
pub const AC_CLOCK_MULTIPLIER: u8 = 0x0C;

// AudioStreaming class-specific interface subtypes
pub const AS_GENERAL: u8 = 0x01;
pub const AS_FORMAT_TYPE: u8 = 0x02;

// Standard requests
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;

// UAC1 class requests
pub const UAC_SET_CUR: u8 = 0x01;
pub const UAC_GET_CUR: u8 = 0x81;

// UAC2 class requests
pub const UAC2_CUR: u8 = 0x01;
pub const UAC2_RANGE: u8 = 0x02;

// UAC1 endpoint control selectors
pub const EP_SAMPLING_FREQ_CONTROL: u8 = 0x01;
pub const EP_PITCH_CONTROL: u8 = 0x02;

// UAC2 clock source control selectors
pub const CS_SAM_FREQ_CONTROL: u8 = 0x01;
pub const CS_CLOCK_VALID_CONTROL: u8 = 0x02;

// UAC2 clock selector control selector
pub const CX_CLOCK_SELECTOR_CONTROL: u8 = 0x01;

// bmRequestType values
pub const RT_D2H_STANDARD_DEVICE: u8 = 0x80;
pub const RT_H2D_CLASS_INTERFACE: u8 = 0x21;
pub const RT_D2H_CLASS_INTERFACE: u8 = 0xA1;
pub const RT_H2D_CLASS_ENDPOINT: u8 = 0x22;
pub const RT_D2H_CLASS_ENDPOINT: u8 = 0xA2;

// Endpoint descriptor fields
pub const EP_DIR_IN: u8 = 0x80;
pub const EP_XFER_MASK: u8 = 0x03;
pub const EP_XFER_ISOCHRONOUS: u8 = 0x01;

/// UAC2 bmControls: each control is a 2-bit pair, 0b01 = read-only,
/// 0b11 = read/write. Control indices are 1-based per the spec tables.
#[inline]
pub fn control_readable(bm_controls: u32, control_index: u32) -> bool {
    let shift = (control_index - 1) * 2;
    (bm_controls >> shift) & 0b01 != 0
}

/// See [`control_readable`]; writable means the pair reads 0b11.
#[inline]
pub fn control_writable(bm_controls: u32, control_index: u32) -> bool {
    let shift = (control_index - 1) * 2;
    (bm_controls >> shift) & 0b11 == 0b11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bit_pairs() {
        // Frequency control (index 1) read/write, validity (index 2) read-only
        let bm: u32 = 0b0111;
        assert!(control_readable(bm, 1));
        assert!(control_writable(bm, 1));
        assert!(control_readable(bm, 2));
        assert!(!control_writable(bm, 2));
        assert!(!control_readable(bm, 3));
    }
}
