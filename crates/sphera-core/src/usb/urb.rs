//! Owned URB slots
//!
//! usbdevfs takes a variable-length URB record (header plus a trailing
//! array of per-packet descriptors) and a separately allocated transfer
//! buffer, both of which the kernel borrows between SUBMITURB and the reap.
//! Each [`UrbSlot`] owns exactly one such record and its buffer as a single
//! resource: allocated once when streaming starts, submitted/reaped/
//! resubmitted in a loop, released together on stop.
//!
//! The slot index is stashed in the URB's `usercontext`, so a reaped kernel
//! pointer maps straight back to the owning slot.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::raw::c_void;
use std::ptr::NonNull;

/// usbdevfs URB type for isochronous transfers
pub const URB_TYPE_ISO: u8 = 0;
/// Schedule packets as soon as bandwidth allows
pub const URB_FLAG_ISO_ASAP: u32 = 0x02;

/// Per-packet descriptor trailing the URB header (kernel ABI)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IsoPacketDesc {
    pub length: u32,
    pub actual_length: u32,
    pub status: u32,
}

/// `struct usbdevfs_urb` header (kernel ABI, flexible packet array follows)
#[repr(C)]
pub struct UrbHeader {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: i32,
    pub flags: u32,
    pub buffer: *mut c_void,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    pub signr: u32,
    pub usercontext: *mut c_void,
}

/// One pre-allocated isochronous URB plus its DMA-aligned buffer
pub struct UrbSlot {
    index: usize,
    urb: NonNull<UrbHeader>,
    urb_layout: Layout,
    buffer: NonNull<u8>,
    buffer_layout: Layout,
    packets: usize,
    packet_size: usize,
}

// The kernel only touches the allocations between submit and reap; the
// capture loop upholds that window and never aliases a submitted slot.
unsafe impl Send for UrbSlot {}

impl UrbSlot {
    /// Allocate one slot for `packets` packets of `packet_size` bytes each,
    /// targeting the given IN endpoint. The buffer is 64-byte aligned for
    /// DMA friendliness.
    pub fn new(index: usize, endpoint: u8, packets: usize, packet_size: usize) -> Self {
        assert!(packets > 0 && packet_size > 0);

        let urb_layout = Layout::from_size_align(
            std::mem::size_of::<UrbHeader>() + packets * std::mem::size_of::<IsoPacketDesc>(),
            std::mem::align_of::<UrbHeader>(),
        )
        .expect("URB layout");
        let buffer_layout =
            Layout::from_size_align(packets * packet_size, 64).expect("URB buffer layout");

        let urb = NonNull::new(unsafe { alloc_zeroed(urb_layout) } as *mut UrbHeader)
            .expect("URB allocation failed");
        let buffer =
            NonNull::new(unsafe { alloc_zeroed(buffer_layout) }).expect("URB buffer allocation failed");

        let mut slot = Self {
            index,
            urb,
            urb_layout,
            buffer,
            buffer_layout,
            packets,
            packet_size,
        };

        let header = unsafe { slot.urb.as_mut() };
        header.urb_type = URB_TYPE_ISO;
        header.endpoint = endpoint;
        header.flags = URB_FLAG_ISO_ASAP;
        header.buffer = slot.buffer.as_ptr() as *mut c_void;
        header.buffer_length = (packets * packet_size) as i32;
        header.number_of_packets = packets as i32;
        header.usercontext = index as *mut c_void;
        slot.reset_packets();

        slot
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn packets(&self) -> usize {
        self.packets
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Total buffer capacity in bytes
    pub fn buffer_capacity(&self) -> usize {
        self.packets * self.packet_size
    }

    /// Raw pointer handed to the submit/discard ioctls
    pub fn urb_ptr(&self) -> *mut UrbHeader {
        self.urb.as_ptr()
    }

    fn packet_descs(&self) -> *mut IsoPacketDesc {
        // The flexible array starts directly after the header
        unsafe { self.urb.as_ptr().add(1) as *mut IsoPacketDesc }
    }

    /// Reset all packet descriptors for (re)submission
    pub fn reset_packets(&mut self) {
        let descs = self.packet_descs();
        for i in 0..self.packets {
            unsafe {
                *descs.add(i) = IsoPacketDesc {
                    length: self.packet_size as u32,
                    actual_length: 0,
                    status: 0,
                };
            }
        }
    }

    /// Completed payload and status of one packet. The payload slice is the
    /// packet's `actual_length` prefix of its buffer slot, clamped to the
    /// slot size.
    pub fn packet(&self, packet_index: usize) -> (&[u8], u32) {
        assert!(packet_index < self.packets);
        let desc = unsafe { *self.packet_descs().add(packet_index) };
        let actual = (desc.actual_length as usize).min(self.packet_size);
        let payload = unsafe {
            std::slice::from_raw_parts(
                self.buffer.as_ptr().add(packet_index * self.packet_size),
                actual,
            )
        };
        (payload, desc.status)
    }

    /// Test-only: fill one packet's buffer slot and completion fields
    #[cfg(test)]
    pub(crate) fn fake_completion(&mut self, packet_index: usize, payload: &[u8], status: u32) {
        assert!(payload.len() <= self.packet_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.buffer.as_ptr().add(packet_index * self.packet_size),
                payload.len(),
            );
            *self.packet_descs().add(packet_index) = IsoPacketDesc {
                length: self.packet_size as u32,
                actual_length: payload.len() as u32,
                status,
            };
        }
    }
}

impl Drop for UrbSlot {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.urb.as_ptr() as *mut u8, self.urb_layout);
            dealloc(self.buffer.as_ptr(), self.buffer_layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_initialization() {
        let slot = UrbSlot::new(7, 0x81, 8, 1536);
        assert_eq!(slot.index(), 7);
        assert_eq!(slot.buffer_capacity(), 8 * 1536);

        let header = unsafe { &*slot.urb_ptr() };
        assert_eq!(header.urb_type, URB_TYPE_ISO);
        assert_eq!(header.endpoint, 0x81);
        assert_eq!(header.flags, URB_FLAG_ISO_ASAP);
        assert_eq!(header.number_of_packets, 8);
        assert_eq!(header.usercontext as usize, 7);
        assert_eq!(header.buffer_length, 8 * 1536);

        // Buffer must be 64-byte aligned
        assert_eq!(header.buffer as usize % 64, 0);

        let (payload, status) = slot.packet(0);
        assert!(payload.is_empty());
        assert_eq!(status, 0);
    }

    #[test]
    fn test_completion_and_reset() {
        let mut slot = UrbSlot::new(0, 0x81, 4, 256);
        slot.fake_completion(1, &[1, 2, 3, 4, 5], 0);
        slot.fake_completion(2, &[9; 256], 0);

        let (payload, _) = slot.packet(1);
        assert_eq!(payload, &[1, 2, 3, 4, 5]);
        let (payload, _) = slot.packet(2);
        assert_eq!(payload.len(), 256);

        slot.reset_packets();
        let (payload, status) = slot.packet(1);
        assert!(payload.is_empty());
        assert_eq!(status, 0);
    }
}
