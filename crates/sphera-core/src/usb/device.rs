//! Device I/O port for USB capture
//!
//! [`UsbDeviceIo`] is the seam between the capture state machine and the
//! kernel: control transfers, interface selection, endpoint halt recovery
//! and the URB submit/reap cycle. The production implementation drives a
//! pre-opened usbdevfs file descriptor (the host performs enumeration and
//! permission prompts and hands us the fd); tests script the whole device.

use thiserror::Error;

use super::urb::UrbSlot;

/// Classified I/O failures. `Again`, `Busy` and `Proto` are the transient
/// class handled with bounded retry by the capture operators; everything
/// else is fatal to streaming.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbIoError {
    #[error("no data ready (EAGAIN)")]
    Again,

    #[error("device busy (EBUSY)")]
    Busy,

    #[error("protocol error (EPROTO)")]
    Proto,

    #[error("request timed out")]
    TimedOut,

    #[error("device disconnected")]
    NoDevice,

    #[error("invalid request")]
    Invalid,

    #[error("OS error (errno {0})")]
    Os(i32),
}

impl UsbIoError {
    /// True for the transient class retried by the capture operators
    pub fn is_transient(&self) -> bool {
        matches!(self, UsbIoError::Again | UsbIoError::Busy | UsbIoError::Proto)
    }

    #[cfg(unix)]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EAGAIN => UsbIoError::Again,
            libc::EBUSY => UsbIoError::Busy,
            libc::EPROTO => UsbIoError::Proto,
            libc::ETIMEDOUT => UsbIoError::TimedOut,
            libc::ENODEV | libc::ESHUTDOWN => UsbIoError::NoDevice,
            libc::EINVAL => UsbIoError::Invalid,
            other => UsbIoError::Os(other),
        }
    }
}

/// Setup packet of a control transfer (data direction implied by
/// `request_type` bit 7)
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub timeout_ms: u32,
}

/// How long a reap call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    NonBlocking,
    /// Bounded wait; the kernel reap itself stays non-blocking, the wait is
    /// on fd readiness
    BlockingMs(u32),
}

/// Kernel-facing operations of the capture path
pub trait UsbDeviceIo: Send {
    /// Host-to-device control transfer
    fn control_out(&mut self, request: &ControlRequest, data: &[u8]) -> Result<(), UsbIoError>;

    /// Device-to-host control transfer; returns bytes received
    fn control_in(&mut self, request: &ControlRequest, data: &mut [u8]) -> Result<usize, UsbIoError>;

    /// SET_INTERFACE(interface, alt)
    fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbIoError>;

    /// CLEAR_HALT on an endpoint (best effort in the flush protocol)
    fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbIoError>;

    /// Current USB frame number, when the host controller exposes it
    fn current_frame(&mut self) -> Option<u32>;

    /// Queue one URB. The kernel borrows the slot until it is reaped or
    /// discarded.
    fn submit_urb(&mut self, slot: &mut UrbSlot) -> Result<(), UsbIoError>;

    /// Cancel one in-flight URB (it must still be reaped afterwards)
    fn discard_urb(&mut self, slot: &mut UrbSlot) -> Result<(), UsbIoError>;

    /// Reap one completion, returning the slot index from `usercontext`.
    /// `Ok(None)` means nothing was ready within the allowed wait.
    fn reap(&mut self, mode: ReapMode) -> Result<Option<usize>, UsbIoError>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxUsbDevice;

#[cfg(target_os = "linux")]
mod linux {
    //! usbdevfs backend
    //!
    //! Request codes are computed with nix's request-code macros; the calls
    //! go through raw `libc::ioctl` because usbdevfs predates the ioctl
    //! direction conventions the nix wrapper macros encode (DISCARDURB is
    //! `_IO` yet takes a pointer, SETINTERFACE is `_IOR` yet reads).

    use super::*;
    use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::raw::c_void;

    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    #[repr(C)]
    struct UsbdevfsCtrlTransfer {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: u32,
        data: *mut c_void,
    }

    #[repr(C)]
    struct UsbdevfsSetInterface {
        interface: u32,
        alt_setting: u32,
    }

    const USBDEVFS_MAGIC: u8 = b'U';

    fn req_control() -> libc::c_ulong {
        nix::request_code_readwrite!(
            USBDEVFS_MAGIC,
            0,
            std::mem::size_of::<UsbdevfsCtrlTransfer>()
        ) as libc::c_ulong
    }

    fn req_setinterface() -> libc::c_ulong {
        nix::request_code_read!(
            USBDEVFS_MAGIC,
            4,
            std::mem::size_of::<UsbdevfsSetInterface>()
        ) as libc::c_ulong
    }

    fn req_submiturb() -> libc::c_ulong {
        nix::request_code_read!(
            USBDEVFS_MAGIC,
            10,
            std::mem::size_of::<super::super::urb::UrbHeader>()
        ) as libc::c_ulong
    }

    fn req_discardurb() -> libc::c_ulong {
        nix::request_code_none!(USBDEVFS_MAGIC, 11) as libc::c_ulong
    }

    fn req_reapurbndelay() -> libc::c_ulong {
        nix::request_code_write!(USBDEVFS_MAGIC, 13, std::mem::size_of::<*mut c_void>())
            as libc::c_ulong
    }

    fn req_clear_halt() -> libc::c_ulong {
        nix::request_code_read!(USBDEVFS_MAGIC, 21, std::mem::size_of::<libc::c_uint>())
            as libc::c_ulong
    }

    /// Frame-counter query; not in every kernel's headers, failure is fine
    fn req_get_current_frame() -> libc::c_ulong {
        nix::request_code_read!(USBDEVFS_MAGIC, 19, std::mem::size_of::<libc::c_uint>())
            as libc::c_ulong
    }

    /// usbdevfs device handle over a duplicated, owned descriptor
    pub struct LinuxUsbDevice {
        fd: OwnedFd,
    }

    impl LinuxUsbDevice {
        /// Duplicate and own a pre-opened `/dev/bus/usb/...` descriptor.
        pub fn new(fd: RawFd) -> std::io::Result<Self> {
            let dup_fd = unsafe { libc::dup(fd) };
            if dup_fd < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(dup_fd) },
            })
        }

        fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        fn ioctl(&self, request: libc::c_ulong, arg: *mut c_void) -> Result<i32, UsbIoError> {
            let result = unsafe { libc::ioctl(self.raw_fd(), request, arg) };
            if result < 0 {
                Err(UsbIoError::from_errno(Errno::last_raw()))
            } else {
                Ok(result)
            }
        }

        fn control(
            &self,
            request: &ControlRequest,
            data: *mut c_void,
            length: u16,
        ) -> Result<usize, UsbIoError> {
            let mut transfer = UsbdevfsCtrlTransfer {
                request_type: request.request_type,
                request: request.request,
                value: request.value,
                index: request.index,
                length,
                timeout: request.timeout_ms,
                data,
            };
            self.ioctl(req_control(), &mut transfer as *mut _ as *mut c_void)
                .map(|n| n as usize)
        }

        fn reap_ndelay(&self) -> Result<Option<usize>, UsbIoError> {
            let mut completed: *mut super::super::urb::UrbHeader = std::ptr::null_mut();
            match self.ioctl(
                req_reapurbndelay(),
                &mut completed as *mut _ as *mut c_void,
            ) {
                Ok(_) => {
                    if completed.is_null() {
                        Ok(None)
                    } else {
                        Ok(Some(unsafe { (*completed).usercontext as usize }))
                    }
                }
                Err(UsbIoError::Again) => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

    impl UsbDeviceIo for LinuxUsbDevice {
        fn control_out(&mut self, request: &ControlRequest, data: &[u8]) -> Result<(), UsbIoError> {
            self.control(
                request,
                data.as_ptr() as *mut c_void,
                data.len() as u16,
            )
            .map(|_| ())
        }

        fn control_in(
            &mut self,
            request: &ControlRequest,
            data: &mut [u8],
        ) -> Result<usize, UsbIoError> {
            self.control(request, data.as_mut_ptr() as *mut c_void, data.len() as u16)
        }

        fn set_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbIoError> {
            let mut setting = UsbdevfsSetInterface {
                interface: interface as u32,
                alt_setting: alt_setting as u32,
            };
            self.ioctl(req_setinterface(), &mut setting as *mut _ as *mut c_void)
                .map(|_| ())
        }

        fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbIoError> {
            let mut ep = endpoint as libc::c_uint;
            self.ioctl(req_clear_halt(), &mut ep as *mut _ as *mut c_void)
                .map(|_| ())
        }

        fn current_frame(&mut self) -> Option<u32> {
            let mut frame: libc::c_uint = 0;
            self.ioctl(req_get_current_frame(), &mut frame as *mut _ as *mut c_void)
                .ok()
                .map(|_| frame as u32)
        }

        fn submit_urb(&mut self, slot: &mut UrbSlot) -> Result<(), UsbIoError> {
            self.ioctl(req_submiturb(), slot.urb_ptr() as *mut c_void)
                .map(|_| ())
        }

        fn discard_urb(&mut self, slot: &mut UrbSlot) -> Result<(), UsbIoError> {
            self.ioctl(req_discardurb(), slot.urb_ptr() as *mut c_void)
                .map(|_| ())
        }

        fn reap(&mut self, mode: ReapMode) -> Result<Option<usize>, UsbIoError> {
            match mode {
                ReapMode::NonBlocking => self.reap_ndelay(),
                ReapMode::BlockingMs(timeout_ms) => {
                    if let Some(index) = self.reap_ndelay()? {
                        return Ok(Some(index));
                    }
                    // Completions flag the fd writable in usbdevfs
                    let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLOUT)];
                    let timeout =
                        PollTimeout::try_from(timeout_ms as i32).unwrap_or(PollTimeout::MAX);
                    match poll(&mut fds, timeout) {
                        Ok(0) => Ok(None),
                        Ok(_) => self.reap_ndelay(),
                        Err(Errno::EINTR) => Ok(None),
                        Err(e) => Err(UsbIoError::from_errno(e as i32)),
                    }
                }
            }
        }
    }
}
