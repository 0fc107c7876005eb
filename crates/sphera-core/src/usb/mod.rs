//! USB Audio Class capture
//!
//! The host hands the engine a pre-opened usbdevfs file descriptor for the
//! array; everything else happens here. [`capture::UacCapture`] drives the
//! session: descriptor parsing and endpoint scoring ([`descriptor`]), clock
//! entity resolution ([`clock`]), the UAC request vocabulary
//! ([`protocol`]), owned URB slots ([`urb`]) and the kernel seam
//! ([`device`]).

pub mod capture;
pub mod clock;
pub mod descriptor;
pub mod device;
pub mod protocol;
pub mod urb;

pub use capture::{CaptureConfig, CaptureError, CaptureStats, UacCapture, NUM_URBS};
pub use descriptor::UacEndpoint;
pub use device::{ControlRequest, ReapMode, UsbDeviceIo, UsbIoError};

#[cfg(target_os = "linux")]
pub use device::LinuxUsbDevice;
