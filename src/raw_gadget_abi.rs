//! `nix`-based ioctl bindings over the kernel's public `usb_raw_gadget`
//! character-device ABI (`/dev/raw-gadget`, `linux/usb/raw_gadget.h`).
//!
//! Only the pieces this proxy actually drives are bound: event fetch, EP0
//! read/write/stall/configure, and non-zero endpoint enable/disable/read/
//! write. Struct layouts mirror the kernel header's `#[repr(C)]` shape.

use std::os::fd::RawFd;

use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};

pub const USB_RAW_IOCTL_MAGIC: u8 = b'U';

pub const USB_RAW_EVENT_INVALID: u32 = 0;
pub const USB_RAW_EVENT_CONNECT: u32 = 1;
pub const USB_RAW_EVENT_CONTROL: u32 = 2;
pub const USB_RAW_EVENT_SUSPEND: u32 = 3;
pub const USB_RAW_EVENT_RESUME: u32 = 4;
pub const USB_RAW_EVENT_RESET: u32 = 5;
pub const USB_RAW_EVENT_DISCONNECT: u32 = 6;

/// Signals, in `usb_raw_event::length`, that the gadget transport has closed.
pub const USB_RAW_EVENT_LENGTH_CLOSED: u32 = 0xFFFF_FFFF;

pub const USB_RAW_SPEED_UNKNOWN: u8 = 0;
pub const USB_RAW_SPEED_LOW: u8 = 1;
pub const USB_RAW_SPEED_FULL: u8 = 2;
pub const USB_RAW_SPEED_HIGH: u8 = 3;
pub const USB_RAW_SPEED_SUPER: u8 = 5;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UsbRawInit {
    pub driver_name: [u8; 32],
    pub device_name: [u8; 32],
    pub speed: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UsbRawEventHeader {
    pub kind: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UsbCtrlRequest {
    pub b_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// A fetched `usb_raw_event` with its inline setup packet (valid only when
/// `header.kind == USB_RAW_EVENT_CONTROL`) and any inline data.
#[repr(C)]
pub struct UsbRawControlEvent {
    pub header: UsbRawEventHeader,
    pub ctrl: UsbCtrlRequest,
}

/// The kernel's `usb_raw_ep_io` carries a flexible array member after the
/// header; `nix`'s ioctl macros need a fixed-size type, so the payload is
/// inlined at `TransferBuffer`'s capacity rather than heap-allocated per call.
#[repr(C)]
pub struct UsbRawEpIo {
    pub ep: u16,
    pub flags: u16,
    pub length: u32,
    pub data: [u8; crate::buffer::MAX_LENGTH],
}

impl UsbRawEpIo {
    pub fn new(ep: u16, length: u32) -> Self {
        Self {
            ep,
            flags: 0,
            length,
            data: [0u8; crate::buffer::MAX_LENGTH],
        }
    }
}

ioctl_write_ptr!(usb_raw_ioctl_init, USB_RAW_IOCTL_MAGIC, 0, UsbRawInit);
ioctl_none!(usb_raw_ioctl_run, USB_RAW_IOCTL_MAGIC, 1);
ioctl_read!(usb_raw_ioctl_event_fetch, USB_RAW_IOCTL_MAGIC, 2, UsbRawControlEvent);
ioctl_write_ptr!(usb_raw_ioctl_ep0_write, USB_RAW_IOCTL_MAGIC, 3, UsbRawEpIo);
ioctl_readwrite!(usb_raw_ioctl_ep0_read, USB_RAW_IOCTL_MAGIC, 4, UsbRawEpIo);
ioctl_write_ptr!(usb_raw_ioctl_ep_enable, USB_RAW_IOCTL_MAGIC, 5, [u8; 32]);
ioctl_write_ptr!(usb_raw_ioctl_ep_disable, USB_RAW_IOCTL_MAGIC, 6, u32);
ioctl_write_ptr!(usb_raw_ioctl_ep_write, USB_RAW_IOCTL_MAGIC, 7, UsbRawEpIo);
ioctl_readwrite!(usb_raw_ioctl_ep_read, USB_RAW_IOCTL_MAGIC, 8, UsbRawEpIo);
ioctl_none!(usb_raw_ioctl_configure, USB_RAW_IOCTL_MAGIC, 9);
ioctl_none!(usb_raw_ioctl_ep0_stall, USB_RAW_IOCTL_MAGIC, 12);

pub type RawFdRef = RawFd;
