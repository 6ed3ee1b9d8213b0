//! The upstream side: the kernel's `usb_raw_gadget` transport at
//! `/dev/raw-gadget`, which makes this process appear as a USB device to
//! whatever host it is plugged into.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{ProxyError, ProxyResult};
use crate::raw_gadget_abi::{self, UsbRawControlEvent, UsbRawEpIo};

/// A fetched gadget event: either a control setup packet, or a signal that
/// the transport has closed (`fetch_event` populates this from an inner
/// `length` of `0xFFFFFFFF`).
#[derive(Clone, Copy, Debug)]
pub enum GadgetEvent {
    Control(crate::injection::SetupPacket),
    Closed,
    Other,
}

/// Everything the proxy needs from the upstream gadget transport.
pub trait GadgetSide: Send {
    fn fetch_event(&mut self) -> ProxyResult<GadgetEvent>;

    fn ep0_read(&mut self, out_data: &mut [u8]) -> ProxyResult<usize>;
    fn ep0_write(&mut self, data: &[u8]) -> ProxyResult<usize>;
    fn ep0_stall(&mut self) -> ProxyResult<()>;
    fn configure(&mut self) -> ProxyResult<()>;

    fn ep_enable(&mut self, descriptor: &crate::topology::EndpointDescriptor) -> ProxyResult<i32>;
    fn ep_disable(&mut self, endpoint_index: i32) -> ProxyResult<()>;
    fn ep_read(&mut self, endpoint_index: i32, out_data: &mut [u8]) -> ProxyResult<usize>;
    fn ep_write(&mut self, endpoint_index: i32, data: &[u8]) -> ProxyResult<usize>;
}

/// Production `GadgetSide`, binding `/dev/raw-gadget` via the ioctls in
/// [`crate::raw_gadget_abi`].
pub struct RawGadget {
    file: File,
}

impl RawGadget {
    pub fn open(path: &Path, driver_name: &str, device_name: &str) -> ProxyResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ProxyError::GadgetOpen {
                path: path.to_path_buf(),
                source,
            })?;

        let mut init = raw_gadget_abi::UsbRawInit {
            driver_name: [0u8; 32],
            device_name: [0u8; 32],
            speed: raw_gadget_abi::USB_RAW_SPEED_HIGH,
        };
        copy_name(&mut init.driver_name, driver_name);
        copy_name(&mut init.device_name, device_name);

        unsafe { raw_gadget_abi::usb_raw_ioctl_init(file.as_raw_fd(), &init) }
            .map_err(|e| ProxyError::GadgetIoctl("INIT", e))?;
        unsafe { raw_gadget_abi::usb_raw_ioctl_run(file.as_raw_fd()) }
            .map_err(|e| ProxyError::GadgetIoctl("RUN", e))?;

        Ok(Self { file })
    }
}

fn copy_name(dest: &mut [u8; 32], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(31);
    dest[..n].copy_from_slice(&bytes[..n]);
}

impl GadgetSide for RawGadget {
    fn fetch_event(&mut self) -> ProxyResult<GadgetEvent> {
        let mut event = UsbRawControlEvent {
            header: raw_gadget_abi::UsbRawEventHeader::default(),
            ctrl: raw_gadget_abi::UsbCtrlRequest::default(),
        };
        unsafe { raw_gadget_abi::usb_raw_ioctl_event_fetch(self.file.as_raw_fd(), &mut event) }
            .map_err(|e| ProxyError::GadgetIoctl("EVENT_FETCH", e))?;

        if event.header.length == raw_gadget_abi::USB_RAW_EVENT_LENGTH_CLOSED {
            return Ok(GadgetEvent::Closed);
        }
        if event.header.kind != raw_gadget_abi::USB_RAW_EVENT_CONTROL {
            return Ok(GadgetEvent::Other);
        }

        Ok(GadgetEvent::Control(crate::injection::SetupPacket {
            b_request_type: event.ctrl.b_request_type,
            b_request: event.ctrl.b_request,
            w_value: event.ctrl.w_value,
            w_index: event.ctrl.w_index,
            w_length: event.ctrl.w_length,
        }))
    }

    fn ep0_read(&mut self, out_data: &mut [u8]) -> ProxyResult<usize> {
        let mut io = UsbRawEpIo::new(0, out_data.len() as u32);
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep0_read(self.file.as_raw_fd(), &mut io) }
            .map_err(|e| ProxyError::GadgetIoctl("EP0_READ", e))?;
        let n = (io.length as usize).min(out_data.len());
        out_data[..n].copy_from_slice(&io.data[..n]);
        Ok(n)
    }

    fn ep0_write(&mut self, data: &[u8]) -> ProxyResult<usize> {
        let mut io = UsbRawEpIo::new(0, data.len() as u32);
        io.data[..data.len()].copy_from_slice(data);
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep0_write(self.file.as_raw_fd(), &io) }
            .map_err(|e| ProxyError::GadgetIoctl("EP0_WRITE", e))?;
        Ok(data.len())
    }

    fn ep0_stall(&mut self) -> ProxyResult<()> {
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep0_stall(self.file.as_raw_fd()) }
            .map_err(|e| ProxyError::GadgetIoctl("EP0_STALL", e))?;
        Ok(())
    }

    fn configure(&mut self) -> ProxyResult<()> {
        unsafe { raw_gadget_abi::usb_raw_ioctl_configure(self.file.as_raw_fd()) }
            .map_err(|e| ProxyError::GadgetIoctl("CONFIGURE", e))?;
        Ok(())
    }

    fn ep_enable(&mut self, descriptor: &crate::topology::EndpointDescriptor) -> ProxyResult<i32> {
        let mut raw_descriptor = [0u8; 32];
        raw_descriptor[2] = descriptor.address;
        raw_descriptor[3] = descriptor.attributes;
        raw_descriptor[4..6].copy_from_slice(&descriptor.max_packet_size.to_le_bytes());

        let result = unsafe { raw_gadget_abi::usb_raw_ioctl_ep_enable(self.file.as_raw_fd(), &raw_descriptor) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_ENABLE", e))?;
        Ok(result)
    }

    fn ep_disable(&mut self, endpoint_index: i32) -> ProxyResult<()> {
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep_disable(self.file.as_raw_fd(), &(endpoint_index as u32)) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_DISABLE", e))?;
        Ok(())
    }

    fn ep_read(&mut self, endpoint_index: i32, out_data: &mut [u8]) -> ProxyResult<usize> {
        let mut io = UsbRawEpIo::new(endpoint_index as u16, out_data.len() as u32);
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep_read(self.file.as_raw_fd(), &mut io) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_READ", e))?;
        let n = (io.length as usize).min(out_data.len());
        out_data[..n].copy_from_slice(&io.data[..n]);
        Ok(n)
    }

    fn ep_write(&mut self, endpoint_index: i32, data: &[u8]) -> ProxyResult<usize> {
        let mut io = UsbRawEpIo::new(endpoint_index as u16, data.len() as u32);
        io.data[..data.len()].copy_from_slice(data);
        unsafe { raw_gadget_abi::usb_raw_ioctl_ep_write(self.file.as_raw_fd(), &io) }
            .map_err(|e| ProxyError::GadgetIoctl("EP_WRITE", e))?;
        Ok(data.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records calls and replays a scripted sequence of events/reads, for
    /// `Ep0Controller`/`EndpointPump` lifecycle tests.
    #[derive(Default)]
    pub struct MockGadgetSide {
        pub calls: Mutex<Vec<String>>,
        pub events: VecDeque<GadgetEvent>,
        pub next_endpoint_index: i32,
    }

    impl GadgetSide for MockGadgetSide {
        fn fetch_event(&mut self) -> ProxyResult<GadgetEvent> {
            self.calls.lock().unwrap().push("fetch_event".to_string());
            Ok(self.events.pop_front().unwrap_or(GadgetEvent::Closed))
        }

        fn ep0_read(&mut self, _out_data: &mut [u8]) -> ProxyResult<usize> {
            self.calls.lock().unwrap().push("ep0_read".to_string());
            Ok(0)
        }

        fn ep0_write(&mut self, data: &[u8]) -> ProxyResult<usize> {
            self.calls.lock().unwrap().push(format!("ep0_write({} bytes)", data.len()));
            Ok(data.len())
        }

        fn ep0_stall(&mut self) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("ep0_stall".to_string());
            Ok(())
        }

        fn configure(&mut self) -> ProxyResult<()> {
            self.calls.lock().unwrap().push("configure".to_string());
            Ok(())
        }

        fn ep_enable(&mut self, _descriptor: &crate::topology::EndpointDescriptor) -> ProxyResult<i32> {
            self.next_endpoint_index += 1;
            self.calls.lock().unwrap().push(format!("ep_enable -> {}", self.next_endpoint_index));
            Ok(self.next_endpoint_index)
        }

        fn ep_disable(&mut self, endpoint_index: i32) -> ProxyResult<()> {
            self.calls.lock().unwrap().push(format!("ep_disable({endpoint_index})"));
            Ok(())
        }

        fn ep_read(&mut self, endpoint_index: i32, _out_data: &mut [u8]) -> ProxyResult<usize> {
            self.calls.lock().unwrap().push(format!("ep_read({endpoint_index})"));
            Ok(0)
        }

        fn ep_write(&mut self, endpoint_index: i32, data: &[u8]) -> ProxyResult<usize> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("ep_write({endpoint_index}, {} bytes)", data.len()));
            Ok(data.len())
        }
    }

    #[test]
    fn closed_event_signals_transport_shutdown() {
        let mut mock = MockGadgetSide {
            events: VecDeque::from([GadgetEvent::Closed]),
            ..Default::default()
        };
        assert!(matches!(mock.fetch_event().unwrap(), GadgetEvent::Closed));
    }

    #[test]
    fn ep_enable_assigns_increasing_indices() {
        let mut mock = MockGadgetSide::default();
        let ep = crate::topology::EndpointDescriptor {
            address: 0x81,
            attributes: 0x02,
            max_packet_size: 64,
        };
        assert_eq!(mock.ep_enable(&ep).unwrap(), 1);
        assert_eq!(mock.ep_enable(&ep).unwrap(), 2);
    }
}
