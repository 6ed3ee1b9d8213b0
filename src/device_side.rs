//! The downstream side: the real USB device attached to this host's USB
//! controller, addressed through `libusb` via the `rusb` crate.

use std::time::Duration;

use rusb::UsbContext;

use crate::error::{ProxyError, ProxyResult};
use crate::injection::SetupPacket;
use crate::topology::{Altsetting, Config, DeviceTopology, EndpointDescriptor, Interface};

/// Everything the proxy needs from the real device: control transfers, bulk/
/// interrupt/isochronous data transfers, and configuration/interface
/// selection. Mocked in tests with an in-memory recorder.
pub trait DeviceSide: Send {
    /// Issues a control transfer. On a device-to-host transfer, fills and
    /// returns the received data; on host-to-device, sends `io_data` (only
    /// the first `setup.w_length` bytes are meaningful).
    fn control(&mut self, setup: &SetupPacket, io_data: &mut [u8], timeout_ms: u64) -> ProxyResult<usize>;

    /// Non-control OUT transfer; dispatches on `attributes`' transfer-type bits.
    fn send(&mut self, address: u8, attributes: u8, data: &[u8]) -> ProxyResult<()>;

    /// Non-control IN transfer. Returns `Ok(0)` on timeout rather than
    /// propagating it — matching the original's timeout-tolerant behavior.
    fn receive(
        &mut self,
        address: u8,
        attributes: u8,
        max_packet_size: u16,
        out_data: &mut [u8],
        timeout_ms: u64,
    ) -> ProxyResult<usize>;

    fn set_configuration(&mut self, value: u8) -> ProxyResult<()>;
    fn set_interface_alt_setting(&mut self, interface_number: u8, alternate_setting: u8) -> ProxyResult<()>;
    fn claim_interface(&mut self, interface_number: u8) -> ProxyResult<()>;
    fn release_interface(&mut self, interface_number: u8) -> ProxyResult<()>;
}

/// Production `DeviceSide` backed by `rusb`.
pub struct LibusbDeviceSide {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl LibusbDeviceSide {
    /// Opens the first device matching `vendor_id`/`product_id`.
    pub fn open(vendor_id: u16, product_id: u16) -> ProxyResult<Self> {
        let context = rusb::Context::new().map_err(ProxyError::DeviceOpen)?;
        let handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(rusb::Error::NoDevice)
            .map_err(ProxyError::DeviceOpen)?;
        Ok(Self { handle })
    }

    /// Enumerates the device's active configuration into a [`DeviceTopology`],
    /// performed once at startup outside the per-transfer hot path.
    pub fn enumerate_topology(&self) -> ProxyResult<DeviceTopology> {
        let device = self.handle.device();
        let descriptor = device.device_descriptor().map_err(ProxyError::DeviceOpen)?;
        let mut configs = Vec::with_capacity(descriptor.num_configurations() as usize);

        for config_index in 0..descriptor.num_configurations() {
            let config_desc = device
                .config_descriptor(config_index)
                .map_err(ProxyError::DeviceOpen)?;
            let mut interfaces = Vec::with_capacity(config_desc.num_interfaces() as usize);

            for interface in config_desc.interfaces() {
                let mut altsettings = Vec::new();
                for descriptor in interface.descriptors() {
                    let endpoints = descriptor
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            address: ep.address(),
                            attributes: encode_attributes(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect();
                    altsettings.push(Altsetting {
                        alternate_setting: descriptor.setting_number(),
                        endpoints,
                    });
                }
                interfaces.push(Interface {
                    interface_number: interface.number(),
                    altsettings,
                    current_altsetting_index: 0,
                });
            }

            configs.push(Config {
                configuration_value: config_desc.number(),
                interfaces,
            });
        }

        Ok(DeviceTopology::new(configs))
    }
}

fn encode_attributes(transfer_type: rusb::TransferType) -> u8 {
    match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

fn request_type_to_direction(b_request_type: u8) -> rusb::Direction {
    if b_request_type & 0x80 != 0 {
        rusb::Direction::In
    } else {
        rusb::Direction::Out
    }
}

fn request_type_to_recipient(b_request_type: u8) -> rusb::Recipient {
    match b_request_type & 0x1f {
        0 => rusb::Recipient::Device,
        1 => rusb::Recipient::Interface,
        2 => rusb::Recipient::Endpoint,
        _ => rusb::Recipient::Other,
    }
}

fn request_type_to_kind(b_request_type: u8) -> rusb::RequestType {
    match (b_request_type >> 5) & 0x3 {
        0 => rusb::RequestType::Standard,
        1 => rusb::RequestType::Class,
        2 => rusb::RequestType::Vendor,
        _ => rusb::RequestType::Reserved,
    }
}

impl DeviceSide for LibusbDeviceSide {
    fn control(&mut self, setup: &SetupPacket, io_data: &mut [u8], timeout_ms: u64) -> ProxyResult<usize> {
        let timeout = Duration::from_millis(timeout_ms);
        let request_type = rusb::request_type(
            request_type_to_direction(setup.b_request_type),
            request_type_to_kind(setup.b_request_type),
            request_type_to_recipient(setup.b_request_type),
        );

        if setup.is_device_to_host() {
            let n = self.handle.read_control(
                request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                io_data,
                timeout,
            )?;
            Ok(n)
        } else {
            let n = self.handle.write_control(
                request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                &io_data[..setup.w_length as usize],
                timeout,
            )?;
            Ok(n)
        }
    }

    fn send(&mut self, address: u8, attributes: u8, data: &[u8]) -> ProxyResult<()> {
        let timeout = Duration::from_millis(1000);
        match crate::topology::TransferClass::from_attributes(attributes) {
            crate::topology::TransferClass::Bulk | crate::topology::TransferClass::Isochronous => {
                self.handle.write_bulk(address, data, timeout)?;
            }
            crate::topology::TransferClass::Interrupt => {
                self.handle.write_interrupt(address, data, timeout)?;
            }
            crate::topology::TransferClass::Control => unreachable!("control transfers use control()"),
        }
        Ok(())
    }

    fn receive(
        &mut self,
        address: u8,
        attributes: u8,
        _max_packet_size: u16,
        out_data: &mut [u8],
        timeout_ms: u64,
    ) -> ProxyResult<usize> {
        let timeout = Duration::from_millis(timeout_ms);
        let result = match crate::topology::TransferClass::from_attributes(attributes) {
            crate::topology::TransferClass::Bulk | crate::topology::TransferClass::Isochronous => {
                self.handle.read_bulk(address, out_data, timeout)
            }
            crate::topology::TransferClass::Interrupt => self.handle.read_interrupt(address, out_data, timeout),
            crate::topology::TransferClass::Control => unreachable!("control transfers use control()"),
        };

        match result {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(ProxyError::from(e)),
        }
    }

    fn set_configuration(&mut self, value: u8) -> ProxyResult<()> {
        self.handle.set_active_configuration(value)?;
        Ok(())
    }

    fn set_interface_alt_setting(&mut self, interface_number: u8, alternate_setting: u8) -> ProxyResult<()> {
        self.handle
            .set_alternate_setting(interface_number, alternate_setting)?;
        Ok(())
    }

    fn claim_interface(&mut self, interface_number: u8) -> ProxyResult<()> {
        self.handle.claim_interface(interface_number)?;
        Ok(())
    }

    fn release_interface(&mut self, interface_number: u8) -> ProxyResult<()> {
        self.handle.release_interface(interface_number)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call it receives; used to assert `Ep0Controller`/
    /// `EndpointPump` lifecycle behavior without real hardware.
    #[derive(Default)]
    pub struct RecordingDeviceSide {
        pub calls: Mutex<Vec<String>>,
    }

    impl DeviceSide for RecordingDeviceSide {
        fn control(&mut self, setup: &SetupPacket, _io_data: &mut [u8], _timeout_ms: u64) -> ProxyResult<usize> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("control({:#04x})", setup.b_request));
            Ok(0)
        }

        fn send(&mut self, address: u8, _attributes: u8, data: &[u8]) -> ProxyResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("send({address:#04x}, {} bytes)", data.len()));
            Ok(())
        }

        fn receive(
            &mut self,
            address: u8,
            _attributes: u8,
            _max_packet_size: u16,
            _out_data: &mut [u8],
            _timeout_ms: u64,
        ) -> ProxyResult<usize> {
            self.calls.lock().unwrap().push(format!("receive({address:#04x})"));
            Ok(0)
        }

        fn set_configuration(&mut self, value: u8) -> ProxyResult<()> {
            self.calls.lock().unwrap().push(format!("set_configuration({value})"));
            Ok(())
        }

        fn set_interface_alt_setting(&mut self, interface_number: u8, alternate_setting: u8) -> ProxyResult<()> {
            self.calls.lock().unwrap().push(format!(
                "set_interface_alt_setting({interface_number}, {alternate_setting})"
            ));
            Ok(())
        }

        fn claim_interface(&mut self, interface_number: u8) -> ProxyResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("claim_interface({interface_number})"));
            Ok(())
        }

        fn release_interface(&mut self, interface_number: u8) -> ProxyResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("release_interface({interface_number})"));
            Ok(())
        }
    }

    #[test]
    fn recording_device_side_tracks_calls_in_order() {
        let mut device = RecordingDeviceSide::default();
        device.set_configuration(1).unwrap();
        device.claim_interface(0).unwrap();
        device.send(0x01, 0x02, &[1, 2, 3]).unwrap();
        let calls = device.calls.into_inner().unwrap();
        assert_eq!(
            calls,
            vec![
                "set_configuration(1)".to_string(),
                "claim_interface(0)".to_string(),
                "send(0x01, 3 bytes)".to_string(),
            ]
        );
    }
}
