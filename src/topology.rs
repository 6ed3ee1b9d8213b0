//! The device topology mirrored from the downstream device's descriptors:
//! configs, each holding interfaces, each holding altsettings, each holding
//! endpoints. Addressed throughout by small integer indices rather than
//! pointers, so reconfiguration is just index bookkeeping plus pump
//! lifecycle events (see [`crate::ep0::Ep0Controller`]).

/// Transfer type encoded in bits 0-1 of `bmAttributes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferClass {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferClass {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0 => TransferClass::Control,
            1 => TransferClass::Isochronous,
            2 => TransferClass::Bulk,
            3 => TransferClass::Interrupt,
            _ => unreachable!("attributes & 0b11 is in 0..=3"),
        }
    }

    /// The JSON key this class is addressed by in the injection rule set.
    pub fn config_key(self) -> &'static str {
        match self {
            TransferClass::Control => "control",
            TransferClass::Isochronous => "isoc",
            TransferClass::Bulk => "bulk",
            TransferClass::Interrupt => "int",
        }
    }
}

/// Mirrors `bEndpointAddress`/`bmAttributes`/`wMaxPacketSize` from the USB spec.
#[derive(Clone, Copy, Debug)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn transfer_class(&self) -> TransferClass {
        TransferClass::from_attributes(self.attributes)
    }
}

/// A single alternate setting within an interface: its own endpoint set.
#[derive(Clone, Debug)]
pub struct Altsetting {
    pub alternate_setting: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// A USB interface: a number plus its ordered altsettings.
#[derive(Clone, Debug)]
pub struct Interface {
    pub interface_number: u8,
    pub altsettings: Vec<Altsetting>,
    /// Index into `altsettings` of the currently selected altsetting.
    pub current_altsetting_index: usize,
}

impl Interface {
    pub fn current_altsetting(&self) -> &Altsetting {
        &self.altsettings[self.current_altsetting_index]
    }

    pub fn find_altsetting_index(&self, alternate_setting: u8) -> Option<usize> {
        self.altsettings
            .iter()
            .position(|a| a.alternate_setting == alternate_setting)
    }
}

/// A USB configuration: a `bConfigurationValue` plus its ordered interfaces.
#[derive(Clone, Debug)]
pub struct Config {
    pub configuration_value: u8,
    pub interfaces: Vec<Interface>,
}

impl Config {
    pub fn find_interface_index(&self, interface_number: u8) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|i| i.interface_number == interface_number)
    }
}

/// The full device topology, as enumerated once at startup, plus the
/// currently-selected configuration.
#[derive(Clone, Debug)]
pub struct DeviceTopology {
    pub configs: Vec<Config>,
    /// Index into `configs`, or `None` before the first Set-Configuration.
    pub current_config_index: Option<usize>,
}

impl DeviceTopology {
    pub fn new(configs: Vec<Config>) -> Self {
        Self {
            configs,
            current_config_index: None,
        }
    }

    pub fn find_config_index(&self, configuration_value: u8) -> Option<usize> {
        self.configs
            .iter()
            .position(|c| c.configuration_value == configuration_value)
    }

    pub fn current_config(&self) -> Option<&Config> {
        self.current_config_index.map(|i| &self.configs[i])
    }

    pub fn current_config_mut(&mut self) -> Option<&mut Config> {
        match self.current_config_index {
            Some(i) => Some(&mut self.configs[i]),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8, attributes: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            attributes,
            max_packet_size: 64,
        }
    }

    #[test]
    fn transfer_class_from_attributes() {
        assert_eq!(TransferClass::from_attributes(0x02), TransferClass::Bulk);
        assert_eq!(TransferClass::from_attributes(0x03), TransferClass::Interrupt);
        assert_eq!(ep(0x81, 0x02).transfer_class(), TransferClass::Bulk);
        assert!(ep(0x81, 0x02).is_in());
        assert!(!ep(0x01, 0x02).is_in());
    }

    #[test]
    fn find_config_and_interface_by_value() {
        let topo = DeviceTopology::new(vec![Config {
            configuration_value: 1,
            interfaces: vec![Interface {
                interface_number: 0,
                altsettings: vec![Altsetting {
                    alternate_setting: 0,
                    endpoints: vec![ep(0x81, 0x02)],
                }],
                current_altsetting_index: 0,
            }],
        }]);

        assert_eq!(topo.find_config_index(1), Some(0));
        assert_eq!(topo.find_config_index(2), None);
        let iface_idx = topo.configs[0].find_interface_index(0).unwrap();
        assert_eq!(iface_idx, 0);
    }
}
