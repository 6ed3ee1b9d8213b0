//! [`ProxyRuntime`]: ties the enumerated device topology, the gadget/device
//! transports, the injection rule set, and the GPIO sampler together, then
//! runs the EP0 control loop until the gadget transport closes or shutdown
//! is requested.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::config::{InjectionRuleSet, RuntimeOptions};
use crate::device_side::DeviceSide;
use crate::ep0::Ep0Controller;
use crate::gadget_side::GadgetSide;
use crate::gpio::GpioSampler;
use crate::topology::DeviceTopology;

pub struct ProxyRuntime {
    controller: Ep0Controller,
    please_stop: Arc<AtomicBool>,
}

impl ProxyRuntime {
    pub fn new(
        gadget: Arc<Mutex<dyn GadgetSide>>,
        device: Arc<Mutex<dyn DeviceSide>>,
        rules: InjectionRuleSet,
        topology: DeviceTopology,
        gpio: GpioSampler,
        options: RuntimeOptions,
    ) -> Self {
        let rules = Arc::new(rules);
        let gpio = Arc::new(Mutex::new(gpio));
        Self {
            controller: Ep0Controller::new(gadget, device, rules, topology, gpio, options),
            please_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that, when set, asks [`ProxyRuntime::run`] to stop after its
    /// current event and tear down every running endpoint pump.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.please_stop)
    }

    /// Runs until the gadget transport reports closed or `stop_handle` is set.
    pub fn run(&mut self) {
        self.controller.run(&self.please_stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InjectionRuleSet;
    use crate::gadget_side::tests::MockGadgetSide;
    use crate::gadget_side::GadgetEvent;
    use crate::gpio::NullGpioReader;
    use crate::topology::{Altsetting, Config, EndpointDescriptor, Interface};
    use std::collections::VecDeque;

    struct NoopDevice;
    impl DeviceSide for NoopDevice {
        fn control(
            &mut self,
            _setup: &crate::injection::SetupPacket,
            _io_data: &mut [u8],
            _timeout_ms: u64,
        ) -> crate::error::ProxyResult<usize> {
            Ok(0)
        }
        fn send(&mut self, _address: u8, _attributes: u8, _data: &[u8]) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn receive(
            &mut self,
            _address: u8,
            _attributes: u8,
            _max_packet_size: u16,
            _out_data: &mut [u8],
            _timeout_ms: u64,
        ) -> crate::error::ProxyResult<usize> {
            Ok(0)
        }
        fn set_configuration(&mut self, _value: u8) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn set_interface_alt_setting(&mut self, _interface_number: u8, _alternate_setting: u8) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn claim_interface(&mut self, _interface_number: u8) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn release_interface(&mut self, _interface_number: u8) -> crate::error::ProxyResult<()> {
            Ok(())
        }
    }

    #[test]
    fn runtime_stops_when_gadget_transport_closes() {
        let gadget: Arc<Mutex<dyn GadgetSide>> = Arc::new(Mutex::new(MockGadgetSide {
            events: VecDeque::from([GadgetEvent::Closed]),
            ..Default::default()
        }));
        let device: Arc<Mutex<dyn DeviceSide>> = Arc::new(Mutex::new(NoopDevice));
        let rules = InjectionRuleSet::default();
        let topology = DeviceTopology::new(vec![Config {
            configuration_value: 1,
            interfaces: vec![Interface {
                interface_number: 0,
                altsettings: vec![Altsetting {
                    alternate_setting: 0,
                    endpoints: vec![EndpointDescriptor {
                        address: 0x81,
                        attributes: 0x02,
                        max_packet_size: 64,
                    }],
                }],
                current_altsetting_index: 0,
            }],
        }]);
        let gpio = GpioSampler::new(Box::new(NullGpioReader), &rules);
        let options = RuntimeOptions {
            config_path: "/dev/null".into(),
            injection_enabled: true,
            verbose_level: 0,
            gadget_path: "/dev/raw-gadget".into(),
            vendor_id: 0,
            product_id: 0,
        };

        let mut runtime = ProxyRuntime::new(gadget, device, rules, topology, gpio, options);
        runtime.run();
    }
}
