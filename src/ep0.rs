//! [`Ep0Controller`]: the single-threaded control-endpoint state machine.
//! Fetches gadget events, dispatches Set-Configuration/Set-Interface as
//! local reconfiguration, and proxies every other control transfer to the
//! device side with the injection engine applied on the data phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{Disposition, TransferBuffer, MAX_LENGTH};
use crate::config::{InjectionRuleSet, RuntimeOptions};
use crate::device_side::DeviceSide;
use crate::gadget_side::{GadgetEvent, GadgetSide};
use crate::gpio::GpioSampler;
use crate::injection::SetupPacket;
use crate::pump::{EndpointPump, LastMessageCache};
use crate::topology::DeviceTopology;

const CONTROL_TIMEOUT_MS: u64 = 1000;

const SET_CONFIGURATION_REQUEST_TYPE: u8 = 0x00;
const SET_CONFIGURATION_REQUEST: u8 = 0x09;
const SET_INTERFACE_REQUEST_TYPE: u8 = 0x01;
const SET_INTERFACE_REQUEST: u8 = 0x0b;

pub struct Ep0Controller {
    gadget: Arc<Mutex<dyn GadgetSide>>,
    device: Arc<Mutex<dyn DeviceSide>>,
    rules: Arc<InjectionRuleSet>,
    topology: DeviceTopology,
    gpio: Arc<Mutex<GpioSampler>>,
    last_messages: LastMessageCache,
    options: RuntimeOptions,
    pumps: Vec<EndpointPump>,
    set_configuration_done_once: bool,
}

impl Ep0Controller {
    pub fn new(
        gadget: Arc<Mutex<dyn GadgetSide>>,
        device: Arc<Mutex<dyn DeviceSide>>,
        rules: Arc<InjectionRuleSet>,
        topology: DeviceTopology,
        gpio: Arc<Mutex<GpioSampler>>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            gadget,
            device,
            rules,
            topology,
            gpio,
            last_messages: Arc::new(Mutex::new(std::collections::HashMap::new())),
            options,
            pumps: Vec::new(),
            set_configuration_done_once: false,
        }
    }

    fn log_topology(&self) {
        if self.options.verbose_level < 1 {
            return;
        }
        log::info!("enumerated topology:");
        for config in &self.topology.configs {
            log::info!("  config {}", config.configuration_value);
            for iface in &config.interfaces {
                log::info!("    interface {}", iface.interface_number);
                for alt in &iface.altsettings {
                    log::info!("      altsetting {}", alt.alternate_setting);
                    for ep in &alt.endpoints {
                        log::info!(
                            "        ep {:#04x} attrs={:#04x} max_packet_size={}",
                            ep.address,
                            ep.attributes,
                            ep.max_packet_size
                        );
                    }
                }
            }
        }
    }

    /// Runs the event loop until the gadget transport closes or `please_stop` is set.
    pub fn run(&mut self, please_stop: &Arc<AtomicBool>) {
        self.log_topology();

        while !please_stop.load(Ordering::SeqCst) {
            let event = match self.gadget.lock().unwrap().fetch_event() {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("ep0 fetch_event failed: {e}");
                    continue;
                }
            };

            match event {
                GadgetEvent::Closed => break,
                GadgetEvent::Other => continue,
                GadgetEvent::Control(setup) => self.handle_control(setup),
            }
        }

        self.teardown_current_config();
    }

    fn handle_control(&mut self, mut setup: SetupPacket) {
        if setup.w_length as usize > MAX_LENGTH {
            log::warn!(
                "ep0 control wLength {} exceeds buffer capacity, stalling",
                setup.w_length
            );
            let _ = self.gadget.lock().unwrap().ep0_stall();
            return;
        }
        let mut io = TransferBuffer::new(0, setup.w_length as usize);

        if setup.is_device_to_host() {
            let mut data = vec![0u8; setup.w_length as usize];
            let result = self
                .device
                .lock()
                .unwrap()
                .control(&setup, &mut data, CONTROL_TIMEOUT_MS);

            match result {
                Ok(n) => {
                    io.length = n;
                    io.data[..n].copy_from_slice(&data[..n]);

                    let flags = if self.options.injection_enabled {
                        crate::injection::inject_control(&self.rules.control, &mut setup, &mut io)
                    } else {
                        Disposition::None
                    };

                    match flags {
                        Disposition::None => {
                            if let Err(e) = self.gadget.lock().unwrap().ep0_write(io.as_slice()) {
                                log::warn!("ep0_write failed: {e}");
                            }
                        }
                        Disposition::Ignore => {}
                        Disposition::Stall => {
                            let _ = self.gadget.lock().unwrap().ep0_stall();
                        }
                    }
                }
                Err(e) => {
                    log::warn!("ep0 control (in) device-side failure: {e}");
                    let _ = self.gadget.lock().unwrap().ep0_stall();
                }
            }
            return;
        }

        if let Err(e) = self.gadget.lock().unwrap().ep0_read(io.as_mut_slice()) {
            log::warn!("ep0_read failed: {e}");
            return;
        }

        if setup.b_request_type == SET_CONFIGURATION_REQUEST_TYPE && setup.b_request == SET_CONFIGURATION_REQUEST {
            self.handle_set_configuration(setup.w_value as u8);
            return;
        }

        if setup.b_request_type == SET_INTERFACE_REQUEST_TYPE && setup.b_request == SET_INTERFACE_REQUEST {
            self.handle_set_interface(setup.w_index as u8, setup.w_value as u8);
            return;
        }

        let flags = if self.options.injection_enabled {
            crate::injection::inject_control(&self.rules.control, &mut setup, &mut io)
        } else {
            Disposition::None
        };

        match flags {
            Disposition::Ignore => return,
            Disposition::Stall => {
                let _ = self.gadget.lock().unwrap().ep0_stall();
                return;
            }
            Disposition::None => {}
        }

        let mut data = io.as_slice().to_vec();
        if let Err(e) = self.device.lock().unwrap().control(&setup, &mut data, CONTROL_TIMEOUT_MS) {
            log::warn!("ep0 control (out) device-side failure: {e}");
            let _ = self.gadget.lock().unwrap().ep0_stall();
        }
    }

    fn handle_set_configuration(&mut self, configuration_value: u8) {
        let Some(config_index) = self.topology.find_config_index(configuration_value) else {
            log::warn!("skip changing configuration, value {configuration_value} is invalid");
            return;
        };

        if self.set_configuration_done_once {
            self.teardown_current_config();
        }

        if let Err(e) = self.gadget.lock().unwrap().configure() {
            log::warn!("gadget configure() failed: {e}");
        }
        if let Err(e) = self.device.lock().unwrap().set_configuration(configuration_value) {
            log::warn!("device set_configuration({configuration_value}) failed: {e}");
        }
        self.topology.current_config_index = Some(config_index);

        let interface_numbers: Vec<u8> = self.topology.configs[config_index]
            .interfaces
            .iter()
            .map(|i| i.interface_number)
            .collect();
        for interface_number in interface_numbers {
            if let Err(e) = self.device.lock().unwrap().claim_interface(interface_number) {
                log::warn!("claim_interface({interface_number}) failed: {e}");
            }
        }
        for iface in &mut self.topology.configs[config_index].interfaces {
            iface.current_altsetting_index = 0;
        }
        self.start_pumps_for_current_altsettings();

        self.set_configuration_done_once = true;
    }

    fn handle_set_interface(&mut self, interface_number: u8, alternate_setting: u8) {
        let Some(config_index) = self.topology.current_config_index else {
            log::warn!("skip changing interface, no configuration is set");
            return;
        };
        let Some(iface_index) = self.topology.configs[config_index].find_interface_index(interface_number) else {
            log::warn!("skip changing interface, wIndex({interface_number}) is invalid");
            return;
        };
        let Some(alt_index) = self.topology.configs[config_index].interfaces[iface_index]
            .find_altsetting_index(alternate_setting)
        else {
            log::warn!("skip changing alt_setting, wValue({alternate_setting}) is invalid");
            return;
        };

        self.terminate_pumps_for_interface(config_index, iface_index);

        if let Err(e) = self
            .device
            .lock()
            .unwrap()
            .set_interface_alt_setting(interface_number, alternate_setting)
        {
            log::warn!("set_interface_alt_setting({interface_number}, {alternate_setting}) failed: {e}");
        }

        self.topology.configs[config_index].interfaces[iface_index].current_altsetting_index = alt_index;
        self.start_pumps_for_interface(config_index, iface_index);
    }

    fn start_pumps_for_current_altsettings(&mut self) {
        let Some(config_index) = self.topology.current_config_index else {
            return;
        };
        let iface_count = self.topology.configs[config_index].interfaces.len();
        for iface_index in 0..iface_count {
            self.start_pumps_for_interface(config_index, iface_index);
        }
    }

    fn start_pumps_for_interface(&mut self, config_index: usize, iface_index: usize) {
        let endpoints = self.topology.configs[config_index].interfaces[iface_index]
            .current_altsetting()
            .endpoints
            .clone();

        for ep in endpoints {
            match EndpointPump::start(
                ep,
                Arc::clone(&self.gadget),
                Arc::clone(&self.device),
                Arc::clone(&self.rules),
                self.options.injection_enabled,
                Arc::clone(&self.gpio),
                Arc::clone(&self.last_messages),
                self.options.verbose_level,
            ) {
                Ok(pump) => self.pumps.push(pump),
                Err(e) => log::warn!("failed to start pump for ep {:#04x}: {e}", ep.address),
            }
        }
    }

    fn terminate_pumps_for_interface(&mut self, config_index: usize, iface_index: usize) {
        let endpoint_addresses: Vec<u8> = self.topology.configs[config_index].interfaces[iface_index]
            .current_altsetting()
            .endpoints
            .iter()
            .map(|ep| ep.address)
            .collect();
        self.terminate_pumps_matching(&endpoint_addresses);
    }

    fn terminate_pumps_matching(&mut self, _addresses: &[u8]) {
        let pumps = std::mem::take(&mut self.pumps);
        for pump in pumps {
            pump.stop(&self.gadget);
        }
    }

    fn teardown_current_config(&mut self) {
        if self.topology.current_config_index.is_none() {
            return;
        }
        let pumps = std::mem::take(&mut self.pumps);
        for pump in pumps {
            pump.stop(&self.gadget);
        }

        if let Some(config_index) = self.topology.current_config_index {
            let interface_numbers: Vec<u8> = self.topology.configs[config_index]
                .interfaces
                .iter()
                .map(|i| i.interface_number)
                .collect();
            for interface_number in interface_numbers {
                if let Err(e) = self.device.lock().unwrap().release_interface(interface_number) {
                    log::warn!("release_interface({interface_number}) failed: {e}");
                }
            }
        }
    }
}
