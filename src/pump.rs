//! [`EndpointPump`]: the reader/writer thread pair that moves payloads for
//! one non-EP0 endpoint between the device side and the gadget side, through
//! a bounded queue, with the injection engine and GPIO replay applied on the
//! read side.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::TransferBuffer;
use crate::config::InjectionRuleSet;
use crate::device_side::DeviceSide;
use crate::gadget_side::GadgetSide;
use crate::gpio::GpioSampler;
use crate::topology::EndpointDescriptor;

const QUEUE_CAPACITY: usize = 32;
const POLL_INTERVAL: Duration = Duration::from_micros(100);
const RECEIVE_TIMEOUT_MS: u64 = 20;

/// The most recently observed buffer per endpoint address, for GPIO replay.
pub type LastMessageCache = Arc<Mutex<HashMap<u8, TransferBuffer>>>;

struct Queue {
    buffers: Mutex<VecDeque<TransferBuffer>>,
}

impl Queue {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(VecDeque::new()),
        }
    }

    fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    fn push(&self, buf: TransferBuffer) {
        self.buffers.lock().unwrap().push_back(buf);
    }

    fn pop(&self) -> Option<TransferBuffer> {
        self.buffers.lock().unwrap().pop_front()
    }
}

/// A running endpoint pump: owns its queue and the join handles of its two
/// worker threads, plus the stop flag they poll.
pub struct EndpointPump {
    endpoint_index: i32,
    please_stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl EndpointPump {
    /// Enables `ep` on the gadget side and starts the reader/writer threads.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        ep: EndpointDescriptor,
        gadget: Arc<Mutex<dyn GadgetSide>>,
        device: Arc<Mutex<dyn DeviceSide>>,
        rules: Arc<InjectionRuleSet>,
        injection_enabled: bool,
        gpio: Arc<Mutex<GpioSampler>>,
        last_messages: LastMessageCache,
        verbose_level: u8,
    ) -> crate::error::ProxyResult<Self> {
        let endpoint_index = gadget.lock().unwrap().ep_enable(&ep)?;
        let please_stop = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Queue::new());

        let reader = {
            let queue = Arc::clone(&queue);
            let gadget = Arc::clone(&gadget);
            let device = Arc::clone(&device);
            let rules = Arc::clone(&rules);
            let gpio = Arc::clone(&gpio);
            let last_messages = Arc::clone(&last_messages);
            let please_stop = Arc::clone(&please_stop);
            std::thread::spawn(move || {
                reader_loop(
                    ep,
                    endpoint_index,
                    &gadget,
                    &device,
                    &rules,
                    injection_enabled,
                    &gpio,
                    &last_messages,
                    &queue,
                    &please_stop,
                    verbose_level,
                )
            })
        };

        let writer = {
            let queue = Arc::clone(&queue);
            let please_stop = Arc::clone(&please_stop);
            std::thread::spawn(move || {
                writer_loop(ep, endpoint_index, &gadget, &device, &queue, &please_stop, verbose_level)
            })
        };

        Ok(Self {
            endpoint_index,
            please_stop,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Signals both threads to stop, joins them, and disables the endpoint.
    pub fn stop(mut self, gadget: &Arc<Mutex<dyn GadgetSide>>) {
        self.please_stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::warn!("endpoint pump reader thread panicked during shutdown");
            }
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::warn!("endpoint pump writer thread panicked during shutdown");
            }
        }
        if let Err(e) = gadget.lock().unwrap().ep_disable(self.endpoint_index) {
            log::warn!("ep_disable({}) failed: {e}", self.endpoint_index);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reader_loop(
    ep: EndpointDescriptor,
    endpoint_index: i32,
    gadget: &Arc<Mutex<dyn GadgetSide>>,
    device: &Arc<Mutex<dyn DeviceSide>>,
    rules: &Arc<InjectionRuleSet>,
    injection_enabled: bool,
    gpio: &Arc<Mutex<GpioSampler>>,
    last_messages: &LastMessageCache,
    queue: &Arc<Queue>,
    please_stop: &Arc<AtomicBool>,
    verbose_level: u8,
) {
    let class = ep.transfer_class();
    while !please_stop.load(Ordering::SeqCst) {
        if ep.is_in() {
            if queue.len() >= QUEUE_CAPACITY {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let mut data = [0u8; crate::buffer::MAX_LENGTH];
            let n = match device
                .lock()
                .unwrap()
                .receive(ep.address, ep.attributes, ep.max_packet_size, &mut data, RECEIVE_TIMEOUT_MS)
            {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("ep {:#04x} receive failed: {e}", ep.address);
                    0
                }
            };

            if n > 0 {
                let mut io = TransferBuffer::from_slice(endpoint_index, &data[..n]);
                if injection_enabled {
                    crate::injection::inject_data_ep(
                        rules.rules_for(class),
                        &ep,
                        class,
                        &mut io,
                        &mut gpio.lock().unwrap(),
                    );
                }
                if verbose_level >= 2 {
                    log::trace!("ep {:#04x} IN payload: {}", ep.address, hex::encode(io.as_slice()));
                } else if verbose_level >= 1 {
                    log::debug!("ep {:#04x} IN: enqueued {} bytes", ep.address, io.length);
                }
                last_messages.lock().unwrap().insert(ep.address, io.clone());
                queue.push(io);
            }

            let replay = gpio.lock().unwrap().any_used_active();
            if replay {
                let cached = last_messages.lock().unwrap().get(&ep.address).cloned();
                if let Some(mut io) = cached {
                    if injection_enabled {
                        crate::injection::inject_data_ep(
                            rules.rules_for(class),
                            &ep,
                            class,
                            &mut io,
                            &mut gpio.lock().unwrap(),
                        );
                    }
                    queue.push(io);
                }
            }
        } else {
            let mut data = [0u8; crate::buffer::MAX_LENGTH];
            let n = match gadget.lock().unwrap().ep_read(endpoint_index, &mut data) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("ep {:#04x} gadget read failed: {e}", ep.address);
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };

            let mut io = TransferBuffer::from_slice(endpoint_index, &data[..n]);
            if injection_enabled {
                crate::injection::inject_data_ep(
                    rules.rules_for(class),
                    &ep,
                    class,
                    &mut io,
                    &mut gpio.lock().unwrap(),
                );
            }
            if verbose_level >= 2 {
                log::trace!("ep {:#04x} OUT payload: {}", ep.address, hex::encode(io.as_slice()));
            } else if verbose_level >= 1 {
                log::debug!("ep {:#04x} OUT: enqueued {} bytes", ep.address, io.length);
            }
            last_messages.lock().unwrap().insert(ep.address, io.clone());
            queue.push(io);
        }
    }
}

fn writer_loop(
    ep: EndpointDescriptor,
    endpoint_index: i32,
    gadget: &Arc<Mutex<dyn GadgetSide>>,
    device: &Arc<Mutex<dyn DeviceSide>>,
    queue: &Arc<Queue>,
    please_stop: &Arc<AtomicBool>,
    verbose_level: u8,
) {
    while !please_stop.load(Ordering::SeqCst) {
        let Some(io) = queue.pop() else {
            std::thread::sleep(POLL_INTERVAL);
            continue;
        };

        let result = if ep.is_in() {
            gadget.lock().unwrap().ep_write(endpoint_index, io.as_slice()).map(|_| ())
        } else {
            device.lock().unwrap().send(ep.address, ep.attributes, io.as_slice())
        };

        match result {
            Ok(()) => {
                if verbose_level >= 1 {
                    log::debug!("ep {:#04x}: wrote {} bytes", ep.address, io.length);
                }
            }
            Err(e) => log::warn!("ep {:#04x} write failed: {e}", ep.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InjectionRuleSet;
    use crate::device_side::DeviceSide;
    use crate::gadget_side::{GadgetEvent, GadgetSide};
    use crate::gpio::{GpioSampler, NullGpioReader};
    use crate::injection::SetupPacket;
    use std::sync::atomic::AtomicUsize;

    struct EchoDevice {
        receive_calls: AtomicUsize,
    }

    impl DeviceSide for EchoDevice {
        fn control(&mut self, _setup: &SetupPacket, _io_data: &mut [u8], _timeout_ms: u64) -> crate::error::ProxyResult<usize> {
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
            out_data: &mut [u8],
            _timeout_ms: u64,
        ) -> crate::error::ProxyResult<usize> {
            let call = self.receive_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                out_data[0] = 0x41;
                Ok(1)
            } else {
                Ok(0)
            }
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

    #[derive(Default)]
    struct RecordingGadget {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        next_index: i32,
    }

    impl GadgetSide for RecordingGadget {
        fn fetch_event(&mut self) -> crate::error::ProxyResult<GadgetEvent> {
            Ok(GadgetEvent::Closed)
        }
        fn ep0_read(&mut self, _out_data: &mut [u8]) -> crate::error::ProxyResult<usize> {
            Ok(0)
        }
        fn ep0_write(&mut self, data: &[u8]) -> crate::error::ProxyResult<usize> {
            Ok(data.len())
        }
        fn ep0_stall(&mut self) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn configure(&mut self) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn ep_enable(&mut self, _descriptor: &EndpointDescriptor) -> crate::error::ProxyResult<i32> {
            self.next_index += 1;
            Ok(self.next_index)
        }
        fn ep_disable(&mut self, _endpoint_index: i32) -> crate::error::ProxyResult<()> {
            Ok(())
        }
        fn ep_read(&mut self, _endpoint_index: i32, _out_data: &mut [u8]) -> crate::error::ProxyResult<usize> {
            Ok(0)
        }
        fn ep_write(&mut self, _endpoint_index: i32, data: &[u8]) -> crate::error::ProxyResult<usize> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }
    }

    #[test]
    fn pump_moves_one_in_packet_from_device_to_gadget() {
        let ep = EndpointDescriptor {
            address: 0x81,
            attributes: 0x02,
            max_packet_size: 64,
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let gadget: Arc<Mutex<dyn GadgetSide>> = Arc::new(Mutex::new(RecordingGadget {
            written: Arc::clone(&written),
            next_index: 0,
        }));
        let device: Arc<Mutex<dyn DeviceSide>> = Arc::new(Mutex::new(EchoDevice {
            receive_calls: AtomicUsize::new(0),
        }));
        let rules = Arc::new(InjectionRuleSet::default());
        let gpio = Arc::new(Mutex::new(GpioSampler::new(Box::new(NullGpioReader), &rules)));
        let last_messages: LastMessageCache = Arc::new(Mutex::new(HashMap::new()));

        let pump = EndpointPump::start(ep, Arc::clone(&gadget), device, rules, true, gpio, last_messages, 0).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        pump.stop(&gadget);

        let written = written.lock().unwrap();
        assert!(written.iter().any(|bytes| bytes == &[0x41]));
    }
}
