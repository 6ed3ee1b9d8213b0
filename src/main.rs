use std::sync::{Arc, Mutex};

use clap::Parser;

use usb_mitm_proxy::cli::Cli;
use usb_mitm_proxy::config::InjectionRuleSet;
use usb_mitm_proxy::device_side::{DeviceSide, LibusbDeviceSide};
use usb_mitm_proxy::gadget_side::{GadgetSide, RawGadget};
use usb_mitm_proxy::gpio::{GpioReader, GpioSampler, NullGpioReader, RppalGpioReader};
use usb_mitm_proxy::runtime::ProxyRuntime;

const DRIVER_NAME: &str = "dummy_udc";
const DEVICE_NAME: &str = "dummy_udc.0";

fn run() -> anyhow::Result<()> {
    let options = Cli::parse().into_runtime_options();

    let level = match options.verbose_level {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let rules = InjectionRuleSet::load(&options.config_path)?;

    let device = LibusbDeviceSide::open(options.vendor_id, options.product_id)?;
    let topology = device.enumerate_topology()?;
    let device: Arc<Mutex<dyn DeviceSide>> = Arc::new(Mutex::new(device));

    let gadget = RawGadget::open(&options.gadget_path, DRIVER_NAME, DEVICE_NAME)?;
    let gadget: Arc<Mutex<dyn GadgetSide>> = Arc::new(Mutex::new(gadget));

    let gpio_reader: Box<dyn GpioReader> = RppalGpioReader::open()
        .map(|r| Box::new(r) as Box<dyn GpioReader>)
        .unwrap_or_else(|e| {
            log::warn!("gpio unavailable, RaspberryPiGpio rules will never fire: {e}");
            Box::new(NullGpioReader)
        });
    let gpio = GpioSampler::new(gpio_reader, &rules);

    let mut runtime = ProxyRuntime::new(gadget, device, rules, topology, gpio, options);
    runtime.run();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
