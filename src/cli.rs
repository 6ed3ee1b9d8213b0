//! Command-line surface: `clap`'s derive API, producing a [`RuntimeOptions`].

use std::path::PathBuf;

use clap::Parser;

use crate::config::RuntimeOptions;

#[derive(Parser, Debug)]
#[command(name = "usb-mitm-proxy", about = "USB man-in-the-middle proxy over usb_raw_gadget")]
pub struct Cli {
    /// Path to the injection rule set JSON file.
    #[arg(long)]
    pub config: PathBuf,

    /// Disable the injection engine; transfers pass through unmodified.
    #[arg(long)]
    pub no_injection: bool,

    /// Increase log/hexdump verbosity. Repeatable: `-v` enqueue-level logging, `-vv` full payload hexdumps.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the raw-gadget character device.
    #[arg(long, default_value = "/dev/raw-gadget")]
    pub gadget_path: PathBuf,

    /// Downstream device's idVendor, in hex (e.g. 1d6b).
    #[arg(long, value_parser = parse_hex_u16)]
    pub vendor_id: u16,

    /// Downstream device's idProduct, in hex (e.g. 0104).
    #[arg(long, value_parser = parse_hex_u16)]
    pub product_id: u16,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("invalid hex value {s:?}: {e}"))
}

impl Cli {
    pub fn into_runtime_options(self) -> RuntimeOptions {
        RuntimeOptions {
            config_path: self.config,
            injection_enabled: !self.no_injection,
            verbose_level: self.verbose.min(2),
            gadget_path: self.gadget_path,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }
}
