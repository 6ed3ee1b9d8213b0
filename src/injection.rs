//! Pattern-match and rewrite engine for in-flight transfer payloads.
//!
//! Stateless: every operation takes the rule set and buffer it needs and
//! returns a disposition or a modified-flag. The only state that lives
//! across calls is the caller's [`crate::buffer::TransferBuffer`] itself.

use crate::buffer::{Disposition, TransferBuffer, MAX_LENGTH};
use crate::config::{ByteReplacementType, ControlMatchRule, ControlRules, EpRule, RuleKind};
use crate::gpio::GpioSampler;
use crate::topology::{EndpointDescriptor, TransferClass};

/// A control transfer's setup-packet fields, mirrored from the USB spec.
#[derive(Clone, Copy, Debug)]
pub struct SetupPacket {
    pub b_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        self.b_request_type & 0x80 != 0
    }
}

/// Scans `data[..]` for every occurrence of each pattern in turn, splicing in
/// `replacement` as long as the result would stay strictly below
/// [`MAX_LENGTH`]. Returns the rewritten bytes and whether anything changed.
fn inject_data(data: &[u8], patterns: &[Vec<u8>], replacement: &[u8]) -> (Vec<u8>, bool) {
    let mut buf = data.to_vec();
    let mut modified = false;

    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }
        while let Some(pos) = find_subslice(&buf, pattern) {
            let new_len = buf.len() - pattern.len() + replacement.len();
            if new_len > MAX_LENGTH - 1 {
                break;
            }
            buf.splice(pos..pos + pattern.len(), replacement.iter().copied());
            modified = true;
            log::debug!(
                "injection: modified {} bytes at offset {pos}",
                pattern.len()
            );
        }
    }

    (buf, modified)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Applies `inject_data` to a [`TransferBuffer`] in place, returning whether
/// anything was modified.
fn inject_data_buffer(io: &mut TransferBuffer, patterns: &[Vec<u8>], replacement: &[u8]) -> bool {
    let (rewritten, modified) = inject_data(io.as_slice(), patterns, replacement);
    if modified {
        io.length = rewritten.len();
        io.data[..io.length].copy_from_slice(&rewritten);
    }
    modified
}

fn matcher_matches(m: &ControlMatchRule, setup: &SetupPacket) -> bool {
    m.matches(
        setup.b_request_type,
        setup.b_request,
        setup.w_value,
        setup.w_index,
        setup.w_length,
    )
}

/// Runs the `modify → ignore → stall` control rule categories in order
/// against `setup`/`io`, mutating `io` in place for `modify` matches and
/// updating `setup.w_length` on an OUT-direction modify. Returns the final
/// disposition — the last category to match wins.
pub fn inject_control(
    rules: &ControlRules,
    setup: &mut SetupPacket,
    io: &mut TransferBuffer,
) -> Disposition {
    let mut flags = Disposition::None;

    for rule in &rules.modify {
        if !rule.matcher.enable || !matcher_matches(&rule.matcher, setup) {
            continue;
        }
        log::debug!("injection: matched control modify rule");
        let modified = inject_data_buffer(io, &rule.content_pattern, &rule.replacement);
        if modified && !setup.is_device_to_host() {
            setup.w_length = io.length as u16;
        }
    }

    for rule in &rules.ignore {
        if !rule.enable || !matcher_matches(rule, setup) {
            continue;
        }
        log::debug!("injection: matched control ignore rule");
        flags = Disposition::Ignore;
    }

    for rule in &rules.stall {
        if !rule.enable || !matcher_matches(rule, setup) {
            continue;
        }
        log::debug!("injection: matched control stall rule");
        flags = Disposition::Stall;
    }

    flags
}

/// Applies the `int`/`bulk`/`isoc` rule list for `class` against `io`,
/// conditioned on `ep.address` and (for `RaspberryPiGpio` rules) `gpio`.
pub fn inject_data_ep(
    rules: &[EpRule],
    ep: &EndpointDescriptor,
    _class: TransferClass,
    io: &mut TransferBuffer,
    gpio: &mut GpioSampler,
) {
    for rule in rules {
        if !rule.enable || rule.ep_address != ep.address {
            continue;
        }

        match &rule.kind {
            RuleKind::Default {
                content_pattern,
                replacement,
            } => {
                let modified = inject_data_buffer(io, content_pattern, replacement);
                if modified {
                    break;
                }
            }
            RuleKind::RaspberryPiGpio {
                gpio_on,
                gpio_off,
                byte_replacement_type,
                byte_replacements,
            } => {
                if !gpio.all_active(gpio_on) || !gpio.all_inactive(gpio_off) {
                    continue;
                }
                for replacement in byte_replacements {
                    if replacement.index >= io.length {
                        continue;
                    }
                    let slot = &mut io.data[replacement.index];
                    *slot = match byte_replacement_type {
                        ByteReplacementType::Replace => replacement.value,
                        ByteReplacementType::BitwiseOr => *slot | replacement.value,
                    };
                    log::debug!(
                        "injection: gpio rule rewrote byte {} on ep {:#04x}",
                        replacement.index,
                        ep.address
                    );
                }
            }
        }
    }
}
