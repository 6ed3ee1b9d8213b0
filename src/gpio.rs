//! GPIO conditions for `RaspberryPiGpio` injection rules.
//!
//! A pin reads *active* at logic LOW (external pull-ups). [`GpioSampler`] is
//! built over the [`GpioReader`] trait so tests and non-Pi hosts can supply a
//! fake reader instead of touching `/dev/gpiomem`.

use std::collections::{BTreeSet, HashMap};

use crate::config::{InjectionRuleSet, RuleKind};

/// Abstraction over a single GPIO input pin.
pub trait GpioReader: Send {
    /// Reads the current level of `pin`. `true` means logic LOW ("active").
    fn read(&mut self, pin: u8) -> bool;

    /// Configures `pin` as an input with its pull-up enabled.
    fn set_input_pullup(&mut self, pin: u8);
}

/// A `GpioReader` that reports every pin inactive. Used when `/dev/gpiomem`
/// could not be opened, so GPIO-conditioned rules simply never fire.
pub struct NullGpioReader;

impl GpioReader for NullGpioReader {
    fn read(&mut self, _pin: u8) -> bool {
        false
    }

    fn set_input_pullup(&mut self, _pin: u8) {}
}

/// Production `GpioReader` backed by `rppal::gpio`.
pub struct RppalGpioReader {
    gpio: rppal::gpio::Gpio,
    pins: HashMap<u8, rppal::gpio::InputPin>,
}

impl RppalGpioReader {
    /// Opens `/dev/gpiomem`. Returns `Err` if GPIO hardware is unavailable;
    /// the caller falls back to [`NullGpioReader`] in that case.
    pub fn open() -> Result<Self, rppal::gpio::Error> {
        Ok(Self {
            gpio: rppal::gpio::Gpio::new()?,
            pins: HashMap::new(),
        })
    }
}

impl GpioReader for RppalGpioReader {
    fn read(&mut self, pin: u8) -> bool {
        self.pins.get(&pin).map(|p| p.is_low()).unwrap_or(false)
    }

    fn set_input_pullup(&mut self, pin: u8) {
        if let Ok(p) = self.gpio.get(pin) {
            self.pins.insert(pin, p.into_input_pullup());
        } else {
            log::warn!("gpio: failed to claim pin {pin} for input-pullup");
        }
    }
}

/// Scans the `int`-class rule list for `RaspberryPiGpio` rules, collects
/// every referenced pin, and answers the condition queries the injection
/// engine needs.
pub struct GpioSampler {
    reader: Box<dyn GpioReader>,
    used_pins: BTreeSet<u8>,
}

impl GpioSampler {
    /// Builds a sampler over `reader`, initializing every pin referenced by
    /// an `int`-class `RaspberryPiGpio` rule in `rules` as an input with
    /// pull-up enabled.
    pub fn new(reader: Box<dyn GpioReader>, rules: &InjectionRuleSet) -> Self {
        let mut used_pins = BTreeSet::new();
        for rule in &rules.int {
            if let RuleKind::RaspberryPiGpio {
                gpio_on, gpio_off, ..
            } = &rule.kind
            {
                used_pins.extend(gpio_on.iter().copied());
                used_pins.extend(gpio_off.iter().copied());
            }
        }

        let mut sampler = Self { reader, used_pins };
        let pins: Vec<u8> = sampler.used_pins.iter().copied().collect();
        for pin in pins {
            sampler.reader.set_input_pullup(pin);
        }
        sampler
    }

    /// `true` iff at least one used pin currently reads LOW.
    pub fn any_used_active(&mut self) -> bool {
        let pins: Vec<u8> = self.used_pins.iter().copied().collect();
        pins.into_iter().any(|pin| self.reader.read(pin))
    }

    /// `true` iff every pin in `pins` reads LOW (or `pins` is empty).
    pub fn all_active(&mut self, pins: &[u8]) -> bool {
        pins.iter().all(|&pin| self.reader.read(pin))
    }

    /// `true` iff every pin in `pins` reads HIGH (or `pins` is empty).
    pub fn all_inactive(&mut self, pins: &[u8]) -> bool {
        pins.iter().all(|&pin| !self.reader.read(pin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeGpio {
        levels: HashMap<u8, bool>,
    }

    impl GpioReader for FakeGpio {
        fn read(&mut self, pin: u8) -> bool {
            *self.levels.get(&pin).unwrap_or(&false)
        }

        fn set_input_pullup(&mut self, _pin: u8) {}
    }

    fn rule_set_with_pins(on: Vec<u8>, off: Vec<u8>) -> InjectionRuleSet {
        use crate::config::{ByteReplacementType, EpRule};

        InjectionRuleSet {
            int: vec![EpRule {
                enable: true,
                ep_address: 0x83,
                kind: RuleKind::RaspberryPiGpio {
                    gpio_on: on,
                    gpio_off: off,
                    byte_replacement_type: ByteReplacementType::BitwiseOr,
                    byte_replacements: vec![],
                },
            }],
            ..Default::default()
        }
    }

    #[test]
    fn all_active_and_all_inactive_conditions() {
        let mut levels = HashMap::new();
        levels.insert(17u8, true);
        levels.insert(27u8, false);
        let reader = FakeGpio { levels };
        let rules = rule_set_with_pins(vec![17], vec![27]);
        let mut sampler = GpioSampler::new(Box::new(reader), &rules);

        assert!(sampler.all_active(&[17]));
        assert!(sampler.all_inactive(&[27]));
        assert!(sampler.any_used_active());
    }

    #[test]
    fn no_active_pins_means_no_replay() {
        let reader = FakeGpio {
            levels: HashMap::new(),
        };
        let rules = rule_set_with_pins(vec![17], vec![27]);
        let mut sampler = GpioSampler::new(Box::new(reader), &rules);
        assert!(!sampler.any_used_active());
    }
}
