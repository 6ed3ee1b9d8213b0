//! Injection rule set: JSON on disk, deserialized with `serde`/`serde_json`
//! into a "raw" shape that mirrors the file field-for-field, then compiled
//! into the typed shape the engine actually runs against (hex strings
//! decoded to bytes, the `type` tag resolved to a closed enum). Compiling
//! is where a malformed rule is rejected — not at match time.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ProxyError, ProxyResult};
use crate::hexcodec;

#[derive(Deserialize, Debug, Default)]
struct RawControlMatchRule {
    enable: bool,
    #[serde(rename = "bRequestType")]
    b_request_type: u8,
    #[serde(rename = "bRequest")]
    b_request: u8,
    #[serde(rename = "wValue")]
    w_value: u16,
    #[serde(rename = "wIndex")]
    w_index: u16,
    #[serde(rename = "wLength")]
    w_length: u16,
}

#[derive(Deserialize, Debug)]
struct RawControlModifyRule {
    #[serde(flatten)]
    matcher: RawControlMatchRule,
    content_pattern: Vec<String>,
    replacement: String,
}

#[derive(Deserialize, Debug, Default)]
struct RawControlRules {
    #[serde(default)]
    modify: Vec<RawControlModifyRule>,
    #[serde(default)]
    ignore: Vec<RawControlMatchRule>,
    #[serde(default)]
    stall: Vec<RawControlMatchRule>,
}

#[derive(Deserialize, Debug, Default)]
struct RawGpioSpec {
    #[serde(default)]
    on: Vec<u8>,
    #[serde(default)]
    off: Vec<u8>,
}

#[derive(Deserialize, Debug)]
struct RawByteReplacement {
    index: usize,
    value: u8,
}

#[derive(Deserialize, Debug)]
struct RawEpRule {
    enable: bool,
    ep_address: u8,
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    #[serde(default)]
    content_pattern: Vec<String>,
    #[serde(default)]
    replacement: String,
    #[serde(default)]
    gpio: RawGpioSpec,
    #[serde(default)]
    byte_replacement_type: Option<u8>,
    #[serde(default)]
    byte_replacements: Vec<RawByteReplacement>,
}

#[derive(Deserialize, Debug, Default)]
struct RawInjectionRuleSet {
    #[serde(default)]
    control: RawControlRules,
    #[serde(default)]
    int: Vec<RawEpRule>,
    #[serde(default)]
    bulk: Vec<RawEpRule>,
    #[serde(default)]
    isoc: Vec<RawEpRule>,
}

/// A compiled, exact-match control-transfer matcher.
#[derive(Clone, Debug)]
pub struct ControlMatchRule {
    pub enable: bool,
    pub b_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl ControlMatchRule {
    pub fn matches(&self, b_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> bool {
        self.enable
            && self.b_request_type == b_request_type
            && self.b_request == b_request
            && self.w_value == w_value
            && self.w_index == w_index
            && self.w_length == w_length
    }
}

#[derive(Clone, Debug)]
pub struct ControlModifyRule {
    pub matcher: ControlMatchRule,
    pub content_pattern: Vec<Vec<u8>>,
    pub replacement: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct ControlRules {
    pub modify: Vec<ControlModifyRule>,
    pub ignore: Vec<ControlMatchRule>,
    pub stall: Vec<ControlMatchRule>,
}

/// `byte_replacement_type` for a `RaspberryPiGpio` rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ByteReplacementType {
    #[default]
    Replace,
    BitwiseOr,
}

#[derive(Clone, Debug)]
pub struct ByteReplacement {
    pub index: usize,
    pub value: u8,
}

#[derive(Clone, Debug)]
pub enum RuleKind {
    Default {
        content_pattern: Vec<Vec<u8>>,
        replacement: Vec<u8>,
    },
    RaspberryPiGpio {
        gpio_on: Vec<u8>,
        gpio_off: Vec<u8>,
        byte_replacement_type: ByteReplacementType,
        byte_replacements: Vec<ByteReplacement>,
    },
}

#[derive(Clone, Debug)]
pub struct EpRule {
    pub enable: bool,
    pub ep_address: u8,
    pub kind: RuleKind,
}

#[derive(Clone, Debug, Default)]
pub struct InjectionRuleSet {
    pub control: ControlRules,
    pub int: Vec<EpRule>,
    pub bulk: Vec<EpRule>,
    pub isoc: Vec<EpRule>,
}

impl InjectionRuleSet {
    pub fn load(path: &Path) -> ProxyResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawInjectionRuleSet =
            serde_json::from_str(&text).map_err(|e| ProxyError::InvalidConfig {
                field: "<root>".to_string(),
                reason: e.to_string(),
            })?;
        Self::compile(raw)
    }

    fn compile(raw: RawInjectionRuleSet) -> ProxyResult<Self> {
        Ok(Self {
            control: compile_control_rules(raw.control)?,
            int: compile_ep_rules("int", raw.int)?,
            bulk: compile_ep_rules("bulk", raw.bulk)?,
            isoc: compile_ep_rules("isoc", raw.isoc)?,
        })
    }

    pub fn rules_for(&self, class: crate::topology::TransferClass) -> &[EpRule] {
        match class {
            crate::topology::TransferClass::Control => &[],
            crate::topology::TransferClass::Isochronous => &self.isoc,
            crate::topology::TransferClass::Bulk => &self.bulk,
            crate::topology::TransferClass::Interrupt => &self.int,
        }
    }
}

fn compile_matcher(raw: RawControlMatchRule) -> ControlMatchRule {
    ControlMatchRule {
        enable: raw.enable,
        b_request_type: raw.b_request_type,
        b_request: raw.b_request,
        w_value: raw.w_value,
        w_index: raw.w_index,
        w_length: raw.w_length,
    }
}

fn compile_control_rules(raw: RawControlRules) -> ProxyResult<ControlRules> {
    let modify = raw
        .modify
        .into_iter()
        .map(|r| -> ProxyResult<ControlModifyRule> {
            let content_pattern = r
                .content_pattern
                .iter()
                .map(|p| hexcodec::decode("control.modify.content_pattern", p))
                .collect::<ProxyResult<Vec<_>>>()?;
            let replacement = hexcodec::decode("control.modify.replacement", &r.replacement)?;
            Ok(ControlModifyRule {
                matcher: compile_matcher(r.matcher),
                content_pattern,
                replacement,
            })
        })
        .collect::<ProxyResult<Vec<_>>>()?;

    Ok(ControlRules {
        modify,
        ignore: raw.ignore.into_iter().map(compile_matcher).collect(),
        stall: raw.stall.into_iter().map(compile_matcher).collect(),
    })
}

fn compile_ep_rules(class_key: &str, raw: Vec<RawEpRule>) -> ProxyResult<Vec<EpRule>> {
    raw.into_iter()
        .enumerate()
        .map(|(i, r)| compile_ep_rule(class_key, i, r))
        .collect()
}

fn compile_ep_rule(class_key: &str, index: usize, raw: RawEpRule) -> ProxyResult<EpRule> {
    let field = |suffix: &str| format!("{class_key}[{index}].{suffix}");

    let kind = match raw.kind.unwrap_or(0) {
        0 => {
            let content_pattern = raw
                .content_pattern
                .iter()
                .map(|p| hexcodec::decode(&field("content_pattern"), p))
                .collect::<ProxyResult<Vec<_>>>()?;
            let replacement = hexcodec::decode(&field("replacement"), &raw.replacement)?;
            RuleKind::Default {
                content_pattern,
                replacement,
            }
        }
        1 => {
            let byte_replacement_type = match raw.byte_replacement_type.unwrap_or(0) {
                0 => ByteReplacementType::Replace,
                1 => ByteReplacementType::BitwiseOr,
                other => {
                    return Err(ProxyError::InvalidConfig {
                        field: field("byte_replacement_type"),
                        reason: format!("unknown byte_replacement_type {other}"),
                    })
                }
            };
            RuleKind::RaspberryPiGpio {
                gpio_on: raw.gpio.on,
                gpio_off: raw.gpio.off,
                byte_replacement_type,
                byte_replacements: raw
                    .byte_replacements
                    .into_iter()
                    .map(|b| ByteReplacement {
                        index: b.index,
                        value: b.value,
                    })
                    .collect(),
            }
        }
        other => {
            return Err(ProxyError::InvalidConfig {
                field: field("type"),
                reason: format!("unknown rule type {other}"),
            })
        }
    };

    Ok(EpRule {
        enable: raw.enable,
        ep_address: raw.ep_address,
        kind,
    })
}

/// Everything the CLI/config layer needs to hand the runtime before it starts.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub config_path: PathBuf,
    pub injection_enabled: bool,
    pub verbose_level: u8,
    pub gadget_path: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
}
