//! Crate-wide error type.
//!
//! Per-transfer failures are never propagated through this type — they are
//! logged and the offending transfer is dropped in place (see the pump and
//! EP0 controller modules). `ProxyError` exists only for conditions that
//! should stop the daemon before it starts moving traffic: a malformed
//! configuration file, or a transport that could not be opened.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config ({field}): {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("failed to open downstream USB device: {0}")]
    DeviceOpen(rusb::Error),

    #[error("downstream USB transfer failed: {0}")]
    Transfer(#[from] rusb::Error),

    #[error("failed to open upstream gadget transport at {path}: {source}")]
    GadgetOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gadget ioctl {0} failed: {1}")]
    GadgetIoctl(&'static str, #[source] nix::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
