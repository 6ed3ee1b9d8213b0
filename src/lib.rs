pub mod buffer;
pub mod cli;
pub mod config;
pub mod device_side;
pub mod ep0;
pub mod error;
pub mod gadget_side;
pub mod gpio;
pub mod hexcodec;
pub mod injection;
pub mod pump;
pub mod raw_gadget_abi;
pub mod runtime;
pub mod topology;
