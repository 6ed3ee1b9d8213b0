//! [`TransferBuffer`]: the fixed-capacity payload container shared by every
//! transfer kind (control, interrupt, bulk, isochronous).

/// Maximum payload length a [`TransferBuffer`] can hold.
///
/// One less than the raw buffer capacity: the injection engine treats 1024
/// as an exclusive upper bound so a replacement is only ever applied if the
/// result stays strictly below it.
pub const MAX_LENGTH: usize = 1024;

/// Disposition bits produced by the injection engine for a control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    None,
    Ignore,
    Stall,
}

/// A single in-flight USB transfer's payload, endpoint tag, and disposition.
///
/// Only `data[..length]` is meaningful; bytes past `length` are leftover
/// from a previous occupant of the buffer and must never be read.
#[derive(Clone, Debug)]
pub struct TransferBuffer {
    pub endpoint_index: i32,
    pub flags: Disposition,
    pub length: usize,
    pub data: [u8; MAX_LENGTH],
}

impl TransferBuffer {
    /// A zeroed buffer for the given endpoint index, ready to receive `length` bytes.
    pub fn new(endpoint_index: i32, length: usize) -> Self {
        assert!(length <= MAX_LENGTH, "transfer length {length} exceeds {MAX_LENGTH}");
        Self {
            endpoint_index,
            flags: Disposition::None,
            length,
            data: [0u8; MAX_LENGTH],
        }
    }

    /// Builds a buffer by copying `bytes` in, clamped to [`MAX_LENGTH`].
    pub fn from_slice(endpoint_index: i32, bytes: &[u8]) -> Self {
        let mut buf = Self::new(endpoint_index, bytes.len().min(MAX_LENGTH));
        buf.data[..buf.length].copy_from_slice(&bytes[..buf.length]);
        buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.length]
    }
}
