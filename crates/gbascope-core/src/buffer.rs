//! The shared byte buffer and little-endian read helpers.
//!
//! Every component reads the buffer; only [`ByteBuffer::write`] mutates it.
//! Readers hold a guard for the duration of one step so that an edit can
//! interleave between pipeline steps but never tear a scan.

use crate::error::{Error, Result};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Top byte that marks a word as a cartridge ROM pointer
pub const DEFAULT_BANK_TAG: u8 = 0x08;

/// Mask for the 24-bit address carried by a pointer word
const ADDRESS_MASK: u32 = 0x00FF_FFFF;

/// Lock-guarded, cheaply cloneable byte buffer
#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl ByteBuffer {
    /// Wraps the given bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Takes a read guard over the bytes
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of bytes in the buffer
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites a single byte
    pub fn write(&self, location: usize, value: u8) -> Result<()> {
        let mut data = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let len = data.len();
        let slot = data
            .get_mut(location)
            .ok_or_else(|| Error::out_of_bounds(location, len))?;
        *slot = value;
        Ok(())
    }

    /// Copies the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.read().clone()
    }
}

/// Reads a little-endian u16
pub fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Reads a little-endian u32
pub fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Follows the word at `at` if it carries `bank_tag` and lands inside the buffer.
///
/// No alignment is required of the destination: text and byte tables are
/// routinely pointed at odd offsets.
pub fn follow_pointer(data: &[u8], at: usize, bank_tag: u8) -> Option<usize> {
    let word = read_u32(data, at)?;
    if (word >> 24) as u8 != bank_tag {
        return None;
    }
    let destination = (word & ADDRESS_MASK) as usize;
    (destination < data.len()).then_some(destination)
}

/// Encodes `destination` as a pointer word
pub fn encode_pointer(destination: usize, bank_tag: u8) -> [u8; 4] {
    let word = (destination as u32 & ADDRESS_MASK) | (u32::from(bank_tag) << 24);
    word.to_le_bytes()
}

/// Position of the first occurrence of `needle` in `haystack` at or after `from`
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let data = [0x34, 0x12, 0x78, 0x56];
        assert_eq!(read_u16(&data, 0), Some(0x1234));
        assert_eq!(read_u32(&data, 0), Some(0x5678_1234));
        assert_eq!(read_u16(&data, 3), None);
        assert_eq!(read_u32(&data, 1), None);
        assert_eq!(read_u32(&data, usize::MAX), None);
    }

    #[test]
    fn test_follow_pointer() {
        let mut data = vec![0u8; 0x20];
        data[0..4].copy_from_slice(&encode_pointer(0x10, DEFAULT_BANK_TAG));
        data[4..8].copy_from_slice(&[0x10, 0x00, 0x00, 0x09]);
        data[8..12].copy_from_slice(&encode_pointer(0x1000, DEFAULT_BANK_TAG));

        assert_eq!(follow_pointer(&data, 0, DEFAULT_BANK_TAG), Some(0x10));
        assert_eq!(follow_pointer(&data, 4, DEFAULT_BANK_TAG), None);
        // past the end of the buffer
        assert_eq!(follow_pointer(&data, 8, DEFAULT_BANK_TAG), None);
    }

    #[test]
    fn test_write_bounds() {
        let buffer = ByteBuffer::new(vec![0; 4]);
        buffer.write(3, 0xAA).unwrap();
        assert_eq!(buffer.read()[3], 0xAA);

        let err = buffer.write(4, 0xAA).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 4, len: 4 }));
    }

    #[test]
    fn test_find_subsequence() {
        let data = b"abcabc";
        assert_eq!(find_subsequence(data, b"bc", 0), Some(1));
        assert_eq!(find_subsequence(data, b"bc", 2), Some(4));
        assert_eq!(find_subsequence(data, b"zz", 0), None);
        assert_eq!(find_subsequence(data, b"", 0), None);
    }
}
