use core::fmt;

use thiserror::Error;

/// Value reported by the DS18B20 driver when nothing answered on the bus.
pub const NO_READING_C: f32 = -127.0;

/// Anything below this is treated as "no valid reading" rather than a measurement.
pub const MIN_PLAUSIBLE_C: f32 = -100.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("value is {len} bytes, field holds at most {capacity}")]
    TooLong { len: usize, capacity: usize },
    #[error("value contains a NUL byte")]
    InteriorNul,
}

/// NUL-terminated string stored inline in a fixed `N`-byte field.
///
/// The last byte is always zero, so at most `N - 1` bytes of text fit.
/// Bytes after the terminator are kept zeroed, which makes equality
/// compare the visible text only.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub const CAPACITY: usize = N - 1;

    pub const fn empty() -> Self {
        Self { bytes: [0; N] }
    }

    pub fn new(value: &str) -> Result<Self, FieldError> {
        let mut field = Self::empty();
        field.set(value)?;
        Ok(field)
    }

    /// Like [`FixedStr::new`] but cuts `value` at the last char boundary that fits.
    pub fn truncated(value: &str) -> Self {
        let mut end = value.len().min(Self::CAPACITY);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let mut field = Self::empty();
        for (slot, byte) in field.bytes.iter_mut().zip(value[..end].bytes()) {
            if byte == 0 {
                break;
            }
            *slot = byte;
        }
        field
    }

    pub fn set(&mut self, value: &str) -> Result<(), FieldError> {
        if value.len() > Self::CAPACITY {
            return Err(FieldError::TooLong {
                len: value.len(),
                capacity: Self::CAPACITY,
            });
        }
        if value.as_bytes().contains(&0) {
            return Err(FieldError::InteriorNul);
        }

        self.bytes = [0; N];
        self.bytes[..value.len()].copy_from_slice(value.as_bytes());
        Ok(())
    }

    /// Takes the raw storage bytes as they are. A missing terminator is forced
    /// into the last byte; nothing here can fail.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut field = Self::empty();
        let len = raw.len().min(Self::CAPACITY);
        let end = raw[..len].iter().position(|b| *b == 0).unwrap_or(len);
        field.bytes[..end].copy_from_slice(&raw[..end]);
        field
    }

    pub fn as_raw(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.iter().position(|b| *b == 0).unwrap_or(Self::CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }

    /// Text up to the terminator. Invalid UTF-8 left behind by an
    /// uninitialized device is cut at the first bad byte.
    pub fn as_str(&self) -> &str {
        let text = &self.bytes[..self.len()];
        match core::str::from_utf8(text) {
            Ok(s) => s,
            Err(err) => core::str::from_utf8(&text[..err.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest filtered temperature and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub celsius: f32,
    pub taken_at_ms: Option<u32>,
}

impl Reading {
    pub const fn none() -> Self {
        Self {
            celsius: NO_READING_C,
            taken_at_ms: None,
        }
    }

    pub fn new(celsius: f32, now_ms: u32) -> Self {
        Self {
            celsius,
            taken_at_ms: Some(now_ms),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.celsius.is_finite() && self.celsius >= MIN_PLAUSIBLE_C
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_rejects_values_longer_than_capacity() {
        let mut field = FixedStr::<8>::new("short").unwrap();
        assert_eq!(
            field.set("12345678"),
            Err(FieldError::TooLong {
                len: 8,
                capacity: 7
            })
        );
        assert_eq!(field.as_str(), "short");

        field.set("1234567").unwrap();
        assert_eq!(field.as_str(), "1234567");
        assert_eq!(field.as_raw()[7], 0);
    }

    #[test]
    fn shorter_value_clears_previous_tail() {
        let mut field = FixedStr::<8>::new("longer").unwrap();
        field.set("ab").unwrap();
        assert_eq!(field.as_raw(), &[b'a', b'b', 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn from_raw_forces_terminator_on_garbage() {
        let field = FixedStr::<4>::from_raw(&[b'a', b'b', b'c', b'd']);
        assert_eq!(field.as_str(), "abc");
        assert_eq!(field.as_raw(), &[b'a', b'b', b'c', 0]);
    }

    #[test]
    fn from_raw_drops_bytes_after_terminator() {
        let field = FixedStr::<6>::from_raw(&[b'o', b'k', 0, 0xff, 0xfe, 0x01]);
        assert_eq!(field, FixedStr::<6>::new("ok").unwrap());
    }

    #[test]
    fn invalid_utf8_is_cut_at_first_bad_byte() {
        let field = FixedStr::<8>::from_raw(&[b'h', b'i', 0xff, b'x', 0, 0, 0, 0]);
        assert_eq!(field.as_str(), "hi");
    }

    #[test]
    fn erased_flash_reads_as_empty_text() {
        let field = FixedStr::<8>::from_raw(&[0xff; 8]);
        assert_eq!(field.as_str(), "");
        assert_eq!(field.len(), 7);
    }

    #[test]
    fn truncated_respects_char_boundaries() {
        let field = FixedStr::<5>::truncated("aéé");
        assert_eq!(field.as_str(), "aé");
    }

    #[test]
    fn readings_below_threshold_are_invalid() {
        assert!(!Reading::none().is_valid());
        assert!(!Reading::new(-100.5, 10).is_valid());
        assert!(!Reading::new(f32::NAN, 10).is_valid());
        assert!(!Reading::new(f32::INFINITY, 10).is_valid());
        assert!(Reading::new(-40.0, 10).is_valid());
        assert!(Reading::new(23.456, 10).is_valid());
    }
}
