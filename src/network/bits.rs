//! Bit-granular reader and writer for the input delta stream.
//!
//! Bits are packed least-significant first within each byte, and multi-bit
//! fields are written least-significant bit first.

const PREALLOC_BITS: usize = 4096;

/// Appends bits to a byte buffer with a hard capacity.
#[derive(Debug, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    len: usize,
    capacity: usize,
}

impl BitWriter {
    /// Creates a writer that accepts at most `capacity` bits.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity.min(PREALLOC_BITS).div_ceil(8)),
            len: 0,
            capacity,
        }
    }

    /// Number of bits written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of bits this writer accepts.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bits still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// Writes one bit. Returns `false` without writing when full.
    pub fn write_bit(&mut self, bit: bool) -> bool {
        if self.len >= self.capacity {
            return false;
        }
        let byte_index = self.len / 8;
        if byte_index == self.bytes.len() {
            self.bytes.push(0);
        }
        if bit {
            if let Some(byte) = self.bytes.get_mut(byte_index) {
                *byte |= 1 << (self.len % 8);
            }
        }
        self.len += 1;
        true
    }

    /// Writes the low `width` bits of `value`, low bit first.
    ///
    /// Either all bits are written or none are.
    pub fn write_bits(&mut self, value: u32, width: usize) -> bool {
        debug_assert!(width <= 32);
        if self.remaining() < width {
            return false;
        }
        for shift in 0..width {
            self.write_bit((value >> shift) & 1 == 1);
        }
        true
    }

    /// Rolls the writer back to `len` bits, clearing everything after it.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.len = len;
        self.bytes.truncate(len.div_ceil(8));
        if len % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
    }

    /// The packed bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the writer, returning the packed bytes and the bit count.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, usize) {
        (self.bytes, self.len)
    }
}

/// Reads bits from a packed buffer, stopping at a declared bit count.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    num_bits: usize,
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over the first `num_bits` bits of `bytes`.
    ///
    /// `num_bits` is clamped to what `bytes` can actually hold.
    #[must_use]
    pub fn new(bytes: &'a [u8], num_bits: usize) -> Self {
        Self {
            bytes,
            num_bits: num_bits.min(bytes.len() * 8),
            pos: 0,
        }
    }

    /// Current read position in bits.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bits left before `num_bits`.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.num_bits - self.pos
    }

    /// Whether every declared bit has been read.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.num_bits
    }

    /// Reads one bit, `None` past the end.
    pub fn read_bit(&mut self) -> Option<bool> {
        if self.pos >= self.num_bits {
            return None;
        }
        let byte = self.bytes.get(self.pos / 8)?;
        let bit = (byte >> (self.pos % 8)) & 1 == 1;
        self.pos += 1;
        Some(bit)
    }

    /// Reads `width` bits written by [`BitWriter::write_bits`].
    pub fn read_bits(&mut self, width: usize) -> Option<u32> {
        debug_assert!(width <= 32);
        if self.remaining() < width {
            return None;
        }
        let mut value = 0u32;
        for shift in 0..width {
            if self.read_bit()? {
                value |= 1 << shift;
            }
        }
        Some(value)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn bits_pack_low_bit_first() {
        let mut writer = BitWriter::with_capacity(16);
        assert!(writer.write_bit(true));
        assert!(writer.write_bit(false));
        assert!(writer.write_bit(true));
        assert_eq!(writer.as_bytes(), &[0b101]);
        assert_eq!(writer.len(), 3);
    }

    #[test]
    fn multi_bit_fields_round_trip() {
        let mut writer = BitWriter::with_capacity(64);
        assert!(writer.write_bits(0xA, 4));
        assert!(writer.write_bit(true));
        assert!(writer.write_bits(0x3, 4));
        let (bytes, len) = writer.into_parts();

        let mut reader = BitReader::new(&bytes, len);
        assert_eq!(reader.read_bits(4), Some(0xA));
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bits(4), Some(0x3));
        assert!(reader.is_exhausted());
        assert_eq!(reader.read_bit(), None);
    }

    #[test]
    fn writer_refuses_past_capacity() {
        let mut writer = BitWriter::with_capacity(5);
        assert!(writer.write_bits(0b111, 3));
        assert!(!writer.write_bits(0b111, 3));
        assert_eq!(writer.len(), 3);
        assert!(writer.write_bit(true));
        assert!(writer.write_bit(true));
        assert!(!writer.write_bit(true));
    }

    #[test]
    fn truncate_clears_trailing_bits() {
        let mut writer = BitWriter::with_capacity(32);
        assert!(writer.write_bits(0xFFF, 12));
        writer.truncate(3);
        assert_eq!(writer.len(), 3);
        assert_eq!(writer.as_bytes(), &[0b111]);
        assert!(writer.write_bit(false));
        assert_eq!(writer.as_bytes(), &[0b0111]);
    }

    #[test]
    fn reader_stops_at_declared_bits_not_buffer_len() {
        let bytes = [0xFF, 0xFF];
        let mut reader = BitReader::new(&bytes, 3);
        assert_eq!(reader.read_bits(3), Some(0b111));
        assert_eq!(reader.read_bit(), None);
    }

    #[test]
    fn reader_clamps_oversized_bit_count() {
        let bytes = [0x01];
        let reader = BitReader::new(&bytes, 100);
        assert_eq!(reader.remaining(), 8);
    }
}
