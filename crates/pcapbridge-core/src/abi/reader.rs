use super::ByteOrder;
use super::error::AbiError;
use super::layout::{Field, FieldWidth};

/// Bounds-aware reads of header fields in a fixed byte order.
pub struct HeaderReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> HeaderReader<'a> {
    pub fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    pub fn require_len(&self, needed: usize) -> Result<(), AbiError> {
        if self.bytes.len() < needed {
            return Err(AbiError::TooShort {
                needed,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }

    /// Read an unsigned field. The caller has checked the length against the
    /// table's `header_len`.
    pub fn read_unsigned(&self, field: Field) -> u64 {
        let raw = &self.bytes[field.offset..field.end()];
        match (field.width, self.order) {
            (FieldWidth::U32, ByteOrder::Little) => {
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
            }
            (FieldWidth::U32, ByteOrder::Big) => {
                u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
            }
            (FieldWidth::U64, ByteOrder::Little) => u64::from_le_bytes(to_array8(raw)),
            (FieldWidth::U64, ByteOrder::Big) => u64::from_be_bytes(to_array8(raw)),
        }
    }

    /// Read a signed field, sign-extending 32-bit values.
    pub fn read_signed(&self, field: Field) -> i64 {
        let value = self.read_unsigned(field);
        match field.width {
            FieldWidth::U32 => value as u32 as i32 as i64,
            FieldWidth::U64 => value as i64,
        }
    }
}

/// Write side of [`HeaderReader`], used when encoding headers.
pub struct HeaderWriter<'a> {
    bytes: &'a mut [u8],
    order: ByteOrder,
}

impl<'a> HeaderWriter<'a> {
    pub fn new(bytes: &'a mut [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    pub fn require_len(&self, needed: usize) -> Result<(), AbiError> {
        if self.bytes.len() < needed {
            return Err(AbiError::TooShort {
                needed,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }

    pub fn write(&mut self, field: Field, value: u64) {
        let out = &mut self.bytes[field.offset..field.end()];
        match (field.width, self.order) {
            (FieldWidth::U32, ByteOrder::Little) => {
                out.copy_from_slice(&(value as u32).to_le_bytes())
            }
            (FieldWidth::U32, ByteOrder::Big) => out.copy_from_slice(&(value as u32).to_be_bytes()),
            (FieldWidth::U64, ByteOrder::Little) => out.copy_from_slice(&value.to_le_bytes()),
            (FieldWidth::U64, ByteOrder::Big) => out.copy_from_slice(&value.to_be_bytes()),
        }
    }
}

fn to_array8(raw: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(raw);
    out
}

#[cfg(test)]
mod tests {
    use super::{HeaderReader, HeaderWriter};
    use crate::abi::ByteOrder;
    use crate::abi::error::AbiError;
    use crate::abi::layout::{Field, FieldWidth};

    #[test]
    fn reads_respect_byte_order() {
        let bytes = [0x00, 0x00, 0x00, 0x2a];
        let field = Field {
            offset: 0,
            width: FieldWidth::U32,
        };
        assert_eq!(HeaderReader::new(&bytes, ByteOrder::Big).read_unsigned(field), 42);
        assert_eq!(
            HeaderReader::new(&bytes, ByteOrder::Little).read_unsigned(field),
            0x2a00_0000
        );
    }

    #[test]
    fn signed_32bit_values_are_sign_extended() {
        let bytes = (-5i32).to_le_bytes();
        let field = Field {
            offset: 0,
            width: FieldWidth::U32,
        };
        let reader = HeaderReader::new(&bytes, ByteOrder::Little);
        assert_eq!(reader.read_signed(field), -5);
    }

    #[test]
    fn writer_and_reader_agree_on_u64() {
        let mut bytes = [0u8; 8];
        let field = Field {
            offset: 0,
            width: FieldWidth::U64,
        };
        HeaderWriter::new(&mut bytes, ByteOrder::Big).write(field, 0x0102_0304_0506_0708);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn require_len_reports_short_buffers() {
        let bytes = [0u8; 3];
        let err = HeaderReader::new(&bytes, ByteOrder::Little)
            .require_len(16)
            .unwrap_err();
        assert_eq!(
            err,
            AbiError::TooShort {
                needed: 16,
                actual: 3
            }
        );
    }
}
