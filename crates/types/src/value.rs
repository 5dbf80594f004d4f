use crate::{DataType, format_value, read_uint, write_uint};
use common::{DbError, DbResult};

/// Owned `(DataType, bytes)` pair: the unit of data in VM registers, result
/// callbacks, and built-in functions.
#[derive(Clone, PartialEq)]
pub struct TypedValue {
    pub ty: DataType,
    pub data: Vec<u8>,
}

impl TypedValue {
    pub fn null() -> Self {
        Self {
            ty: DataType::NULL,
            data: Vec::new(),
        }
    }

    /// Build a value from a descriptor and raw encoded bytes, zero-padding
    /// or truncating to the descriptor's size.
    pub fn from_bytes(ty: DataType, bytes: &[u8]) -> Self {
        let size = ty.total_size() as usize;
        let mut data = vec![0u8; size];
        let n = size.min(bytes.len());
        data[..n].copy_from_slice(&bytes[..n]);
        Self { ty, data }
    }

    pub fn from_u32(v: u32) -> Self {
        Self {
            ty: DataType::U32,
            data: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            ty: DataType::U64,
            data: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            ty: DataType::I64,
            data: v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_f64(v: f64) -> Self {
        Self {
            ty: DataType::F64,
            data: v.to_le_bytes().to_vec(),
        }
    }

    /// Fixed-size string, NUL padded to `len` bytes. Longer input is
    /// truncated.
    pub fn from_char(s: &str, len: u16) -> Self {
        let mut data = vec![0u8; len as usize];
        let n = s.len().min(len as usize);
        data[..n].copy_from_slice(&s.as_bytes()[..n]);
        Self {
            ty: DataType::char(len),
            data,
        }
    }

    pub fn from_varchar(s: &str) -> Self {
        Self {
            ty: DataType::varchar(s.len() as u16),
            data: s.as_bytes().to_vec(),
        }
    }

    /// Unsigned view of any integer value, regardless of declared width.
    pub fn as_u64(&self) -> DbResult<u64> {
        if !self.ty.is_unsigned() {
            return Err(DbError::Vm(format!("expected unsigned, got {:?}", self.ty)));
        }
        Ok(read_uint(&self.data, self.ty.total_size()))
    }

    pub fn as_u32(&self) -> DbResult<u32> {
        Ok(self.as_u64()? as u32)
    }

    /// String payload up to the first NUL.
    pub fn as_str(&self) -> DbResult<&str> {
        if !self.ty.is_string() {
            return Err(DbError::Vm(format!("expected string, got {:?}", self.ty)));
        }
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end])
            .map_err(|_| DbError::Vm("string value is not valid utf-8".into()))
    }

    /// Boolean interpretation used by `JumpIf` and `Logic`: any non-zero
    /// byte is true. Null is false.
    pub fn is_truthy(&self) -> bool {
        self.data.iter().any(|&b| b != 0)
    }

    /// u32 flag value, the conventional result of `Test` and `Seek`.
    pub fn flag(v: bool) -> Self {
        Self::from_u32(v as u32)
    }

    /// Rewrite the value in place as a u32 flag, reusing the buffer.
    pub fn set_flag(&mut self, v: bool) {
        self.ty = DataType::U32;
        self.data.resize(4, 0);
        write_uint(&mut self.data, 4, v as u64);
    }
}

impl std::fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.ty, format_value(self.ty, &self.data))
    }
}
