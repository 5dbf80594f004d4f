//! Fixed-size value encoding for keys, records, and VM registers.
//!
//! Every value the engine moves around is a `(DataType, bytes)` pair. The
//! descriptor is a single `u64` packing the type id, the component count for
//! composites, up to four per-component sizes, and the total encoded size:
//!
//! ```text
//! [type_id:8][comp_count:8][size1:8][size2:8][size3:8][size4:8][total:16]
//! ```
//!
//! Keeping the whole shape in one word means tree nodes and cursors can carry
//! their key type by value, and comparison dispatches on the id with a single
//! branch instead of dynamic dispatch.

mod value;

pub use value::TypedValue;

use common::{ArithOp, CompareOp, DbError, DbResult};
use std::cmp::Ordering;

/// Type id namespaces. Unsigned and signed ids never overlap so the compare
/// and arithmetic dispatch can branch on the raw id.
pub const TYPE_ID_U8: u8 = 0x01;
pub const TYPE_ID_U16: u8 = 0x02;
pub const TYPE_ID_U32: u8 = 0x03;
pub const TYPE_ID_U64: u8 = 0x04;
pub const TYPE_ID_I8: u8 = 0x11;
pub const TYPE_ID_I16: u8 = 0x12;
pub const TYPE_ID_I32: u8 = 0x13;
pub const TYPE_ID_I64: u8 = 0x14;
pub const TYPE_ID_F32: u8 = 0x21;
pub const TYPE_ID_F64: u8 = 0x22;
pub const TYPE_ID_CHAR: u8 = 0x31;
pub const TYPE_ID_VARCHAR: u8 = 0x32;
pub const TYPE_ID_DUAL: u8 = 0x50;
pub const TYPE_ID_NULL: u8 = 0xFF;

/// 64-bit type descriptor. See the crate docs for the bit layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType(u64);

const fn pack(type_id: u8, comp_count: u8, sizes: [u8; 4], total: u16) -> u64 {
    ((type_id as u64) << 56)
        | ((comp_count as u64) << 48)
        | ((sizes[0] as u64) << 40)
        | ((sizes[1] as u64) << 32)
        | ((sizes[2] as u64) << 24)
        | ((sizes[3] as u64) << 16)
        | (total as u64)
}

impl DataType {
    pub const U8: DataType = DataType(pack(TYPE_ID_U8, 0, [1, 0, 0, 0], 1));
    pub const U16: DataType = DataType(pack(TYPE_ID_U16, 0, [2, 0, 0, 0], 2));
    pub const U32: DataType = DataType(pack(TYPE_ID_U32, 0, [4, 0, 0, 0], 4));
    pub const U64: DataType = DataType(pack(TYPE_ID_U64, 0, [8, 0, 0, 0], 8));
    pub const I8: DataType = DataType(pack(TYPE_ID_I8, 0, [1, 0, 0, 0], 1));
    pub const I16: DataType = DataType(pack(TYPE_ID_I16, 0, [2, 0, 0, 0], 2));
    pub const I32: DataType = DataType(pack(TYPE_ID_I32, 0, [4, 0, 0, 0], 4));
    pub const I64: DataType = DataType(pack(TYPE_ID_I64, 0, [8, 0, 0, 0], 8));
    pub const F32: DataType = DataType(pack(TYPE_ID_F32, 0, [4, 0, 0, 0], 4));
    pub const F64: DataType = DataType(pack(TYPE_ID_F64, 0, [8, 0, 0, 0], 8));
    pub const NULL: DataType = DataType(pack(TYPE_ID_NULL, 0, [0, 0, 0, 0], 0));

    /// Fixed-size string of `len` bytes, NUL padded.
    pub const fn char(len: u16) -> DataType {
        DataType(pack(
            TYPE_ID_CHAR,
            0,
            [(len & 0xFF) as u8, (len >> 8) as u8, 0, 0],
            len,
        ))
    }

    /// Variable-length string with a 16-bit byte length. The length is
    /// carried in size1/size2 and mirrored in the total size.
    pub const fn varchar(len: u16) -> DataType {
        DataType(pack(
            TYPE_ID_VARCHAR,
            0,
            [(len & 0xFF) as u8, (len >> 8) as u8, 0, 0],
            len,
        ))
    }

    /// Two-component composite compared lexicographically.
    ///
    /// The descriptor only has room for component sizes, so components are
    /// restricted to unsigned scalars of size 1, 2, 4, or 8; each compares
    /// as a little-endian unsigned integer of its width.
    pub fn dual(first: DataType, second: DataType) -> DbResult<DataType> {
        for comp in [first, second] {
            if !comp.is_unsigned() {
                return Err(DbError::Vm(format!(
                    "dual components must be unsigned scalars, got {comp:?}"
                )));
            }
        }
        let s1 = first.total_size() as u8;
        let s2 = second.total_size() as u8;
        Ok(DataType(pack(
            TYPE_ID_DUAL,
            2,
            [s1, s2, 0, 0],
            (s1 + s2) as u16,
        )))
    }

    /// Raw descriptor word, used when a type must travel inside a record.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> DataType {
        DataType(bits)
    }

    pub fn type_id(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn component_count(self) -> u8 {
        (self.0 >> 48) as u8
    }

    fn size_field(self, index: u32) -> u8 {
        (self.0 >> (40 - 8 * index)) as u8
    }

    /// Total encoded size in bytes.
    pub fn total_size(self) -> u32 {
        (self.0 & 0xFFFF) as u32
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self.type_id(),
            TYPE_ID_U8 | TYPE_ID_U16 | TYPE_ID_U32 | TYPE_ID_U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self.type_id(),
            TYPE_ID_I8 | TYPE_ID_I16 | TYPE_ID_I32 | TYPE_ID_I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self.type_id(), TYPE_ID_F32 | TYPE_ID_F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_unsigned() || self.is_signed() || self.is_float()
    }

    pub fn is_string(self) -> bool {
        matches!(self.type_id(), TYPE_ID_CHAR | TYPE_ID_VARCHAR)
    }

    pub fn is_dual(self) -> bool {
        self.type_id() == TYPE_ID_DUAL
    }

    pub fn is_null(self) -> bool {
        self.type_id() == TYPE_ID_NULL
    }

    /// Component type of a dual, reconstructed from its size.
    pub fn component(self, index: u32) -> DataType {
        if !self.is_dual() || index >= self.component_count() as u32 {
            return DataType::NULL;
        }
        unsigned_of_size(self.size_field(index))
    }

    /// Byte offset of a dual component within the encoded value.
    pub fn component_offset(self, index: u32) -> u32 {
        let mut offset = 0;
        for i in 0..index {
            offset += self.size_field(i) as u32;
        }
        offset
    }
}

impl std::fmt::Debug for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.type_id() {
            TYPE_ID_U8 => write!(f, "u8"),
            TYPE_ID_U16 => write!(f, "u16"),
            TYPE_ID_U32 => write!(f, "u32"),
            TYPE_ID_U64 => write!(f, "u64"),
            TYPE_ID_I8 => write!(f, "i8"),
            TYPE_ID_I16 => write!(f, "i16"),
            TYPE_ID_I32 => write!(f, "i32"),
            TYPE_ID_I64 => write!(f, "i64"),
            TYPE_ID_F32 => write!(f, "f32"),
            TYPE_ID_F64 => write!(f, "f64"),
            TYPE_ID_CHAR => write!(f, "char{}", self.total_size()),
            TYPE_ID_VARCHAR => write!(f, "varchar{}", self.total_size()),
            TYPE_ID_DUAL => write!(
                f,
                "dual({:?},{:?})",
                self.component(0),
                self.component(1)
            ),
            TYPE_ID_NULL => write!(f, "null"),
            other => write!(f, "type(0x{other:02x})"),
        }
    }
}

fn unsigned_of_size(size: u8) -> DataType {
    match size {
        1 => DataType::U8,
        2 => DataType::U16,
        4 => DataType::U32,
        8 => DataType::U64,
        _ => DataType::NULL,
    }
}

/// Little-endian unsigned read of `size` bytes.
pub fn read_uint(bytes: &[u8], size: u32) -> u64 {
    let mut out = 0u64;
    for i in (0..size as usize).rev() {
        out = (out << 8) | bytes[i] as u64;
    }
    out
}

/// Little-endian unsigned write of the low `size` bytes of `value`.
pub fn write_uint(bytes: &mut [u8], size: u32, value: u64) {
    for i in 0..size as usize {
        bytes[i] = (value >> (8 * i)) as u8;
    }
}

fn read_int(bytes: &[u8], size: u32) -> i64 {
    let raw = read_uint(bytes, size);
    let shift = 64 - 8 * size;
    ((raw << shift) as i64) >> shift
}

/// String payload up to the first NUL, strcmp style. Fixed chars are NUL
/// padded, so this also trims padding.
fn str_payload(bytes: &[u8], total: u32) -> &[u8] {
    let limit = (total as usize).min(bytes.len());
    let end = bytes[..limit].iter().position(|&b| b == 0).unwrap_or(limit);
    &bytes[..end]
}

/// Compare two encoded values of the same type.
///
/// Floats use IEEE partial order with NaN treated as equal to everything,
/// so a comparison always yields a total answer.
pub fn compare(ty: DataType, a: &[u8], b: &[u8]) -> Ordering {
    match ty.type_id() {
        TYPE_ID_U8 | TYPE_ID_U16 | TYPE_ID_U32 | TYPE_ID_U64 => {
            read_uint(a, ty.total_size()).cmp(&read_uint(b, ty.total_size()))
        }
        TYPE_ID_I8 | TYPE_ID_I16 | TYPE_ID_I32 | TYPE_ID_I64 => {
            read_int(a, ty.total_size()).cmp(&read_int(b, ty.total_size()))
        }
        TYPE_ID_F32 => {
            let av = f32::from_le_bytes(a[..4].try_into().unwrap());
            let bv = f32::from_le_bytes(b[..4].try_into().unwrap());
            av.partial_cmp(&bv).unwrap_or(Ordering::Equal)
        }
        TYPE_ID_F64 => {
            let av = f64::from_le_bytes(a[..8].try_into().unwrap());
            let bv = f64::from_le_bytes(b[..8].try_into().unwrap());
            av.partial_cmp(&bv).unwrap_or(Ordering::Equal)
        }
        TYPE_ID_CHAR | TYPE_ID_VARCHAR => {
            str_payload(a, ty.total_size()).cmp(str_payload(b, ty.total_size()))
        }
        TYPE_ID_DUAL => {
            let first = ty.component(0);
            match compare(first, a, b) {
                Ordering::Equal => {
                    let offset = ty.component_offset(1) as usize;
                    compare(ty.component(1), &a[offset..], &b[offset..])
                }
                other => other,
            }
        }
        _ => Ordering::Equal,
    }
}

/// Evaluate a comparison operator over two encoded values.
pub fn compare_op(op: CompareOp, ty: DataType, a: &[u8], b: &[u8]) -> bool {
    let ord = compare(ty, a, b);
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

macro_rules! int_arith {
    ($op:expr, $read:ident, $ty:ty, $a:expr, $b:expr, $size:expr) => {{
        let a = $read($a, $size) as $ty;
        let b = $read($b, $size) as $ty;
        let out = match $op {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
            ArithOp::Div => {
                if b == 0 {
                    return Err(DbError::Vm("division by zero".into()));
                }
                a.wrapping_div(b)
            }
            ArithOp::Rem => {
                if b == 0 {
                    return Err(DbError::Vm("division by zero".into()));
                }
                a.wrapping_rem(b)
            }
        };
        let mut bytes = vec![0u8; $size as usize];
        write_uint(&mut bytes, $size, out as u64);
        Ok(bytes)
    }};
}

/// Typed arithmetic over two encoded values, producing a value of the same
/// type. Integer division or remainder by zero is a VM error; remainder is
/// only defined for integer types.
pub fn arith(op: ArithOp, ty: DataType, a: &[u8], b: &[u8]) -> DbResult<Vec<u8>> {
    let size = ty.total_size();
    match ty.type_id() {
        TYPE_ID_U8 | TYPE_ID_U16 | TYPE_ID_U32 | TYPE_ID_U64 => {
            int_arith!(op, read_uint, u64, a, b, size)
        }
        TYPE_ID_I8 | TYPE_ID_I16 | TYPE_ID_I32 | TYPE_ID_I64 => {
            int_arith!(op, read_int, i64, a, b, size)
        }
        TYPE_ID_F32 => {
            let av = f32::from_le_bytes(a[..4].try_into().unwrap());
            let bv = f32::from_le_bytes(b[..4].try_into().unwrap());
            let out = float_arith(op, av as f64, bv as f64)? as f32;
            Ok(out.to_le_bytes().to_vec())
        }
        TYPE_ID_F64 => {
            let av = f64::from_le_bytes(a[..8].try_into().unwrap());
            let bv = f64::from_le_bytes(b[..8].try_into().unwrap());
            Ok(float_arith(op, av, bv)?.to_le_bytes().to_vec())
        }
        _ => Err(DbError::Vm(format!("arithmetic on non-numeric {ty:?}"))),
    }
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> DbResult<f64> {
    match op {
        ArithOp::Add => Ok(a + b),
        ArithOp::Sub => Ok(a - b),
        ArithOp::Mul => Ok(a * b),
        ArithOp::Div => Ok(a / b),
        ArithOp::Rem => Err(DbError::Vm("remainder is not defined for floats".into())),
    }
}

/// Copy an encoded value of `ty` into `dst`. Sizes are fixed by the
/// descriptor, so this is a bounded memcpy; NUL padding of short string
/// sources is preserved by zero-filling first.
pub fn copy_into(ty: DataType, dst: &mut [u8], src: &[u8]) {
    let size = ty.total_size() as usize;
    let n = size.min(src.len());
    dst[..size].fill(0);
    dst[..n].copy_from_slice(&src[..n]);
}

/// Render an encoded value for diagnostics and result printing.
pub fn format_value(ty: DataType, bytes: &[u8]) -> String {
    match ty.type_id() {
        TYPE_ID_U8 | TYPE_ID_U16 | TYPE_ID_U32 | TYPE_ID_U64 => {
            read_uint(bytes, ty.total_size()).to_string()
        }
        TYPE_ID_I8 | TYPE_ID_I16 | TYPE_ID_I32 | TYPE_ID_I64 => {
            read_int(bytes, ty.total_size()).to_string()
        }
        TYPE_ID_F32 => f32::from_le_bytes(bytes[..4].try_into().unwrap()).to_string(),
        TYPE_ID_F64 => f64::from_le_bytes(bytes[..8].try_into().unwrap()).to_string(),
        TYPE_ID_CHAR | TYPE_ID_VARCHAR => {
            String::from_utf8_lossy(str_payload(bytes, ty.total_size())).into_owned()
        }
        TYPE_ID_DUAL => {
            let offset = ty.component_offset(1) as usize;
            format!(
                "({}, {})",
                format_value(ty.component(0), bytes),
                format_value(ty.component(1), &bytes[offset..])
            )
        }
        TYPE_ID_NULL => "NULL".into(),
        _ => "?".into(),
    }
}
