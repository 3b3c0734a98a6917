use crate::{*, error::*, layout::*};
use bitflags::*;
use std::fmt;

// One decoded field or array element. References are returned as addresses; following them is the caller's business.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Reference(usize),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    NativePtr(usize),
    Vector128(V128),
    // Kind code outside RuntimeKind, or RuntimeKind::Invalid.
    Unrepresentable(u8),
    // Bytes of a scalar object that no descriptor says anything about.
    Opaque {addr: usize, len: usize},
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct V128(pub [u8; 16]);
impl V128 {
    pub fn lanes_i32(&self) -> [i32; 4] {
        let b = &self.0;
        [0usize, 1, 2, 3].map(|i| i32::from_le_bytes([b[i*4], b[i*4+1], b[i*4+2], b[i*4+3]]))
    }
    pub fn lanes_f32(&self) -> [f32; 4] { self.lanes_i32().map(|x| f32::from_bits(x as u32)) }
}

bitflags! { pub struct DisplayFlags: u8 {
    // Integers in hex. Booleans stay true/false.
    const HEX = 0x1;
    // Vector128 as four f32 or i32 lanes instead of a byte blob.
    const LANES_F32 = 0x2;
    const LANES_I32 = 0x4;
}}

pub fn format_value(kind: RuntimeKind, bytes: &[u8]) -> Result<FieldValue> {
    if kind == RuntimeKind::Invalid {
        return Ok(FieldValue::Unrepresentable(kind.code()));
    }
    let size = kind.byte_size()?;
    if bytes.len() != size {
        return err!(Internal, "{} value needs {} bytes, got {}", kind.name(), size, bytes.len());
    }
    let mut w = [0u8; 8];
    if size <= 8 {
        w[..size].copy_from_slice(bytes);
    }
    Ok(match kind {
        RuntimeKind::Invalid => FieldValue::Unrepresentable(kind.code()),
        RuntimeKind::Object => match usize::from_le_bytes(w) {
            0 => FieldValue::Null,
            a => FieldValue::Reference(a),
        }
        RuntimeKind::Int8 => FieldValue::Int8(w[0] as i8),
        RuntimeKind::Int16 => FieldValue::Int16(i16::from_le_bytes([w[0], w[1]])),
        RuntimeKind::Int32 => FieldValue::Int32(i32::from_le_bytes([w[0], w[1], w[2], w[3]])),
        RuntimeKind::Int64 => FieldValue::Int64(i64::from_le_bytes(w)),
        RuntimeKind::Float32 => FieldValue::Float32(f32::from_bits(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))),
        RuntimeKind::Float64 => FieldValue::Float64(f64::from_bits(u64::from_le_bytes(w))),
        RuntimeKind::NativePtr => FieldValue::NativePtr(usize::from_le_bytes(w)),
        RuntimeKind::Boolean => FieldValue::Bool(w[0] != 0),
        RuntimeKind::Vector128 => {
            let mut v = [0u8; 16];
            v.copy_from_slice(bytes);
            FieldValue::Vector128(V128(v))
        }
    })
}

// Same, for a raw kind byte from the target. Unknown codes become Unrepresentable rather than an error,
// so that one bad field doesn't hide its siblings.
pub fn format_value_code(code: u8, bytes: &[u8]) -> Result<FieldValue> {
    match RuntimeKind::from_code(code as i64) {
        Ok(k) => format_value(k, bytes),
        Err(_) => Ok(FieldValue::Unrepresentable(code)),
    }
}

impl FieldValue {
    pub fn reference(&self) -> Option<usize> { match self { FieldValue::Reference(a) => Some(*a), _ => None } }
    pub fn is_null(&self) -> bool { match self { FieldValue::Null => true, _ => false } }

    // Integer-like values widened to i64, e.g. for array counts and indices stored in fields.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int8(x) => Some(x as i64),
            FieldValue::Int16(x) => Some(x as i64),
            FieldValue::Int32(x) => Some(x as i64),
            FieldValue::Int64(x) => Some(x),
            FieldValue::Bool(x) => Some(x as i64),
            _ => None,
        }
    }

    pub fn format_with(&self, flags: DisplayFlags) -> String {
        let hex = flags.contains(DisplayFlags::HEX);
        match *self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Reference(a) => format!("0x{:x}", a),
            FieldValue::Int8(x) if hex => format!("0x{:x}", x as u8),
            FieldValue::Int16(x) if hex => format!("0x{:x}", x as u16),
            FieldValue::Int32(x) if hex => format!("0x{:x}", x as u32),
            FieldValue::Int64(x) if hex => format!("0x{:x}", x as u64),
            FieldValue::Int8(x) => format!("{}", x),
            FieldValue::Int16(x) => format!("{}", x),
            FieldValue::Int32(x) => format!("{}", x),
            FieldValue::Int64(x) => format!("{}", x),
            FieldValue::Float32(x) => format!("{}", x),
            FieldValue::Float64(x) => format!("{}", x),
            FieldValue::Bool(x) => format!("{}", x),
            FieldValue::NativePtr(a) => format!("0x{:x}", a),
            FieldValue::Vector128(v) => {
                if flags.contains(DisplayFlags::LANES_F32) {
                    let l = v.lanes_f32();
                    format!("[{}, {}, {}, {}]", l[0], l[1], l[2], l[3])
                } else if flags.contains(DisplayFlags::LANES_I32) {
                    let l = v.lanes_i32();
                    format!("[{}, {}, {}, {}]", l[0], l[1], l[2], l[3])
                } else {
                    let mut s = "0x".to_string();
                    for b in v.0.iter().rev() {
                        s.push_str(&format!("{:02x}", b));
                    }
                    s
                }
            }
            FieldValue::Unrepresentable(_) => "<unrepresentable kind>".to_string(),
            FieldValue::Opaque {len, ..} => format!("<{} opaque bytes>", len),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.format_with(DisplayFlags::empty()))
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, layout::*, value::*};

    #[test]
    fn primitives() {
        assert_eq!(format_value(RuntimeKind::Int32, &[0xfe, 0xff, 0xff, 0xff]).unwrap(), FieldValue::Int32(-2));
        assert_eq!(format_value(RuntimeKind::Int8, &[0x80]).unwrap(), FieldValue::Int8(-128));
        assert_eq!(format_value(RuntimeKind::Int16, &[1, 1]).unwrap(), FieldValue::Int16(257));
        assert_eq!(format_value(RuntimeKind::Int64, &u64::MAX.to_le_bytes()).unwrap(), FieldValue::Int64(-1));
        assert_eq!(format_value(RuntimeKind::Float32, &1.5f32.to_le_bytes()).unwrap(), FieldValue::Float32(1.5));
        assert_eq!(format_value(RuntimeKind::Float64, &(-0.25f64).to_le_bytes()).unwrap(), FieldValue::Float64(-0.25));
        assert_eq!(format_value(RuntimeKind::Boolean, &[2]).unwrap(), FieldValue::Bool(true));
        assert_eq!(format_value(RuntimeKind::NativePtr, &0x1234usize.to_le_bytes()).unwrap(), FieldValue::NativePtr(0x1234));
    }

    #[test]
    fn references() {
        assert_eq!(format_value(RuntimeKind::Object, &[0; 8]).unwrap(), FieldValue::Null);
        let v = format_value(RuntimeKind::Object, &0x10000usize.to_le_bytes()).unwrap();
        assert_eq!(v.reference(), Some(0x10000));
        assert_eq!(format!("{}", v), "0x10000");
    }

    #[test]
    fn unrepresentable_never_defaults_to_zero() {
        assert_eq!(format_value_code(0, &[]).unwrap(), FieldValue::Unrepresentable(0));
        assert_eq!(format_value_code(200, &[0; 4]).unwrap(), FieldValue::Unrepresentable(200));
        assert_eq!(format!("{}", FieldValue::Unrepresentable(200)), "<unrepresentable kind>");
        assert!(format_value(RuntimeKind::Int32, &[0; 2]).is_err());
    }

    #[test]
    fn vector_lanes() {
        let mut b = [0u8; 16];
        for i in 0..4usize {
            b[i*4..i*4+4].copy_from_slice(&((i as f32) + 0.5).to_le_bytes());
        }
        let v = format_value(RuntimeKind::Vector128, &b).unwrap();
        assert_eq!(v.format_with(DisplayFlags::LANES_F32), "[0.5, 1.5, 2.5, 3.5]");
        let mut c = [0u8; 16];
        c[0] = 0xab;
        let v = format_value(RuntimeKind::Vector128, &c).unwrap();
        assert_eq!(format!("{}", v), "0x000000000000000000000000000000ab");
        assert_eq!(FieldValue::Int32(-1).format_with(DisplayFlags::HEX), "0xffffffff");
    }
}
