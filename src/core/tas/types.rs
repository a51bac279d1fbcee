//! Element types, MISSING sentinels and in-memory arrays
//!
//! Element bytes are kept little-endian. Conversion between types applies
//! `dst = bscale * src + bzero`, keeps MISSING values missing, rounds to the
//! nearest integer for integer targets and maps out-of-range values to MISSING.

use crate::error::{Result, SumsError};
use serde::{Deserialize, Serialize};

/// Sentinel for a missing `Time` value
pub const MISSING_TIME: f64 = -211_087_684_800.0;

/// Element type codes as stored in the TAS header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ElementType {
    Char = 0,
    Short = 1,
    Int = 2,
    LongLong = 3,
    Float = 4,
    Double = 5,
    Time = 6,
    String = 7,
    /// Request data in whatever type the file stores
    Raw = 8,
}

impl ElementType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ElementType::Char),
            1 => Some(ElementType::Short),
            2 => Some(ElementType::Int),
            3 => Some(ElementType::LongLong),
            4 => Some(ElementType::Float),
            5 => Some(ElementType::Double),
            6 => Some(ElementType::Time),
            7 => Some(ElementType::String),
            8 => Some(ElementType::Raw),
            _ => None,
        }
    }

    /// Size of one element in bytes, or `None` for types without fixed storage.
    pub fn size(self) -> Option<usize> {
        match self {
            ElementType::Char => Some(1),
            ElementType::Short => Some(2),
            ElementType::Int | ElementType::Float => Some(4),
            ElementType::LongLong | ElementType::Double | ElementType::Time => Some(8),
            ElementType::String | ElementType::Raw => None,
        }
    }

    /// Element size, failing for types that cannot live in a numeric array.
    pub fn storage_size(self) -> Result<usize> {
        self.size().ok_or(SumsError::InvalidType(self as i32))
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElementType::Char | ElementType::Short | ElementType::Int | ElementType::LongLong
        )
    }

    /// Little-endian bytes of this type's MISSING value.
    pub fn missing_bytes(self) -> Result<Vec<u8>> {
        Ok(match self {
            ElementType::Char => i8::MIN.to_le_bytes().to_vec(),
            ElementType::Short => i16::MIN.to_le_bytes().to_vec(),
            ElementType::Int => i32::MIN.to_le_bytes().to_vec(),
            ElementType::LongLong => i64::MIN.to_le_bytes().to_vec(),
            ElementType::Float => f32::NAN.to_le_bytes().to_vec(),
            ElementType::Double => f64::NAN.to_le_bytes().to_vec(),
            ElementType::Time => MISSING_TIME.to_le_bytes().to_vec(),
            ElementType::String | ElementType::Raw => {
                return Err(SumsError::InvalidType(self as i32))
            }
        })
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::Char => "char",
            ElementType::Short => "short",
            ElementType::Int => "int",
            ElementType::LongLong => "longlong",
            ElementType::Float => "float",
            ElementType::Double => "double",
            ElementType::Time => "time",
            ElementType::String => "string",
            ElementType::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// Fill `buf` with MISSING values of type `t`.
pub fn fill_missing(t: ElementType, buf: &mut [u8]) -> Result<()> {
    let pattern = t.missing_bytes()?;
    for chunk in buf.chunks_exact_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern);
    }
    Ok(())
}

/// Rust types that map onto a numeric element type
pub trait Element: Copy {
    const TYPE: ElementType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $n:expr) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_element!(i8, Char, 1);
impl_element!(i16, Short, 2);
impl_element!(i32, Int, 4);
impl_element!(i64, LongLong, 8);
impl_element!(f32, Float, 4);
impl_element!(f64, Double, 8);

/// Dense N-dimensional array, first axis fastest
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub element_type: ElementType,
    pub axis: Vec<usize>,
    pub data: Vec<u8>,
}

impl Array {
    /// Wrap raw little-endian element bytes.
    pub fn new(element_type: ElementType, axis: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let sz = element_type.storage_size()?;
        let expected = sz * axis.iter().product::<usize>();
        if data.len() != expected {
            return Err(SumsError::InvalidRequest(format!(
                "array data holds {} bytes, axes need {}",
                data.len(),
                expected
            )));
        }
        Ok(Array {
            element_type,
            axis,
            data,
        })
    }

    /// Array of the given shape filled with MISSING.
    pub fn missing(element_type: ElementType, axis: Vec<usize>) -> Result<Self> {
        let sz = element_type.storage_size()?;
        let mut data = vec![0u8; sz * axis.iter().product::<usize>()];
        fill_missing(element_type, &mut data)?;
        Ok(Array {
            element_type,
            axis,
            data,
        })
    }

    /// Build an array from typed values.
    pub fn from_values<T: Element>(axis: Vec<usize>, values: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::TYPE.storage_size()?);
        for &v in values {
            v.write_le(&mut data);
        }
        Array::new(T::TYPE, axis, data)
    }

    /// Build a `Time` array from seconds.
    pub fn from_times(axis: Vec<usize>, values: &[f64]) -> Result<Self> {
        let mut array = Array::from_values(axis, values)?;
        array.element_type = ElementType::Time;
        Ok(array)
    }

    /// Decode the elements as `T`; `Time` arrays read as `f64`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let compatible = self.element_type == T::TYPE
            || (self.element_type == ElementType::Time && T::TYPE == ElementType::Double);
        if !compatible {
            return Err(SumsError::InvalidType(self.element_type as i32));
        }
        let sz = self.element_type.storage_size()?;
        Ok(self.data.chunks_exact(sz).map(T::read_le).collect())
    }

    pub fn naxis(&self) -> usize {
        self.axis.len()
    }

    pub fn count(&self) -> usize {
        self.axis.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Int(i64),
    Float(f64),
    Missing,
}

fn read_scalar(t: ElementType, bytes: &[u8]) -> Scalar {
    match t {
        ElementType::Char => match i8::read_le(bytes) {
            i8::MIN => Scalar::Missing,
            v => Scalar::Int(v.into()),
        },
        ElementType::Short => match i16::read_le(bytes) {
            i16::MIN => Scalar::Missing,
            v => Scalar::Int(v.into()),
        },
        ElementType::Int => match i32::read_le(bytes) {
            i32::MIN => Scalar::Missing,
            v => Scalar::Int(v.into()),
        },
        ElementType::LongLong => match i64::read_le(bytes) {
            i64::MIN => Scalar::Missing,
            v => Scalar::Int(v),
        },
        ElementType::Float => {
            let v = f32::read_le(bytes);
            if v.is_nan() {
                Scalar::Missing
            } else {
                Scalar::Float(v.into())
            }
        }
        ElementType::Double => {
            let v = f64::read_le(bytes);
            if v.is_nan() {
                Scalar::Missing
            } else {
                Scalar::Float(v)
            }
        }
        ElementType::Time => {
            let v = f64::read_le(bytes);
            if v == MISSING_TIME || v.is_nan() {
                Scalar::Missing
            } else {
                Scalar::Float(v)
            }
        }
        ElementType::String | ElementType::Raw => Scalar::Missing,
    }
}

fn to_integer(value: Scalar, min: i64, max: i64) -> Option<i64> {
    match value {
        Scalar::Int(v) if v >= min && v <= max => Some(v),
        Scalar::Float(f) => {
            let r = f.round();
            if r >= min as f64 && r <= max as f64 {
                Some(r as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn write_scalar(t: ElementType, value: Scalar, out: &mut Vec<u8>) {
    match t {
        ElementType::Char => match to_integer(value, i8::MIN as i64 + 1, i8::MAX as i64) {
            Some(v) => (v as i8).write_le(out),
            None => i8::MIN.write_le(out),
        },
        ElementType::Short => match to_integer(value, i16::MIN as i64 + 1, i16::MAX as i64) {
            Some(v) => (v as i16).write_le(out),
            None => i16::MIN.write_le(out),
        },
        ElementType::Int => match to_integer(value, i32::MIN as i64 + 1, i32::MAX as i64) {
            Some(v) => (v as i32).write_le(out),
            None => i32::MIN.write_le(out),
        },
        ElementType::LongLong => match value {
            Scalar::Int(v) => v.write_le(out),
            Scalar::Float(f) => {
                let r = f.round();
                if r > i64::MIN as f64 && r < i64::MAX as f64 {
                    (r as i64).write_le(out)
                } else {
                    i64::MIN.write_le(out)
                }
            }
            Scalar::Missing => i64::MIN.write_le(out),
        },
        ElementType::Float => match value {
            Scalar::Int(v) => (v as f32).write_le(out),
            Scalar::Float(f) if f.abs() <= f32::MAX as f64 => (f as f32).write_le(out),
            _ => f32::NAN.write_le(out),
        },
        ElementType::Double => match value {
            Scalar::Int(v) => (v as f64).write_le(out),
            Scalar::Float(f) => f.write_le(out),
            Scalar::Missing => f64::NAN.write_le(out),
        },
        ElementType::Time => match value {
            Scalar::Int(v) => (v as f64).write_le(out),
            Scalar::Float(f) => f.write_le(out),
            Scalar::Missing => MISSING_TIME.write_le(out),
        },
        ElementType::String | ElementType::Raw => {}
    }
}

/// True when reading/writing `stored` as `requested` needs a conversion pass.
pub fn needs_conversion(stored: ElementType, requested: ElementType, bzero: f64, bscale: f64) -> bool {
    requested != ElementType::Raw && (stored != requested || bzero != 0.0 || bscale != 1.0)
}

/// Convert `src` elements of `src_type` into `dst_type` with scaling.
pub fn convert(
    src_type: ElementType,
    dst_type: ElementType,
    bzero: f64,
    bscale: f64,
    src: &[u8],
) -> Result<Vec<u8>> {
    let src_sz = src_type.storage_size()?;
    let dst_sz = dst_type.storage_size()?;
    let scaled = bzero != 0.0 || bscale != 1.0;

    let mut out = Vec::with_capacity(src.len() / src_sz * dst_sz);
    for chunk in src.chunks_exact(src_sz) {
        let mut value = read_scalar(src_type, chunk);
        if scaled {
            value = match value {
                Scalar::Int(v) => Scalar::Float(bscale * v as f64 + bzero),
                Scalar::Float(f) => Scalar::Float(bscale * f + bzero),
                Scalar::Missing => Scalar::Missing,
            };
        }
        write_scalar(dst_type, value, &mut out);
    }
    Ok(out)
}
