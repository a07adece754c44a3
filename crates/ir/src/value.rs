//! This module contains IR value definition.
use std::fmt;

use super::Type;
use crate::inst::InstId;

/// An opaque reference to [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct ValueId(pub u32);
cranelift_entity::entity_impl!(ValueId);

/// An value data definition.
#[derive(Debug, Clone)]
pub enum Value {
    /// The value is defined by an instruction.
    Inst { inst: InstId, ty: Type },

    /// The value is a function argument.
    Arg { ty: Type, idx: usize },

    /// The value is immediate value.
    Immediate { imm: Immediate, ty: Type },

    Undef { ty: Type },
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Self::Inst { ty, .. }
            | Self::Arg { ty, .. }
            | Self::Immediate { ty, .. }
            | Self::Undef { ty } => *ty,
        }
    }
}

/// Immediate values. Floats are kept as bit patterns so immediates can be
/// interned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    I1(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
}

impl Immediate {
    pub fn ty(&self) -> Type {
        match self {
            Self::I1(..) => Type::I1,
            Self::I8(..) => Type::I8,
            Self::I16(..) => Type::I16,
            Self::I32(..) => Type::I32,
            Self::I64(..) => Type::I64,
            Self::F32(..) => Type::F32,
            Self::F64(..) => Type::F64,
        }
    }

    /// Sign-extended integer value of the immediate.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I1(v) => Some(v as i64),
            Self::I8(v) => Some(v as i64),
            Self::I16(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            Self::I64(v) => Some(v),
            Self::F32(..) | Self::F64(..) => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(bits) => Some(f32::from_bits(bits)),
            _ => None,
        }
    }

    /// Integer immediate of type `ty` holding `value` truncated to the width
    /// of `ty`.
    pub fn from_i64(value: i64, ty: Type) -> Option<Self> {
        match ty {
            Type::I1 => Some(Self::I1(value & 1 != 0)),
            Type::I8 => Some(Self::I8(value as i8)),
            Type::I16 => Some(Self::I16(value as i16)),
            Type::I32 => Some(Self::I32(value as i32)),
            Type::I64 => Some(Self::I64(value)),
            _ => None,
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for Immediate {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_int!(bool => I1, i8 => I8, i16 => I16, i32 => I32, i64 => I64);

impl From<u32> for Immediate {
    fn from(v: u32) -> Self {
        Self::I32(v as i32)
    }
}

impl From<u64> for Immediate {
    fn from(v: u64) -> Self {
        Self::I64(v as i64)
    }
}

impl From<f32> for Immediate {
    fn from(v: f32) -> Self {
        Self::F32(v.to_bits())
    }
}

impl From<f64> for Immediate {
    fn from(v: f64) -> Self {
        Self::F64(v.to_bits())
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::I1(v) => write!(f, "{}", v as u8),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F32(bits) => write!(f, "{:?}", f32::from_bits(bits)),
            Self::F64(bits) => write!(f, "{:?}", f64::from_bits(bits)),
        }
    }
}
