//! Source-level type system
//!
//! Types carry enough information for lowering to pick register widths,
//! extension signedness, pointer scaling and storage sizes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a scalar value. Every register, immediate and memory access has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Width {
    W1,
    W2,
    W4,
    W8,
}

impl Width {
    /// All widths, narrowest first
    pub const ALL: [Width; 4] = [Width::W1, Width::W2, Width::W4, Width::W8];

    /// Size in bytes
    pub fn bytes(self) -> u32 {
        match self {
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 4,
            Width::W8 => 8,
        }
    }

    /// Size class `0..=3` as stored in the top two bits of an instruction word
    pub fn class(self) -> u8 {
        match self {
            Width::W1 => 0,
            Width::W2 => 1,
            Width::W4 => 2,
            Width::W8 => 3,
        }
    }

    pub fn from_bytes(bytes: u32) -> Option<Width> {
        Width::ALL.into_iter().find(|w| w.bytes() == bytes)
    }

    pub fn from_class(class: u8) -> Option<Width> {
        Width::ALL.into_iter().find(|w| w.class() == class)
    }

    /// Bits in a value of this width
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Width of pointers and function handles
pub const POINTER_WIDTH: Width = Width::W2;

/// Fixed-size integer type such as `u1` or `s4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntType {
    pub signed: bool,
    pub width: Width,
    pub constant: bool,
}

/// Signature of a function value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionType {
    pub returns: Type,
    pub params: Vec<Type>,
    pub varargs: bool,
}

/// A source-level type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Int(IntType),
    Pointer {
        to: Box<Type>,
        constant: bool,
    },
    /// Array of `len` elements. A missing length is only valid as a declared
    /// type that an initialiser will complete.
    Array {
        elem: Box<Type>,
        len: Option<u32>,
        constant: bool,
    },
    Function(Box<FunctionType>),
}

impl Type {
    pub fn uint(width: Width) -> Type {
        Type::Int(IntType {
            signed: false,
            width,
            constant: false,
        })
    }

    pub fn sint(width: Width) -> Type {
        Type::Int(IntType {
            signed: true,
            width,
            constant: false,
        })
    }

    pub fn pointer(to: Type) -> Type {
        Type::Pointer {
            to: Box::new(to),
            constant: false,
        }
    }

    pub fn array(elem: Type, len: Option<u32>) -> Type {
        Type::Array {
            elem: Box::new(elem),
            len,
            constant: false,
        }
    }

    pub fn function(returns: Type, params: Vec<Type>, varargs: bool) -> Type {
        Type::Function(Box::new(FunctionType {
            returns,
            params,
            varargs,
        }))
    }

    /// Parse an integer type name: `u` or `s` followed by a byte count
    /// (`u1`, `s4`, ...).
    pub fn from_name(name: &str) -> Option<Type> {
        let (sign, size) = name.split_at(1.min(name.len()));
        let width = Width::from_bytes(size.parse().ok()?)?;
        match sign {
            "u" => Some(Type::uint(width)),
            "s" => Some(Type::sint(width)),
            _ => None,
        }
    }

    /// Copy of this type with its const flag set
    pub fn as_const(&self) -> Type {
        match self.clone() {
            Type::Int(mut int) => {
                int.constant = true;
                Type::Int(int)
            }
            Type::Pointer { to, .. } => Type::Pointer { to, constant: true },
            Type::Array { elem, len, .. } => Type::Array {
                elem,
                len,
                constant: true,
            },
            other => other,
        }
    }

    /// Copy with the const flag set at every level: array elements and
    /// pointees included
    pub fn deep_const(&self) -> Type {
        match self {
            Type::Pointer { to, .. } => Type::Pointer {
                to: Box::new(to.deep_const()),
                constant: true,
            },
            Type::Array { elem, len, .. } => Type::Array {
                elem: Box::new(elem.deep_const()),
                len: *len,
                constant: true,
            },
            other => other.as_const(),
        }
    }

    /// Storage size in bytes
    pub fn size(&self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Int(int) => int.width.bytes(),
            Type::Pointer { .. } | Type::Function(_) => POINTER_WIDTH.bytes(),
            Type::Array { elem, len, .. } => elem.size() * len.unwrap_or(0),
        }
    }

    /// Register width of a value of this type, if it fits in a register
    pub fn width(&self) -> Option<Width> {
        match self {
            Type::Int(int) => Some(int.width),
            Type::Pointer { .. } | Type::Function(_) => Some(POINTER_WIDTH),
            Type::Void | Type::Array { .. } => None,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(self, Type::Int(IntType { signed: true, .. }))
    }

    pub fn is_const(&self) -> bool {
        match self {
            Type::Int(int) => int.constant,
            Type::Pointer { constant, .. } | Type::Array { constant, .. } => *constant,
            Type::Void | Type::Function(_) => false,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    /// Pointers and arrays both behave as addresses in arithmetic
    pub fn is_pointer_like(&self) -> bool {
        matches!(self, Type::Pointer { .. } | Type::Array { .. })
    }

    /// Type reached by dereferencing or indexing a value of this type
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer { to, .. } => Some(to),
            Type::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    /// Type of the value reached by dereferencing or indexing. Elements of a
    /// const array are const.
    pub fn element(&self) -> Option<Type> {
        match self {
            Type::Pointer { to, .. } => Some((**to).clone()),
            Type::Array { elem, constant, .. } if *constant => Some(elem.as_const()),
            Type::Array { elem, .. } => Some((**elem).clone()),
            _ => None,
        }
    }

    /// Arrays decay to a pointer to their first element
    pub fn decayed(&self) -> Type {
        match self {
            Type::Array { .. } => Type::pointer(self.element().unwrap_or(Type::Void)),
            other => other.clone(),
        }
    }

    /// Whether a value of this type may be used where `target` is expected
    /// without an explicit cast.
    pub fn implicitly_casts_to(&self, target: &Type) -> bool {
        if self.same_shape(target) {
            return true;
        }
        match (self, target) {
            (Type::Int(_), Type::Int(_)) => true,
            (Type::Pointer { to: a, .. }, Type::Pointer { to: b, .. }) => {
                **a == Type::Void || **b == Type::Void || a.same_shape(b)
            }
            (Type::Array { elem, .. }, Type::Array { elem: other, .. })
            | (Type::Array { elem, .. }, Type::Pointer { to: other, .. }) => {
                elem.implicitly_casts_to(other)
            }
            _ => false,
        }
    }

    /// Whether an explicit cast from this type to `target` is allowed
    pub fn casts_to(&self, target: &Type) -> bool {
        if self.implicitly_casts_to(target) {
            return true;
        }
        matches!(
            (self, target),
            (Type::Int(_), Type::Pointer { .. })
                | (Type::Pointer { .. }, Type::Int(_))
                | (Type::Pointer { .. }, Type::Pointer { .. })
                | (Type::Function(_), Type::Pointer { .. })
                | (Type::Pointer { .. }, Type::Function(_))
        )
    }

    /// Equality ignoring const flags
    pub fn same_shape(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Void, Type::Void) => true,
            (Type::Int(a), Type::Int(b)) => a.signed == b.signed && a.width == b.width,
            (Type::Pointer { to: a, .. }, Type::Pointer { to: b, .. }) => a.same_shape(b),
            (
                Type::Array {
                    elem: a, len: la, ..
                },
                Type::Array {
                    elem: b, len: lb, ..
                },
            ) => la == lb && a.same_shape(b),
            (Type::Function(a), Type::Function(b)) => **a == **b,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "()"),
            Type::Int(int) => {
                let prefix = if int.constant { "|" } else { "" };
                let sign = if int.signed { 's' } else { 'u' };
                write!(f, "{}{}{}", prefix, sign, int.width)
            }
            Type::Pointer { to, constant } => {
                write!(f, "{}*{}", if *constant { "|" } else { "" }, to)
            }
            Type::Array {
                elem,
                len,
                constant,
            } => {
                write!(f, "{}[{}", if *constant { "|" } else { "" }, elem)?;
                if let Some(len) = len {
                    write!(f, "@{}", len)?;
                }
                write!(f, "]")
            }
            Type::Function(func) => {
                write!(f, "(")?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                if func.varargs {
                    write!(f, "{}...", if func.params.is_empty() { "" } else { ", " })?;
                }
                write!(f, ") -> {}", func.returns)
            }
        }
    }
}
