use std::fmt;

use crate::{DatabaseValue, TryFromError};

/// Storage kind of a record attribute or table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    #[default]
    String,
    Float32,
    Float64,
}

/// Coarse grouping of a column type, derived when a column type is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueClass {
    Bool,
    Number,
    String,
    Time,
    #[default]
    Invalid,
}

impl ValueKind {
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    #[must_use]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    /// Same width, unsigned.
    #[must_use]
    pub const fn to_unsigned(self) -> Self {
        match self {
            Self::Int8 => Self::UInt8,
            Self::Int16 => Self::UInt16,
            Self::Int32 => Self::UInt32,
            Self::Int64 => Self::UInt64,
            other => other,
        }
    }

    /// Same width, signed.
    #[must_use]
    pub const fn to_signed(self) -> Self {
        match self {
            Self::UInt8 => Self::Int8,
            Self::UInt16 => Self::Int16,
            Self::UInt32 => Self::Int32,
            Self::UInt64 => Self::Int64,
            other => other,
        }
    }

    #[must_use]
    pub const fn class(self) -> ValueClass {
        match self {
            Self::Bool => ValueClass::Bool,
            Self::String => ValueClass::String,
            _ => ValueClass::Number,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::String => "string",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    #[must_use]
    pub fn zero(self) -> DatabaseValue {
        match self {
            Self::Bool => DatabaseValue::Bool(false),
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => DatabaseValue::Int64(0),
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => DatabaseValue::UInt64(0),
            Self::String => DatabaseValue::String(String::new()),
            Self::Float32 => DatabaseValue::Real32(0.0),
            Self::Float64 => DatabaseValue::Real64(0.0),
        }
    }

    /// Whether `value` is the zero value of this kind. NULL counts as zero.
    #[must_use]
    pub fn is_zero(self, value: &DatabaseValue) -> bool {
        match value {
            DatabaseValue::Null => true,
            DatabaseValue::String(x) => x.is_empty(),
            DatabaseValue::Bytes(x) => x.is_empty(),
            DatabaseValue::DateTime(_) => false,
            other => match self {
                Self::Bool => other.as_bool() == Some(false),
                Self::Float32 | Self::Float64 => other.as_f64() == Some(0.0),
                Self::String => other.to_text().is_none_or(|x| x.is_empty()),
                _ => other.as_i64() == Some(0) || other.as_u64() == Some(0),
            },
        }
    }

    /// Converts `value` into the canonical representation of this kind, checking the width.
    ///
    /// # Errors
    ///
    /// * If the value cannot be represented by this kind
    pub fn convert(self, value: DatabaseValue) -> Result<DatabaseValue, TryFromError> {
        if value.is_null() {
            return Ok(DatabaseValue::Null);
        }

        Ok(match self {
            Self::Bool => DatabaseValue::Bool(bool::try_from(value)?),
            Self::Int8 => DatabaseValue::Int64(i8::try_from(value)?.into()),
            Self::Int16 => DatabaseValue::Int64(i16::try_from(value)?.into()),
            Self::Int32 => DatabaseValue::Int64(i32::try_from(value)?.into()),
            Self::Int64 => DatabaseValue::Int64(i64::try_from(value)?),
            Self::UInt8 => DatabaseValue::UInt64(u8::try_from(value)?.into()),
            Self::UInt16 => DatabaseValue::UInt64(u16::try_from(value)?.into()),
            Self::UInt32 => DatabaseValue::UInt64(u32::try_from(value)?.into()),
            Self::UInt64 => DatabaseValue::UInt64(u64::try_from(value)?),
            Self::String => DatabaseValue::String(String::try_from(value)?),
            Self::Float32 => DatabaseValue::Real32(f32::try_from(value)?),
            Self::Float64 => DatabaseValue::Real64(f64::try_from(value)?),
        })
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn promotes_between_signed_and_unsigned() {
        assert_eq!(ValueKind::Int32.to_unsigned(), ValueKind::UInt32);
        assert_eq!(ValueKind::UInt8.to_signed(), ValueKind::Int8);
        assert_eq!(ValueKind::String.to_unsigned(), ValueKind::String);
    }

    #[test_log::test]
    fn zero_values_per_kind() {
        assert!(ValueKind::Int64.is_zero(&DatabaseValue::Int64(0)));
        assert!(!ValueKind::Int64.is_zero(&DatabaseValue::Int64(42)));
        assert!(ValueKind::String.is_zero(&DatabaseValue::String(String::new())));
        assert!(ValueKind::Bool.is_zero(&DatabaseValue::Bool(false)));
        assert!(ValueKind::UInt32.is_zero(&DatabaseValue::Null));
    }

    #[test_log::test]
    fn convert_checks_width() {
        assert_eq!(
            ValueKind::UInt8.convert(DatabaseValue::String("200".into())).unwrap(),
            DatabaseValue::UInt64(200)
        );
        assert!(ValueKind::Int8.convert(DatabaseValue::Int64(200)).is_err());
        assert_eq!(
            ValueKind::Float64.convert(DatabaseValue::String("1.5".into())).unwrap(),
            DatabaseValue::Real64(1.5)
        );
        assert_eq!(
            ValueKind::Int16.convert(DatabaseValue::Null).unwrap(),
            DatabaseValue::Null
        );
    }
}
