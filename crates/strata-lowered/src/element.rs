use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types understood by the lowered IR.
///
/// Interpreter values are carried as `f32`; conversions apply the numeric
/// effect of the target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    I32,
    I8,
    U8,
}

impl ElementType {
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::I8 | ElementType::U8 => 1,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ElementType::F32)
    }

    /// Convert with wrap-around on overflow (fractional part truncated toward zero).
    pub fn truncate(self, value: f32) -> f32 {
        let whole = value.trunc() as i64;
        match self {
            ElementType::F32 => value,
            ElementType::I32 => whole as i32 as f32,
            ElementType::I8 => whole as i8 as f32,
            ElementType::U8 => whole as u8 as f32,
        }
    }

    /// Convert with clamping to the target range.
    pub fn saturate(self, value: f32) -> f32 {
        let whole = value.trunc();
        match self {
            ElementType::F32 => value,
            ElementType::I32 => (whole as f64).clamp(i32::MIN as f64, i32::MAX as f64) as i32 as f32,
            ElementType::I8 => whole.clamp(i8::MIN as f32, i8::MAX as f32),
            ElementType::U8 => whole.clamp(u8::MIN as f32, u8::MAX as f32),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F32 => "f32",
            ElementType::I32 => "i32",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
        };
        f.write_str(name)
    }
}
