//! Stable identifiers for program entities.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of an expression, unique within one program.
    ExprId,
    "e"
);
define_id!(
    /// Identity of a loop; each loop has exactly one begin/end marker pair.
    LoopId,
    "L"
);
define_id!(
    /// Identity of a declared buffer.
    BufferId,
    "buf"
);
define_id!(
    /// Logical tensor carried by an output port.
    TensorId,
    "t"
);
