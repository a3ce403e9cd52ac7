// src/database/types.rs
use std::fmt;

use crate::models::{ChannelKind, TypedValue};

/// One of the per-type raw data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedTable {
    Int,
    Float,
}

impl TypedTable {
    pub fn for_kind(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Int => TypedTable::Int,
            ChannelKind::Float => TypedTable::Float,
        }
    }

    pub fn for_value(value: &TypedValue) -> Self {
        Self::for_kind(value.kind())
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypedTable::Int => "lake_raw_data_int",
            TypedTable::Float => "lake_raw_data_float",
        }
    }
}

impl fmt::Display for TypedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_follows_value_kind() {
        assert_eq!(
            TypedTable::for_value(&TypedValue::Int(42)).name(),
            "lake_raw_data_int"
        );
        assert_eq!(
            TypedTable::for_value(&TypedValue::Float(3.14)).name(),
            "lake_raw_data_float"
        );
    }
}
