//! Geometry types for terminal front-ends.

use serde::{Deserialize, Serialize};

/// Dimensions of a terminal front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl Dimensions {
    /// Create new dimensions.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Whether both axes are non-zero.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl std::str::FromStr for Dimensions {
    type Err = crate::Error;

    /// Parse `COLSxROWS`, e.g. `120x40`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid =
            || crate::Error::InvalidInput(format!("invalid dimensions '{s}', expected COLSxROWS"));
        let (cols, rows) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let dimensions = Self::new(
            cols.parse().map_err(|_| invalid())?,
            rows.parse().map_err(|_| invalid())?,
        );
        if !dimensions.is_valid() {
            return Err(invalid());
        }
        Ok(dimensions)
    }
}
