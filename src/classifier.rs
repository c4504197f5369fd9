//! Maps discovered sub-image offsets to left/right eyes.
//!
//! | offsets | layout                             | left         | right        |
//! |---------|------------------------------------|--------------|--------------|
//! | 2       | left, right                        | `offsets[0]` | `offsets[1]` |
//! | 4       | left-hi, left-lo, right-hi, right-lo | `offsets[0]` | `offsets[2]` |
//!
//! Every other count is rejected.

use std::fmt;

use serde::Serialize;

use crate::error::ClassifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl fmt::Display for Eye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StereoAssignment {
    pub left: u64,
    pub right: u64,
}

impl StereoAssignment {
    #[must_use]
    pub const fn offset(&self, eye: Eye) -> u64 {
        match eye {
            Eye::Left => self.left,
            Eye::Right => self.right,
        }
    }
}

pub fn classify(offsets: &[u64]) -> Result<StereoAssignment, ClassifyError> {
    match *offsets {
        [left, right] => Ok(StereoAssignment { left, right }),
        [left_hi, _, right_hi, _] => Ok(StereoAssignment {
            left: left_hi,
            right: right_hi,
        }),
        _ => Err(ClassifyError::UnsupportedSubImageCount {
            count: offsets.len(),
        }),
    }
}
