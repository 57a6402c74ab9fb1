use std::fmt;

use serde::{Deserialize, Serialize};

/// Retinal OCT classes, in the index order every backend scores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OctLabel {
    Cnv,
    Dme,
    Drusen,
    Normal,
}

impl OctLabel {
    pub const ALL: [OctLabel; 4] = [
        OctLabel::Cnv,
        OctLabel::Dme,
        OctLabel::Drusen,
        OctLabel::Normal,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        match self {
            OctLabel::Cnv => 0,
            OctLabel::Dme => 1,
            OctLabel::Drusen => 2,
            OctLabel::Normal => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OctLabel::Cnv => "CNV",
            OctLabel::Dme => "DME",
            OctLabel::Drusen => "DRUSEN",
            OctLabel::Normal => "NORMAL",
        }
    }
}

impl fmt::Display for OctLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
