//! Parcellation scales and artifact naming.

use serde::{Deserialize, Serialize};

/// Number of scales in the Lausanne 2018 scheme.
pub const SCALE_COUNT: u8 = 5;

/// Default atlas prefix used in annotation and output names.
pub const DEFAULT_ATLAS: &str = "lausanne2018";

/// All scales, in execution order.
pub const ALL_SCALES: [ScaleDefinition; SCALE_COUNT as usize] = [
    ScaleDefinition { index: 1 },
    ScaleDefinition { index: 2 },
    ScaleDefinition { index: 3 },
    ScaleDefinition { index: 4 },
    ScaleDefinition { index: 5 },
];

/// One granularity of the parcellation.
///
/// Serialized as its bare index; deserialization goes through
/// [`ScaleDefinition::new`] so out-of-range indices are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ScaleDefinition {
    index: u8,
}

impl ScaleDefinition {
    /// Returns the scale with the given 1-based index, if it exists.
    pub fn new(index: u8) -> Option<Self> {
        (1..=SCALE_COUNT).contains(&index).then_some(Self { index })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Annotation name fragment, e.g. `lausanne2018.scale3`.
    pub fn annotation(&self, atlas: &str) -> String {
        format!("{}.scale{}", atlas, self.index)
    }

    /// Annotation file name for one hemisphere.
    pub fn annot_file(&self, atlas: &str, hemi: Hemisphere) -> String {
        format!("{}.{}.annot", hemi, self.annotation(atlas))
    }

    /// Statistics file name for one hemisphere.
    pub fn stats_file(&self, atlas: &str, hemi: Hemisphere) -> String {
        format!("{}.{}.stats", hemi, self.annotation(atlas))
    }

    /// Volumetric segmentation in the toolkit's native format.
    pub fn volume_file(&self, atlas: &str) -> String {
        format!("{}.mgz", self.annotation(atlas))
    }

    /// Volumetric segmentation in the portable compressed format.
    pub fn nifti_file(&self, atlas: &str) -> String {
        format!("{}.nii.gz", self.annotation(atlas))
    }
}

impl TryFrom<u8> for ScaleDefinition {
    type Error = String;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index).ok_or_else(|| format!("scale index {} is outside 1..={}", index, SCALE_COUNT))
    }
}

impl From<ScaleDefinition> for u8 {
    fn from(scale: ScaleDefinition) -> Self {
        scale.index
    }
}

impl std::fmt::Display for ScaleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scale {}", self.index)
    }
}

/// Cortical hemisphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    Lh,
    Rh,
}

impl Hemisphere {
    pub const BOTH: [Hemisphere; 2] = [Hemisphere::Lh, Hemisphere::Rh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hemisphere::Lh => "lh",
            Hemisphere::Rh => "rh",
        }
    }
}

impl std::fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
