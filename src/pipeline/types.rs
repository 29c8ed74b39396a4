use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

pub const MAX_VARIANTS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Portrait4x5,
    #[serde(rename = "3:4")]
    Portrait3x4,
    #[serde(rename = "16:9")]
    Landscape16x9,
    #[serde(rename = "9:16")]
    Portrait9x16,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait4x5,
        AspectRatio::Portrait3x4,
        AspectRatio::Landscape16x9,
        AspectRatio::Portrait9x16,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait4x5 => "4:5",
            AspectRatio::Portrait3x4 => "3:4",
            AspectRatio::Landscape16x9 => "16:9",
            AspectRatio::Portrait9x16 => "9:16",
        }
    }

    /// Width divided by height.
    pub fn ratio(self) -> f64 {
        match self {
            AspectRatio::Square => 1.0,
            AspectRatio::Portrait4x5 => 4.0 / 5.0,
            AspectRatio::Portrait3x4 => 3.0 / 4.0,
            AspectRatio::Landscape16x9 => 16.0 / 9.0,
            AspectRatio::Portrait9x16 => 9.0 / 16.0,
        }
    }

    /// The generator only produces a few fixed sizes; pick the closest bucket.
    pub fn generation_size(self) -> GenerationSize {
        match self {
            AspectRatio::Square => GenerationSize::Square,
            AspectRatio::Portrait4x5 | AspectRatio::Portrait3x4 | AspectRatio::Portrait9x16 => {
                GenerationSize::Portrait
            }
            AspectRatio::Landscape16x9 => GenerationSize::Landscape,
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        AspectRatio::ALL
            .into_iter()
            .find(|aspect| aspect.label() == trimmed)
            .ok_or_else(|| format!("Unsupported aspect ratio: {trimmed}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationSize {
    Square,
    Portrait,
    Landscape,
}

impl GenerationSize {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationSize::Square => "1024x1024",
            GenerationSize::Portrait => "1024x1792",
            GenerationSize::Landscape => "1792x1024",
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            GenerationSize::Square => (1024, 1024),
            GenerationSize::Portrait => (1024, 1792),
            GenerationSize::Landscape => (1792, 1024),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    Studio,
    OnBody,
    InHand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatPlacement {
    pub scale_by_height: f64,
    pub x_shift: f64,
    pub y_shift: f64,
}

impl Default for FlatPlacement {
    fn default() -> Self {
        Self {
            scale_by_height: 0.74,
            x_shift: 0.0,
            y_shift: -0.06,
        }
    }
}

/// Anchor fractions locate the subject's center relative to the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeamlessPlacement {
    pub scale_by_height: f64,
    pub anchor_x: f64,
    pub anchor_y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompositionStrategy {
    Flat(FlatPlacement),
    Seamless(SeamlessPlacement),
}

impl PlacementMode {
    pub const ALL: [PlacementMode; 3] = [
        PlacementMode::Studio,
        PlacementMode::OnBody,
        PlacementMode::InHand,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PlacementMode::Studio => "Studio (on a backdrop)",
            PlacementMode::OnBody => "On a person (jewelry/clothing)",
            PlacementMode::InHand => "In hand (close-up)",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            PlacementMode::Studio => "studio",
            PlacementMode::OnBody => "on-body",
            PlacementMode::InHand => "in-hand",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        PlacementMode::ALL
            .into_iter()
            .find(|mode| mode.label() == trimmed || mode.short_name() == trimmed)
    }

    pub fn strategy(self) -> CompositionStrategy {
        match self {
            PlacementMode::Studio => CompositionStrategy::Flat(FlatPlacement::default()),
            PlacementMode::OnBody => CompositionStrategy::Seamless(SeamlessPlacement {
                scale_by_height: 0.26,
                anchor_x: 0.5,
                anchor_y: 0.38,
            }),
            PlacementMode::InHand => CompositionStrategy::Seamless(SeamlessPlacement {
                scale_by_height: 0.40,
                anchor_x: 0.5,
                anchor_y: 0.50,
            }),
        }
    }
}

impl fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct VariantCount(u8);

impl VariantCount {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for VariantCount {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=MAX_VARIANTS).contains(&value) {
            Ok(VariantCount(value))
        } else {
            Err(format!("Variant count must be between 1 and {MAX_VARIANTS}, got {value}"))
        }
    }
}

impl From<VariantCount> for u8 {
    fn from(value: VariantCount) -> Self {
        value.0
    }
}

impl FromStr for VariantCount {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = value
            .trim()
            .parse::<u8>()
            .map_err(|_| format!("Not a variant count: {}", value.trim()))?;
        VariantCount::try_from(parsed)
    }
}

/// Transparent subject shared by every variant of one request.
pub type CutoutImage = Arc<RgbaImage>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub source: Arc<Vec<u8>>,
    pub placement: PlacementMode,
    pub aspect: AspectRatio,
    pub variants: VariantCount,
    pub style: String,
}

#[derive(Debug, Clone)]
pub struct CompositeResult {
    /// One-based.
    pub index: u8,
    pub total: u8,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

impl CompositeResult {
    pub fn file_name(&self) -> String {
        format!("product_{}_of_{}.png", self.index, self.total)
    }
}
