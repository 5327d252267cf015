// ── Capability table ──
//
// Static model-to-feature lookup. The LAN protocol gives no way to ask
// a device what it supports, so the table is keyed by the SKU reported
// in its announcement. Unknown models degrade to the standard profile.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use tracing::warn;

/// Feature bitmask for a light model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightFeatures(u8);

impl LightFeatures {
    pub const NONE: Self = Self(0);
    pub const BRIGHTNESS: Self = Self(1);
    pub const COLOR_RGB: Self = Self(1 << 1);
    pub const COLOR_KELVIN_TEMPERATURE: Self = Self(1 << 2);
    pub const SCENES: Self = Self(1 << 3);
    pub const SEGMENT_CONTROL: Self = Self(1 << 4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for LightFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for LightFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::BRIGHTNESS, "brightness"),
            (Self::COLOR_RGB, "rgb"),
            (Self::COLOR_KELVIN_TEMPERATURE, "temperature"),
            (Self::SCENES, "scenes"),
            (Self::SEGMENT_CONTROL, "segments"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Everything a model is known to support: a feature bitmask, the named
/// scene codes it understands, and its ordered segment codes.
///
/// Scene and segment codes are opaque firmware blobs carried verbatim
/// inside `ptReal` commands; nothing here interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightCapabilities {
    pub features: LightFeatures,
    pub scenes: HashMap<String, Vec<u8>>,
    pub segments: Vec<Vec<u8>>,
}

impl LightCapabilities {
    /// Brightness + RGB + temperature, no scenes or segments. The
    /// fallback profile for models not in the table.
    pub fn standard() -> Self {
        Self {
            features: LightFeatures::BRIGHTNESS
                | LightFeatures::COLOR_RGB
                | LightFeatures::COLOR_KELVIN_TEMPERATURE,
            ..Self::default()
        }
    }

    fn rgb_only() -> Self {
        Self {
            features: LightFeatures::BRIGHTNESS | LightFeatures::COLOR_RGB,
            ..Self::default()
        }
    }

    /// Look up the opaque code for a named scene, case-insensitively.
    pub fn scene_code(&self, scene: &str) -> Option<&[u8]> {
        self.scenes.get(&scene.to_lowercase()).map(Vec::as_slice)
    }
}

fn segmented_strip() -> LightCapabilities {
    let scenes = [
        ("sunrise", vec![0x33, 0x05, 0x04, 0x00]),
        ("sunset", vec![0x33, 0x05, 0x04, 0x01]),
        ("movie", vec![0x33, 0x05, 0x04, 0x04]),
        ("rainbow", vec![0x33, 0x05, 0x04, 0x16]),
        ("aurora", vec![0x33, 0x05, 0x04, 0x09]),
    ]
    .into_iter()
    .map(|(name, code)| (name.to_owned(), code))
    .collect();

    // 15 addressable segments, one wire code each.
    let segments = (0u8..15).map(|i| vec![0x33, 0x05, 0x15, 0x01, i]).collect();

    LightCapabilities {
        features: LightFeatures::BRIGHTNESS
            | LightFeatures::COLOR_RGB
            | LightFeatures::COLOR_KELVIN_TEMPERATURE
            | LightFeatures::SCENES
            | LightFeatures::SEGMENT_CONTROL,
        scenes,
        segments,
    }
}

/// Resolve the capabilities for a model SKU.
///
/// Never fails: unknown models get the standard profile and a warning
/// so they can be reported and added to the table.
pub fn capabilities_for(model: &str) -> LightCapabilities {
    match model {
        // RGB-only strips
        "H6160" | "H6199" => LightCapabilities::rgb_only(),
        // Strips, bulbs, and lamps with temperature support
        "H6104" | "H6163" | "H6198" | "H7022" => LightCapabilities::standard(),
        // Segment-addressable strips with scene support
        "H619A" | "H619C" | "H61A0" => segmented_strip(),
        _ => {
            warn!(model, "unknown model, using standard capabilities");
            LightCapabilities::standard()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn feature_bits_compose() {
        let features = LightFeatures::BRIGHTNESS | LightFeatures::SCENES;
        assert!(features.contains(LightFeatures::BRIGHTNESS));
        assert!(features.contains(LightFeatures::SCENES));
        assert!(!features.contains(LightFeatures::COLOR_RGB));
        assert!(features.contains(LightFeatures::NONE));
    }

    #[test]
    fn known_rgb_only_model() {
        let caps = capabilities_for("H6160");
        assert!(caps.features.contains(LightFeatures::BRIGHTNESS));
        assert!(caps.features.contains(LightFeatures::COLOR_RGB));
        assert!(!caps.features.contains(LightFeatures::COLOR_KELVIN_TEMPERATURE));
        assert!(caps.scenes.is_empty());
        assert!(caps.segments.is_empty());
    }

    #[test]
    fn unknown_model_gets_standard_profile() {
        let caps = capabilities_for("H9999");
        assert_eq!(caps, LightCapabilities::standard());
    }

    #[test]
    fn segmented_model_has_scenes_and_segments() {
        let caps = capabilities_for("H619A");
        assert!(caps.features.contains(LightFeatures::SEGMENT_CONTROL));
        assert!(caps.features.contains(LightFeatures::SCENES));
        assert_eq!(caps.segments.len(), 15);
        assert!(caps.scene_code("Rainbow").is_some());
        assert!(caps.scene_code("nope").is_none());
    }

    #[test]
    fn features_display_is_readable() {
        assert_eq!(LightFeatures::NONE.to_string(), "none");
        let features = LightFeatures::BRIGHTNESS | LightFeatures::COLOR_RGB;
        assert_eq!(features.to_string(), "brightness+rgb");
    }
}
