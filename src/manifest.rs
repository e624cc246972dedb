//! The JSON manifest describing assets, layouts, color spaces and pages.
//!
//! Field names mirror the manifest file verbatim; everything the core does
//! not read is ignored by serde.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{ConvertError, ConvertResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub color_spaces: BTreeMap<String, ColorSpaceDef>,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    #[serde(default)]
    pub layouts: Vec<LayoutEntry>,
    #[serde(default)]
    pub pages: Vec<PageEntry>,
}

impl Manifest {
    pub fn from_slice(bytes: &[u8]) -> ConvertResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ConvertError::InvalidArgument(format!("invalid manifest: {e}")))
    }

    /// Position of a named asset; assets are 1-to-1 with source PDF pages.
    pub fn asset_index(&self, name: &str) -> Option<usize> {
        self.assets.iter().position(|a| a.asset == name)
    }

    pub fn layout(&self, name: &str) -> Option<&LayoutEntry> {
        self.layouts.iter().find(|l| l.layout == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub color_management: ColorManagement,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorManagement {
    #[serde(rename = "defaultSourceProfileForDeviceGray")]
    pub default_source_profile_for_device_gray: Option<String>,
    #[serde(rename = "defaultSourceProfileForDeviceRGB")]
    pub default_source_profile_for_device_rgb: Option<String>,
    #[serde(rename = "defaultSourceProfileForDeviceCMYK")]
    pub default_source_profile_for_device_cmyk: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpaceKind {
    #[serde(rename = "RGB")]
    Rgb,
    Gray,
    Lab,
    #[serde(rename = "CMYK")]
    Cmyk,
    DeviceN,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorSpaceDef {
    #[serde(rename = "type")]
    pub kind: ColorSpaceKind,
    /// Relative profile path, the literal `"Lab"`, or absent for
    /// passthrough spaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    pub asset: String,
    pub color_space: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEntry {
    pub layout: String,
    pub color_space: String,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    pub layout: String,
    pub color_space: String,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub value: f64,
    pub unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "settings": {
            "colorManagement": {
                "defaultSourceProfileForDeviceRGB": "sRGB",
                "defaultSourceProfileForDeviceGray": "sGray"
            }
        },
        "colorSpaces": {
            "sRGB": { "type": "RGB", "profile": "profiles/sRGB.icc" },
            "sGray": { "type": "Gray", "profile": "profiles/sGray.icc" },
            "CIELAB": { "type": "Lab", "profile": "Lab" },
            "SpotGold": { "type": "DeviceN" }
        },
        "assets": [
            { "asset": "ramp", "colorSpace": "sRGB" },
            { "asset": "slur", "colorSpace": "sGray" }
        ],
        "layouts": [
            {
                "layout": "L0",
                "colorSpace": "sRGB",
                "assets": [
                    { "asset": "ramp", "colorSpace": "sRGB" },
                    { "asset": "slur", "colorSpace": "sGray" }
                ]
            }
        ],
        "pages": [
            {
                "layout": "L0",
                "colorSpace": "sRGB",
                "metadata": { "title": "Ramp", "resolution": { "value": 300, "unit": "dpi" } }
            }
        ]
    }"#;

    #[test]
    fn parses_the_documented_shape() {
        let manifest = Manifest::from_slice(SAMPLE.as_bytes()).unwrap();
        assert_eq!(manifest.assets.len(), 2);
        assert_eq!(manifest.asset_index("slur"), Some(1));
        assert_eq!(
            manifest
                .settings
                .color_management
                .default_source_profile_for_device_rgb
                .as_deref(),
            Some("sRGB")
        );
        let layout = manifest.layout("L0").unwrap();
        assert_eq!(layout.assets.len(), 2);
        assert_eq!(manifest.color_spaces["CIELAB"].profile.as_deref(), Some("Lab"));
        assert_eq!(manifest.color_spaces["SpotGold"].profile, None);
        assert_eq!(manifest.color_spaces["SpotGold"].kind, ColorSpaceKind::DeviceN);
        let page = &manifest.pages[0];
        assert_eq!(page.metadata.resolution.as_ref().unwrap().value, 300.0);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Manifest::from_slice(b"{ nope"),
            Err(ConvertError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let manifest = Manifest::from_slice(b"{}").unwrap();
        assert!(manifest.assets.is_empty());
        assert!(manifest.layouts.is_empty());
        assert!(manifest.color_spaces.is_empty());
    }
}
