//! Menu configuration, read from the `[menu]` table of the app manifest.
//!
//! ```toml
//! [menu]
//! thread_name = "app-menu-loop"
//! drop_alignment = "right"
//! ```

use serde::{Deserialize, Serialize};

use crate::platform::TPM_RIGHTALIGN;

/// Horizontal anchoring of popups relative to the requested point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PopupAlign {
    /// Follow the system's menu drop alignment
    #[default]
    System,
    Left,
    Right,
}

impl PopupAlign {
    /// Extra popup flags for this alignment; `system_right` is the current
    /// system setting.
    pub fn flags(self, system_right: bool) -> u32 {
        let right = match self {
            PopupAlign::System => system_right,
            PopupAlign::Left => false,
            PopupAlign::Right => true,
        };
        if right {
            TPM_RIGHTALIGN
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MenuConfig {
    /// Name of the popup loop thread
    pub thread_name: String,
    pub drop_alignment: PopupAlign,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            thread_name: "forge-menu-loop".to_string(),
            drop_alignment: PopupAlign::System,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ManifestMenuSection {
    #[serde(default)]
    menu: Option<MenuConfig>,
}

impl MenuConfig {
    /// Read the `[menu]` table of a manifest; a missing table yields defaults.
    pub fn from_manifest(manifest: &str) -> Result<Self, toml::de::Error> {
        let section: ManifestMenuSection = toml::from_str(manifest)?;
        Ok(section.menu.unwrap_or_default())
    }
}
