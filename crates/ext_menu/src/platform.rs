//! Platform menu primitives.
//!
//! The OS menu API is reached only through [`MenuPlatform`]. Handles cross
//! threads as plain integers; [`MenuHandle`] owns one and destroys it on drop
//! unless ownership is handed to a parent menu with [`MenuHandle::release`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{trace, warn};

// ============================================================================
// Handles
// ============================================================================

/// Opaque platform menu handle (`HMENU`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawMenu(pub isize);

/// Window that receives popup tracking messages (`HWND`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageTarget(pub isize);

/// How an item is addressed inside a menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRef {
    /// By command identifier, searching submenus too
    Id(u32),
    /// By zero-based position in this menu
    Position(u32),
}

impl ItemRef {
    pub fn item(self) -> u32 {
        match self {
            ItemRef::Id(id) => id,
            ItemRef::Position(index) => index,
        }
    }

    pub fn by_position(self) -> bool {
        matches!(self, ItemRef::Position(_))
    }
}

// ============================================================================
// Item Info
// ============================================================================

pub const MIIM_STATE: u32 = 0x0001;
pub const MIIM_ID: u32 = 0x0002;
pub const MIIM_SUBMENU: u32 = 0x0004;
pub const MIIM_STRING: u32 = 0x0040;
pub const MIIM_FTYPE: u32 = 0x0100;

pub const TPM_RIGHTALIGN: u32 = 0x0008;
pub const TPM_NONOTIFY: u32 = 0x0080;
pub const TPM_RETURNCMD: u32 = 0x0100;

/// Platform-neutral view of `MENUITEMINFOW`.
///
/// `mask` selects which fields a get/set call reads or writes. After a text
/// query `cch` holds the label length in UTF-16 units, terminator excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemInfo {
    pub mask: u32,
    pub item_type: u32,
    pub state: u32,
    pub id: u32,
    pub submenu: Option<RawMenu>,
    pub cch: u32,
}

// ============================================================================
// Errors
// ============================================================================

/// A platform call that reported failure, with its OS error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{function} failed with OS error {code}")]
pub struct PlatformError {
    pub function: &'static str,
    pub code: u32,
}

impl PlatformError {
    pub fn new(function: &'static str, code: u32) -> Self {
        Self { function, code }
    }
}

// ============================================================================
// Platform Trait
// ============================================================================

/// OS menu primitives. Every call is attempted exactly once by callers.
pub trait MenuPlatform: Send + Sync {
    /// Materialize a menu from an extended template (`LoadMenuIndirectW`)
    fn load_menu_indirect(&self, template: &[u8]) -> Result<RawMenu, PlatformError>;

    /// Submenu attached at `position` (`GetSubMenu`)
    fn get_sub_menu(&self, menu: RawMenu, position: i32) -> Result<RawMenu, PlatformError>;

    /// Detach the item at `position` without destroying its submenu (`RemoveMenu`)
    fn remove_menu(&self, menu: RawMenu, position: u32) -> Result<(), PlatformError>;

    /// Destroy a menu and every submenu it owns (`DestroyMenu`)
    fn destroy_menu(&self, menu: RawMenu) -> Result<(), PlatformError>;

    /// Query an item (`GetMenuItemInfoW`).
    ///
    /// With `MIIM_STRING` in the mask and no `text` buffer, only `cch` is
    /// meaningful afterwards and the call may report failure.
    fn get_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &mut ItemInfo,
        text: Option<&mut [u16]>,
    ) -> Result<(), PlatformError>;

    /// Update an item (`SetMenuItemInfoW`). `text` is NUL-terminated.
    fn set_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &ItemInfo,
        text: Option<&[u16]>,
    ) -> Result<(), PlatformError>;

    /// Whether popups drop right-aligned (`SM_MENUDROPALIGNMENT`)
    fn menu_drop_alignment(&self) -> bool;

    /// Show a popup and wait for the user (`TrackPopupMenuEx` with
    /// `TPM_RETURNCMD`). Zero means "no selection or failure"; the caller
    /// must read [`MenuPlatform::last_error`] right after.
    ///
    /// Must run on the thread that owns `target`.
    fn track_popup(
        &self,
        menu: RawMenu,
        flags: u32,
        x: i32,
        y: i32,
        target: MessageTarget,
    ) -> u32;

    /// Calling thread's last error code (`GetLastError`)
    fn last_error(&self) -> u32;
}

/// The platform implementation for this OS, if there is one.
pub fn default_platform() -> Option<Arc<dyn MenuPlatform>> {
    #[cfg(target_os = "windows")]
    {
        Some(Arc::new(crate::os_windows::Win32Menus))
    }

    #[cfg(not(target_os = "windows"))]
    {
        None
    }
}

// ============================================================================
// Owned Handle
// ============================================================================

/// Owning wrapper around a [`RawMenu`]
pub struct MenuHandle {
    raw: RawMenu,
    owner: Option<Arc<dyn MenuPlatform>>,
}

impl MenuHandle {
    /// Take ownership of `raw`; it is destroyed when the handle drops.
    pub fn from_raw(platform: Arc<dyn MenuPlatform>, raw: RawMenu) -> Self {
        Self {
            raw,
            owner: Some(platform),
        }
    }

    pub fn raw(&self) -> RawMenu {
        self.raw
    }

    /// Give up ownership, e.g. once the menu is attached to a parent item.
    ///
    /// The returned handle is no longer destroyed by this wrapper.
    #[must_use = "the released menu must now be owned by something else"]
    pub fn release(mut self) -> RawMenu {
        self.owner = None;
        trace!(menu = self.raw.0, "menu ownership released");
        self.raw
    }
}

impl Drop for MenuHandle {
    fn drop(&mut self) {
        if let Some(platform) = self.owner.take() {
            if let Err(e) = platform.destroy_menu(self.raw) {
                warn!(menu = self.raw.0, error = %e, "Failed to destroy menu");
            }
        }
    }
}

impl fmt::Debug for MenuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MenuHandle")
            .field("raw", &self.raw)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
