//! # `ext_menu` - Native Popup Menu Extension
//!
//! Native context menus for Forge applications, built from plain item
//! descriptions and shown at a screen position.
//!
//! ## Overview
//!
//! A menu is described as a tree of items. The extension encodes the tree into
//! the platform's extended menu template, asks the OS to materialize it and
//! keeps the resulting menu under a numeric resource id. Showing a menu runs
//! on a dedicated loop thread that owns the popup's message window, so both
//! the blocking `op_menu_show_sync` and the promise-returning `op_menu_show`
//! can be called from the script thread.
//!
//! ## Ops
//!
//! Menus are addressed by the resource id returned from the create ops. Items
//! are addressed either by command id or by position.
//!
//! ```typescript
//! const { ops } = Deno.core;
//!
//! const rid = ops.op_menu_create([
//!   { id: 1, text: "Open" },
//!   { separator: true },
//!   { text: "Recent", items: [{ id: 20, text: "notes.md" }] },
//!   { id: 3, text: "Word wrap", checked: true },
//! ]);
//!
//! const picked = await ops.op_menu_show(rid, 200, 120); // 1, 20, 3 or null
//! ops.op_menu_update(rid, 3, { checked: false });
//! console.log(ops.op_menu_get_at(rid, 0)); // { id: 1, text: "Open", separator: false, ... }
//! ops.op_menu_destroy(rid);
//! ```
//!
//! | op                             | purpose                                  |
//! |--------------------------------|------------------------------------------|
//! | `op_menu_create`               | build a menu from an item tree           |
//! | `op_menu_create_from_template` | build a menu from raw template bytes     |
//! | `op_menu_show`                 | popup at a point, resolves to id or null |
//! | `op_menu_show_sync`            | same, blocking                           |
//! | `op_menu_get` / `_get_at`      | read one item by id / position           |
//! | `op_menu_update` / `_update_at`| change the fields given                  |
//! | `op_menu_destroy`              | release the resource id                  |
//! | `op_menu_info`                 | extension name and version               |
//!
//! ## Item Fields
//!
//! | field       | meaning                                     |
//! |-------------|---------------------------------------------|
//! | `id`        | command id returned when the item is picked |
//! | `text`      | label                                       |
//! | `separator` | draw a divider line                         |
//! | `disabled`  | greyed out                                  |
//! | `checked`   | check mark                                  |
//! | `items`     | submenu; must not be empty                  |
//!
//! An empty top-level list produces a single disabled "Empty" entry. Labels
//! may not contain NUL, and submenus nest at most 62 levels below the menu
//! itself.
//!
//! ## Platform Support
//!
//! - **Windows**: full support through `user32` menus.
//! - **macOS/Linux**: every menu op fails with error 6107.
//!
//! ## Errors
//!
//! Errors use codes 6100-6199 (see [`MenuErrorCode`]). OS failures carry the
//! name of the failing function and its error code.

use deno_core::{op2, Extension, OpState};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

pub mod config;
pub mod dispatcher;
pub mod menu;
pub mod platform;
pub mod template;

#[cfg(test)]
mod mock;
#[cfg(target_os = "windows")]
mod os_windows;

pub use config::{MenuConfig, PopupAlign};
pub use dispatcher::{DispatchError, LoopContext, LoopDispatcher};
pub use menu::PopupRequest;
pub use platform::{ItemRef, MenuHandle, MenuPlatform, PlatformError, RawMenu};
pub use template::TemplateError;

// ============================================================================
// Error Types (6100+ range)
// ============================================================================

/// Error codes for menu operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MenuErrorCode {
    /// Generic menu error
    Generic = 6100,
    /// Permission denied by capability system
    PermissionDenied = 6101,
    /// Item tree cannot be encoded
    InvalidItems = 6102,
    /// Raw template is malformed
    InvalidTemplate = 6103,
    /// No menu with this resource id
    MenuNotFound = 6104,
    /// An OS menu call failed
    Platform = 6105,
    /// Popup loop is not running
    DispatcherUnavailable = 6106,
    /// No native menus on this OS
    PlatformNotSupported = 6107,
    /// `[menu]` manifest section is invalid
    InvalidConfig = 6108,
}

/// Custom error type for menu operations
#[derive(Debug, thiserror::Error, deno_error::JsError)]
pub enum MenuError {
    #[error("[{code}] {message}")]
    #[class(generic)]
    Generic { code: u32, message: String },

    #[error("[{code}] Permission denied: {message}")]
    #[class(generic)]
    PermissionDenied { code: u32, message: String },

    #[error("[{code}] Invalid menu items: {message}")]
    #[class(generic)]
    InvalidItems { code: u32, message: String },

    #[error("[{code}] Invalid menu template: {message}")]
    #[class(generic)]
    InvalidTemplate { code: u32, message: String },

    #[error("[{code}] Menu not found: {rid}")]
    #[class(generic)]
    MenuNotFound { code: u32, rid: u32 },

    #[error("[{code}] {function} failed with OS error {os_error}")]
    #[class(generic)]
    Platform {
        code: u32,
        function: String,
        os_error: u32,
    },

    #[error("[{code}] Menu loop unavailable: {message}")]
    #[class(generic)]
    DispatcherUnavailable { code: u32, message: String },

    #[error("[{code}] Native menus are not supported on this platform")]
    #[class(generic)]
    PlatformNotSupported { code: u32 },

    #[error("[{code}] Invalid menu configuration: {message}")]
    #[class(generic)]
    InvalidConfig { code: u32, message: String },
}

impl MenuError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: MenuErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            code: MenuErrorCode::PermissionDenied as u32,
            message: message.into(),
        }
    }

    pub fn invalid_items(message: impl Into<String>) -> Self {
        Self::InvalidItems {
            code: MenuErrorCode::InvalidItems as u32,
            message: message.into(),
        }
    }

    pub fn invalid_template(message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            code: MenuErrorCode::InvalidTemplate as u32,
            message: message.into(),
        }
    }

    pub fn menu_not_found(rid: u32) -> Self {
        Self::MenuNotFound {
            code: MenuErrorCode::MenuNotFound as u32,
            rid,
        }
    }

    pub fn platform(function: impl Into<String>, os_error: u32) -> Self {
        Self::Platform {
            code: MenuErrorCode::Platform as u32,
            function: function.into(),
            os_error,
        }
    }

    pub fn dispatcher_unavailable(message: impl Into<String>) -> Self {
        Self::DispatcherUnavailable {
            code: MenuErrorCode::DispatcherUnavailable as u32,
            message: message.into(),
        }
    }

    pub fn platform_not_supported() -> Self {
        Self::PlatformNotSupported {
            code: MenuErrorCode::PlatformNotSupported as u32,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            code: MenuErrorCode::InvalidConfig as u32,
            message: message.into(),
        }
    }
}

impl From<TemplateError> for MenuError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::EmptySubmenu { .. }
            | TemplateError::ItemsTooDeep { .. }
            | TemplateError::NulInText { .. } => Self::invalid_items(e.to_string()),
            _ => Self::invalid_template(e.to_string()),
        }
    }
}

impl From<PlatformError> for MenuError {
    fn from(e: PlatformError) -> Self {
        Self::platform(e.function, e.code)
    }
}

impl From<DispatchError> for MenuError {
    fn from(e: DispatchError) -> Self {
        Self::dispatcher_unavailable(e.to_string())
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// One menu entry. Absent fields mean "not set" when creating and "leave
/// alone" when updating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    /// Submenu entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<MenuItem>>,
}

/// Screen position in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Serialize)]
struct ExtensionInfo {
    name: &'static str,
    version: &'static str,
    status: &'static str,
}

// ============================================================================
// State Management
// ============================================================================

/// State stored in OpState for menu operations
pub struct MenuRuntimeState {
    platform: Option<Arc<dyn MenuPlatform>>,
    config: MenuConfig,
    menus: HashMap<u32, Arc<MenuHandle>>,
    next_rid: u32,
    dispatcher: Option<Arc<LoopDispatcher>>,
}

impl MenuRuntimeState {
    pub fn new(config: MenuConfig, platform: Option<Arc<dyn MenuPlatform>>) -> Self {
        Self {
            platform,
            config,
            menus: HashMap::new(),
            next_rid: 1,
            dispatcher: None,
        }
    }

    pub fn config(&self) -> &MenuConfig {
        &self.config
    }

    /// Number of live menus
    pub fn len(&self) -> usize {
        self.menus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.menus.is_empty()
    }

    fn platform(&self) -> Result<Arc<dyn MenuPlatform>, MenuError> {
        self.platform
            .clone()
            .ok_or_else(MenuError::platform_not_supported)
    }

    fn menu(&self, rid: u32) -> Result<Arc<MenuHandle>, MenuError> {
        self.menus
            .get(&rid)
            .cloned()
            .ok_or_else(|| MenuError::menu_not_found(rid))
    }

    fn insert(&mut self, menu: MenuHandle) -> u32 {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.menus.insert(rid, Arc::new(menu));
        rid
    }

    /// The popup loop, started on first use and restarted if it died
    fn dispatcher(&mut self) -> Result<Arc<LoopDispatcher>, MenuError> {
        if let Some(dispatcher) = &self.dispatcher {
            if dispatcher.is_running() {
                return Ok(dispatcher.clone());
            }
            warn!("menu loop thread is gone, starting a new one");
            self.dispatcher = None;
        }
        let dispatcher = Arc::new(LoopDispatcher::spawn(&self.config)?);
        self.dispatcher = Some(dispatcher.clone());
        Ok(dispatcher)
    }

    fn popup(&self, rid: u32, position: Position) -> Result<PopupRequest, MenuError> {
        Ok(PopupRequest {
            menu: self.menu(rid)?,
            position,
            align: self.config.drop_alignment,
        })
    }

    pub fn create(&mut self, items: Vec<MenuItem>) -> Result<u32, MenuError> {
        let platform = self.platform()?;
        let menu = menu::create_menu(&platform, items)?;
        Ok(self.insert(menu))
    }

    pub fn create_from_template(&mut self, template: &[u8]) -> Result<u32, MenuError> {
        let platform = self.platform()?;
        let menu = menu::create_menu_from_template(&platform, template)?;
        Ok(self.insert(menu))
    }

    pub fn get(&self, rid: u32, item: ItemRef) -> Result<MenuItem, MenuError> {
        let platform = self.platform()?;
        let menu = self.menu(rid)?;
        Ok(menu::get_menu_item(platform.as_ref(), menu.raw(), item)?)
    }

    pub fn update(&self, rid: u32, item: ItemRef, options: MenuItem) -> Result<(), MenuError> {
        let platform = self.platform()?;
        let menu = self.menu(rid)?;
        menu::update_menu_item(&platform, menu.raw(), item, options)
    }

    /// Forget a menu. It is destroyed once no popup is still using it.
    pub fn destroy(&mut self, rid: u32) -> bool {
        self.menus.remove(&rid).is_some()
    }

    pub fn show_sync(&mut self, rid: u32, position: Position) -> Result<Option<i32>, MenuError> {
        let platform = self.platform()?;
        let request = self.popup(rid, position)?;
        let dispatcher = self.dispatcher()?;
        let result = menu::show_sync(&dispatcher, platform, request);
        if matches!(result, Err(MenuError::DispatcherUnavailable { .. })) {
            // Start over on the next show
            self.dispatcher = None;
        }
        result
    }

    /// Queue a popup. The future does not borrow this state.
    pub fn show(
        &mut self,
        rid: u32,
        position: Position,
    ) -> Result<impl Future<Output = Result<Option<i32>, MenuError>> + Send + 'static, MenuError>
    {
        let platform = self.platform()?;
        let request = self.popup(rid, position)?;
        let dispatcher = self.dispatcher()?;
        Ok(menu::show(&dispatcher, platform, request))
    }
}

// ============================================================================
// Capability Checker
// ============================================================================

/// Capability checker trait for menu operations
pub trait MenuCapabilityChecker: Send + Sync {
    fn check_menus(&self) -> Result<(), String>;
}

/// Default permissive checker (for dev mode)
pub struct PermissiveMenuChecker;

impl MenuCapabilityChecker for PermissiveMenuChecker {
    fn check_menus(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Wrapper to store the capability checker in OpState
pub struct MenuCapabilities {
    pub checker: Arc<dyn MenuCapabilityChecker>,
}

impl Default for MenuCapabilities {
    fn default() -> Self {
        Self {
            checker: Arc::new(PermissiveMenuChecker),
        }
    }
}

impl MenuCapabilities {
    fn check(&self) -> Result<(), MenuError> {
        self.checker
            .check_menus()
            .map_err(MenuError::permission_denied)
    }
}

fn check_menu_capability(state: &OpState) -> Result<(), MenuError> {
    match state.try_borrow::<MenuCapabilities>() {
        Some(caps) => caps.check(),
        None => Ok(()),
    }
}

fn menu_state(state: &mut OpState) -> Result<&mut MenuRuntimeState, MenuError> {
    check_menu_capability(state)?;
    state
        .try_borrow_mut::<MenuRuntimeState>()
        .ok_or_else(|| MenuError::generic("menu state not initialized"))
}

// ============================================================================
// Menu Ops
// ============================================================================

#[op2]
#[serde]
fn op_menu_info() -> ExtensionInfo {
    ExtensionInfo {
        name: "ext_menu",
        version: env!("CARGO_PKG_VERSION"),
        status: if cfg!(target_os = "windows") {
            "active"
        } else {
            "unsupported"
        },
    }
}

/// Create a menu from an item tree, returning its resource id
#[op2]
#[smi]
fn op_menu_create(
    state: &mut OpState,
    #[serde] items: Vec<MenuItem>,
) -> Result<u32, MenuError> {
    debug!(items = items.len(), "menu.create");
    menu_state(state)?.create(items)
}

/// Create a menu from raw extended-template bytes
#[op2(fast)]
#[smi]
fn op_menu_create_from_template(
    state: &mut OpState,
    #[buffer] template: &[u8],
) -> Result<u32, MenuError> {
    debug!(bytes = template.len(), "menu.create_from_template");
    menu_state(state)?.create_from_template(template)
}

/// Show a menu; resolves to the picked id or null
#[op2(async)]
async fn op_menu_show(
    state: Rc<RefCell<OpState>>,
    #[smi] rid: u32,
    #[smi] x: i32,
    #[smi] y: i32,
) -> Result<Option<i32>, MenuError> {
    let pending = {
        let mut s = state.borrow_mut();
        menu_state(&mut s)?.show(rid, Position { x, y })?
    };
    pending.await
}

/// Show a menu and block until it closes
#[op2]
fn op_menu_show_sync(
    state: &mut OpState,
    #[smi] rid: u32,
    #[smi] x: i32,
    #[smi] y: i32,
) -> Result<Option<i32>, MenuError> {
    menu_state(state)?.show_sync(rid, Position { x, y })
}

#[op2]
#[serde]
fn op_menu_get(
    state: &mut OpState,
    #[smi] rid: u32,
    #[smi] id: u32,
) -> Result<MenuItem, MenuError> {
    menu_state(state)?.get(rid, ItemRef::Id(id))
}

#[op2]
#[serde]
fn op_menu_get_at(
    state: &mut OpState,
    #[smi] rid: u32,
    #[smi] index: u32,
) -> Result<MenuItem, MenuError> {
    menu_state(state)?.get(rid, ItemRef::Position(index))
}

#[op2]
fn op_menu_update(
    state: &mut OpState,
    #[smi] rid: u32,
    #[smi] id: u32,
    #[serde] options: MenuItem,
) -> Result<(), MenuError> {
    debug!(rid, id, "menu.update");
    menu_state(state)?.update(rid, ItemRef::Id(id), options)
}

#[op2]
fn op_menu_update_at(
    state: &mut OpState,
    #[smi] rid: u32,
    #[smi] index: u32,
    #[serde] options: MenuItem,
) -> Result<(), MenuError> {
    debug!(rid, index, "menu.update_at");
    menu_state(state)?.update(rid, ItemRef::Position(index), options)
}

/// Release a menu; returns false if the id was unknown
#[op2(fast)]
fn op_menu_destroy(state: &mut OpState, #[smi] rid: u32) -> Result<bool, MenuError> {
    debug!(rid, "menu.destroy");
    Ok(menu_state(state)?.destroy(rid))
}

// ============================================================================
// Extension Registration
// ============================================================================

deno_core::extension!(
    ext_menu,
    ops = [
        op_menu_info,
        op_menu_create,
        op_menu_create_from_template,
        op_menu_show,
        op_menu_show_sync,
        op_menu_get,
        op_menu_get_at,
        op_menu_update,
        op_menu_update_at,
        op_menu_destroy
    ]
);

/// Build the menu extension
pub fn menu_extension() -> Extension {
    ext_menu::init()
}

/// Initialize menu state in OpState with this OS's menu implementation
pub fn init_menu_state(op_state: &mut OpState, config: MenuConfig) {
    init_menu_state_with_platform(op_state, config, platform::default_platform());
}

/// Initialize menu state with an explicit platform (`None` disables menus)
pub fn init_menu_state_with_platform(
    op_state: &mut OpState,
    config: MenuConfig,
    platform: Option<Arc<dyn MenuPlatform>>,
) {
    debug!(thread = %config.thread_name, "menu state initialized");
    op_state.put(MenuRuntimeState::new(config, platform));
}

/// Initialize menu state from the `[menu]` table of an app manifest
pub fn init_menu_state_from_manifest(
    op_state: &mut OpState,
    manifest: &str,
) -> Result<(), MenuError> {
    let config =
        MenuConfig::from_manifest(manifest).map_err(|e| MenuError::invalid_config(e.to_string()))?;
    init_menu_state(op_state, config);
    Ok(())
}

/// Initialize menu capabilities in OpState
pub fn init_menu_capabilities(
    op_state: &mut OpState,
    capabilities: Option<Arc<dyn MenuCapabilityChecker>>,
) {
    if let Some(caps) = capabilities {
        op_state.put(MenuCapabilities { checker: caps });
    }
}

// ============================================================================
// Tests
// ============================================================================
