//! Menu operations on top of [`MenuPlatform`]: creation, single-item
//! query/update and popups.

use std::future::Future;
use std::iter;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::PopupAlign;
use crate::dispatcher::{LoopContext, LoopDispatcher};
use crate::platform::{
    ItemInfo, ItemRef, MenuHandle, MenuPlatform, PlatformError, RawMenu, MIIM_FTYPE, MIIM_ID,
    MIIM_STATE, MIIM_STRING, MIIM_SUBMENU, TPM_NONOTIFY, TPM_RETURNCMD,
};
use crate::template::{
    build_template, parse_template, validate_items, validate_text, MFS_CHECKED, MFS_DISABLED, MFT_BITMAP,
    MFT_OWNERDRAW, MFT_SEPARATOR,
};
use crate::{MenuError, MenuItem, Position};

// ============================================================================
// Creation
// ============================================================================

/// Materialize a template whose first item wraps the real menu, and return
/// that submenu detached from the wrapper.
pub fn load_menu_indirect(
    platform: &Arc<dyn MenuPlatform>,
    template: &[u8],
) -> Result<MenuHandle, PlatformError> {
    let wrapper = MenuHandle::from_raw(platform.clone(), platform.load_menu_indirect(template)?);
    let submenu = platform.get_sub_menu(wrapper.raw(), 0)?;
    platform.remove_menu(wrapper.raw(), 0)?;
    let menu = MenuHandle::from_raw(platform.clone(), submenu);
    drop(wrapper);

    trace!(menu = menu.raw().0, "menu loaded");
    Ok(menu)
}

/// Build a menu from an item tree
pub fn create_menu(
    platform: &Arc<dyn MenuPlatform>,
    items: Vec<MenuItem>,
) -> Result<MenuHandle, MenuError> {
    validate_items(&items)?;
    let count = items.len();
    let template = build_template(items);
    let menu = load_menu_indirect(platform, &template)?;
    debug!(items = count, bytes = template.len(), "menu created");
    Ok(menu)
}

/// Build a menu from caller-supplied template bytes, in the same wrapped
/// layout [`build_template`] produces.
pub fn create_menu_from_template(
    platform: &Arc<dyn MenuPlatform>,
    template: &[u8],
) -> Result<MenuHandle, MenuError> {
    parse_template(template)?;
    Ok(load_menu_indirect(platform, template)?)
}

// ============================================================================
// Single Item Access
// ============================================================================

fn is_text_type(item_type: u32) -> bool {
    item_type & (MFT_SEPARATOR | MFT_BITMAP | MFT_OWNERDRAW) == 0
}

fn set_flag(bits: &mut u32, flag: u32, on: bool) {
    if on {
        *bits |= flag;
    } else {
        *bits &= !flag;
    }
}

/// Read one item. Every flag is reported; `text` only for textual items.
pub fn get_menu_item(
    platform: &dyn MenuPlatform,
    menu: RawMenu,
    item: ItemRef,
) -> Result<MenuItem, PlatformError> {
    let mut info = ItemInfo {
        mask: MIIM_ID | MIIM_FTYPE | MIIM_STATE,
        ..Default::default()
    };
    platform.get_item_info(menu, item, &mut info, None)?;

    let text = if is_text_type(info.item_type) {
        info.mask |= MIIM_STRING;
        // Length probe: no buffer, so the call may report failure but cch is set
        if let Err(e) = platform.get_item_info(menu, item, &mut info, None) {
            trace!(code = e.code, "label length probe");
        }

        let mut buffer = vec![0u16; info.cch as usize + 1];
        platform.get_item_info(menu, item, &mut info, Some(&mut buffer))?;
        let len = buffer.iter().position(|unit| *unit == 0).unwrap_or(buffer.len());
        Some(String::from_utf16_lossy(&buffer[..len]))
    } else {
        None
    };

    Ok(MenuItem {
        id: Some(info.id as i32),
        text,
        separator: Some(info.item_type & MFT_SEPARATOR != 0),
        disabled: Some(info.state & MFS_DISABLED != 0),
        checked: Some(info.state & MFS_CHECKED != 0),
        items: None,
    })
}

/// Apply the fields present in `options` to one item.
///
/// A present `items` list becomes the item's new submenu; it belongs to the
/// parent menu once attached, and any submenu it replaces is destroyed.
pub fn update_menu_item(
    platform: &Arc<dyn MenuPlatform>,
    menu: RawMenu,
    item: ItemRef,
    options: MenuItem,
) -> Result<(), MenuError> {
    if let Some(text) = &options.text {
        validate_text(text, "text")?;
    }
    let mut info = ItemInfo {
        mask: MIIM_FTYPE | MIIM_STATE | MIIM_SUBMENU,
        ..Default::default()
    };
    platform.get_item_info(menu, item, &mut info, None)?;
    let previous_submenu = info.submenu.take();

    info.mask = 0;
    if let Some(separator) = options.separator {
        info.mask |= MIIM_FTYPE;
        set_flag(&mut info.item_type, MFT_SEPARATOR, separator);
    }
    if let Some(disabled) = options.disabled {
        info.mask |= MIIM_STATE;
        set_flag(&mut info.state, MFS_DISABLED, disabled);
    }
    if let Some(checked) = options.checked {
        info.mask |= MIIM_STATE;
        set_flag(&mut info.state, MFS_CHECKED, checked);
    }
    if let Some(id) = options.id {
        info.mask |= MIIM_ID;
        info.id = id as u32;
    }

    let label: Option<Vec<u16>> = options
        .text
        .as_deref()
        .map(|text| text.encode_utf16().chain(iter::once(0)).collect());
    if label.is_some() {
        info.mask |= MIIM_STRING;
    }

    let submenu = match options.items {
        Some(items) => {
            let child = create_menu(platform, items)?;
            info.mask |= MIIM_SUBMENU;
            info.submenu = Some(child.raw());
            Some(child)
        }
        None => None,
    };

    // On failure `submenu` is still owned here and gets destroyed
    platform.set_item_info(menu, item, &info, label.as_deref())?;

    if let Some(child) = submenu {
        let attached = child.release();
        trace!(menu = menu.0, submenu = attached.0, "submenu attached");

        if let Some(old) = previous_submenu.filter(|old| *old != attached) {
            if let Err(e) = platform.destroy_menu(old) {
                warn!(submenu = old.0, error = %e, "Failed to destroy replaced submenu");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Popups
// ============================================================================

/// One show call: which menu, where, and how it is anchored
#[derive(Debug, Clone)]
pub struct PopupRequest {
    pub menu: Arc<MenuHandle>,
    pub position: Position,
    pub align: PopupAlign,
}

impl PopupRequest {
    /// Show the popup and wait for the user. Must run on the loop thread.
    ///
    /// `Ok(None)` means the popup was dismissed without a selection.
    pub fn track(
        &self,
        platform: &dyn MenuPlatform,
        context: &LoopContext,
    ) -> Result<Option<i32>, PlatformError> {
        let system_right = self.align == PopupAlign::System && platform.menu_drop_alignment();
        let flags = TPM_RETURNCMD | TPM_NONOTIFY | self.align.flags(system_right);

        let selected = platform.track_popup(
            self.menu.raw(),
            flags,
            self.position.x,
            self.position.y,
            context.target(),
        );
        if selected != 0 {
            return Ok(Some(selected as i32));
        }

        // A zero return is ambiguous until the error code is read
        match platform.last_error() {
            0 => Ok(None),
            code => Err(PlatformError::new("TrackPopupMenuEx", code)),
        }
    }
}

/// Show a popup and block the calling thread until it closes
pub fn show_sync(
    dispatcher: &LoopDispatcher,
    platform: Arc<dyn MenuPlatform>,
    request: PopupRequest,
) -> Result<Option<i32>, MenuError> {
    debug!(x = request.position.x, y = request.position.y, "menu.show_sync");
    let outcome = dispatcher.run_blocking(move |context| request.track(platform.as_ref(), context))?;
    Ok(outcome?)
}

/// Queue a popup; the returned future resolves when it closes
pub fn show(
    dispatcher: &LoopDispatcher,
    platform: Arc<dyn MenuPlatform>,
    request: PopupRequest,
) -> impl Future<Output = Result<Option<i32>, MenuError>> + Send + 'static {
    debug!(x = request.position.x, y = request.position.y, "menu.show");
    let pending = dispatcher.run_nonblocking(
        move |context| request.track(platform.as_ref(), context),
        |outcome| outcome.map_err(MenuError::from),
    );
    async move { pending.await.unwrap_or_else(|e| Err(MenuError::from(e))) }
}

// ============================================================================
// Tests
// ============================================================================
