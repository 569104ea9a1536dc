//! Win32 implementation of the menu primitives and the popup message loop.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use windows::core::{w, PWSTR};
use windows::Win32::Foundation::{
    GetLastError, SetLastError, BOOL, HINSTANCE, HWND, LPARAM, WIN32_ERROR, WPARAM,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DestroyMenu, DestroyWindow, DispatchMessageW, GetMenuItemInfoW,
    GetMessageW, GetSubMenu, GetSystemMetrics, LoadMenuIndirectW, PostMessageW, RemoveMenu,
    SetMenuItemInfoW, TrackPopupMenuEx, TranslateMessage, HMENU, MENUITEMINFOW, MENU_ITEM_MASK,
    MENU_ITEM_STATE, MENU_ITEM_TYPE, MF_BYPOSITION, MSG, SM_MENUDROPALIGNMENT, WINDOW_EX_STYLE,
    WINDOW_STYLE, WM_APP,
};

use crate::dispatcher::{LoopParts, LoopWaker, MessageLoop};
use crate::platform::{ItemInfo, ItemRef, MenuPlatform, MessageTarget, PlatformError, RawMenu};

/// Posted to the loop window when jobs are queued
const WM_DISPATCH: u32 = WM_APP + 1;

fn hmenu(menu: RawMenu) -> HMENU {
    HMENU(menu.0 as *mut c_void)
}

fn raw_menu(menu: HMENU) -> RawMenu {
    RawMenu(menu.0 as isize)
}

/// Recover the Win32 error code from an `HRESULT_FROM_WIN32` value
fn error_code(error: &windows::core::Error) -> u32 {
    let hr = error.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

fn check<T>(function: &'static str, result: windows::core::Result<T>) -> Result<T, PlatformError> {
    result.map_err(|e| PlatformError::new(function, error_code(&e)))
}

fn item_info_w(info: &ItemInfo) -> MENUITEMINFOW {
    MENUITEMINFOW {
        cbSize: std::mem::size_of::<MENUITEMINFOW>() as u32,
        fMask: MENU_ITEM_MASK(info.mask),
        fType: MENU_ITEM_TYPE(info.item_type),
        fState: MENU_ITEM_STATE(info.state),
        wID: info.id,
        hSubMenu: info.submenu.map(hmenu).unwrap_or_default(),
        ..Default::default()
    }
}

// ============================================================================
// Menu Primitives
// ============================================================================

/// `user32` menu API
pub struct Win32Menus;

impl MenuPlatform for Win32Menus {
    fn load_menu_indirect(&self, template: &[u8]) -> Result<RawMenu, PlatformError> {
        // Templates must be DWORD aligned
        let mut aligned = vec![0u32; template.len().div_ceil(4)];
        for (word, chunk) in aligned.iter_mut().zip(template.chunks(4)) {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_ne_bytes(bytes);
        }

        let menu = unsafe { LoadMenuIndirectW(aligned.as_ptr() as *const c_void) };
        check("LoadMenuIndirectW", menu).map(raw_menu)
    }

    fn get_sub_menu(&self, menu: RawMenu, position: i32) -> Result<RawMenu, PlatformError> {
        let submenu = unsafe { GetSubMenu(hmenu(menu), position) };
        if submenu.is_invalid() {
            return Err(PlatformError::new("GetSubMenu", self.last_error()));
        }
        Ok(raw_menu(submenu))
    }

    fn remove_menu(&self, menu: RawMenu, position: u32) -> Result<(), PlatformError> {
        let result = unsafe { RemoveMenu(hmenu(menu), position, MF_BYPOSITION) };
        check("RemoveMenu", result)
    }

    fn destroy_menu(&self, menu: RawMenu) -> Result<(), PlatformError> {
        let result = unsafe { DestroyMenu(hmenu(menu)) };
        check("DestroyMenu", result)
    }

    fn get_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &mut ItemInfo,
        text: Option<&mut [u16]>,
    ) -> Result<(), PlatformError> {
        let mut mii = item_info_w(&ItemInfo {
            mask: info.mask,
            ..Default::default()
        });
        if let Some(buffer) = text {
            mii.dwTypeData = PWSTR(buffer.as_mut_ptr());
            mii.cch = buffer.len() as u32;
        }

        let result = unsafe {
            GetMenuItemInfoW(
                hmenu(menu),
                item.item(),
                BOOL::from(item.by_position()),
                &mut mii,
            )
        };

        info.item_type = mii.fType.0;
        info.state = mii.fState.0;
        info.id = mii.wID;
        info.submenu = (!mii.hSubMenu.is_invalid()).then(|| raw_menu(mii.hSubMenu));
        info.cch = mii.cch;
        check("GetMenuItemInfoW", result)
    }

    fn set_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &ItemInfo,
        text: Option<&[u16]>,
    ) -> Result<(), PlatformError> {
        let mut mii = item_info_w(info);
        if let Some(label) = text {
            // Read-only for SetMenuItemInfoW
            mii.dwTypeData = PWSTR(label.as_ptr() as *mut u16);
        }

        let result = unsafe {
            SetMenuItemInfoW(
                hmenu(menu),
                item.item(),
                BOOL::from(item.by_position()),
                &mii,
            )
        };
        check("SetMenuItemInfoW", result)
    }

    fn menu_drop_alignment(&self) -> bool {
        unsafe { GetSystemMetrics(SM_MENUDROPALIGNMENT) != 0 }
    }

    fn track_popup(
        &self,
        menu: RawMenu,
        flags: u32,
        x: i32,
        y: i32,
        target: MessageTarget,
    ) -> u32 {
        let owner = HWND(target.0 as *mut c_void);
        unsafe {
            SetLastError(WIN32_ERROR(0));
            TrackPopupMenuEx(hmenu(menu), flags, x, y, owner, None).0 as u32
        }
    }

    fn last_error(&self) -> u32 {
        unsafe { GetLastError().0 }
    }
}

// ============================================================================
// Message Loop
// ============================================================================

/// Hidden window owning popups, pumped by the loop thread
struct Win32Loop {
    hwnd: HWND,
    quit: Arc<AtomicBool>,
}

impl MessageLoop for Win32Loop {
    fn target(&self) -> MessageTarget {
        MessageTarget(self.hwnd.0 as isize)
    }

    fn wait(&mut self) -> bool {
        let mut msg = MSG::default();
        loop {
            if self.quit.load(Ordering::Acquire) {
                return false;
            }
            let status = unsafe { GetMessageW(&mut msg, HWND::default(), 0, 0) };
            if status.0 <= 0 {
                return false;
            }
            if msg.message == WM_DISPATCH {
                return !self.quit.load(Ordering::Acquire);
            }
            unsafe {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }
}

impl Drop for Win32Loop {
    fn drop(&mut self) {
        if let Err(e) = unsafe { DestroyWindow(self.hwnd) } {
            warn!(error = %e, "Failed to destroy menu loop window");
        }
    }
}

struct Win32Waker {
    hwnd: isize,
    quit: Arc<AtomicBool>,
}

impl Win32Waker {
    fn post(&self) -> bool {
        let hwnd = HWND(self.hwnd as *mut c_void);
        unsafe { PostMessageW(hwnd, WM_DISPATCH, WPARAM(0), LPARAM(0)) }.is_ok()
    }
}

impl LoopWaker for Win32Waker {
    fn wake(&self) -> bool {
        !self.quit.load(Ordering::Acquire) && self.post()
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.post() {
            debug!("menu loop window already gone");
        }
    }
}

/// Create the loop window on the calling thread.
pub fn create_loop() -> Result<LoopParts, PlatformError> {
    let hwnd = unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            w!("STATIC"),
            w!("forge-menu"),
            WINDOW_STYLE(0),
            0,
            0,
            0,
            0,
            HWND::default(),
            HMENU::default(),
            HINSTANCE::default(),
            None,
        )
    };
    let hwnd = check("CreateWindowExW", hwnd)?;
    debug!(hwnd = hwnd.0 as isize, "menu loop window created");

    let quit = Arc::new(AtomicBool::new(false));
    Ok((
        Box::new(Win32Loop {
            hwnd,
            quit: quit.clone(),
        }),
        Arc::new(Win32Waker {
            hwnd: hwnd.0 as isize,
            quit,
        }),
    ))
}
