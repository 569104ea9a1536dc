//! In-memory [`MenuPlatform`] for tests.
//!
//! Menus are materialized by parsing the template with the codec's reader.
//! Item queries follow the `GetMenuItemInfoW` contract closely enough to
//! exercise the label-length probe: asking for `MIIM_STRING` without a buffer
//! reports `ERROR_INVALID_PARAMETER` but still fills `cch`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::platform::{
    ItemInfo, ItemRef, MenuPlatform, MessageTarget, PlatformError, RawMenu, MIIM_FTYPE, MIIM_ID,
    MIIM_STATE, MIIM_STRING, MIIM_SUBMENU,
};
use crate::template::{parse_template, TemplateRecord};

pub const ERROR_INVALID_DATA: u32 = 13;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INVALID_MENU_HANDLE: u32 = 1401;
pub const ERROR_MENU_ITEM_NOT_FOUND: u32 = 1456;

#[derive(Debug, Clone)]
struct MockItem {
    item_type: u32,
    state: u32,
    id: u32,
    text: Vec<u16>,
    submenu: Option<RawMenu>,
}

/// One recorded popup call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupCall {
    pub menu: RawMenu,
    pub flags: u32,
    pub x: i32,
    pub y: i32,
    pub target: MessageTarget,
    pub thread: ThreadId,
}

#[derive(Default)]
struct MockState {
    next_handle: isize,
    menus: HashMap<RawMenu, Vec<MockItem>>,
    destroyed: HashSet<RawMenu>,
    failures: HashMap<&'static str, u32>,
    popup_result: u32,
    popup_error: u32,
    last_error: u32,
    drop_alignment: bool,
    popups: Vec<PopupCall>,
    panic_next_popup: bool,
}

impl MockState {
    fn materialize(&mut self, records: &[TemplateRecord]) -> RawMenu {
        let items = records
            .iter()
            .map(|record| MockItem {
                item_type: record.item_type,
                state: record.state,
                id: record.id,
                text: record.text.encode_utf16().collect(),
                submenu: record
                    .children
                    .as_ref()
                    .map(|children| self.materialize(children)),
            })
            .collect();
        self.insert(items)
    }

    fn insert(&mut self, items: Vec<MockItem>) -> RawMenu {
        self.next_handle += 1;
        let menu = RawMenu(0x1000 + self.next_handle);
        self.menus.insert(menu, items);
        menu
    }

    fn destroy(&mut self, menu: RawMenu) -> bool {
        let Some(items) = self.menus.remove(&menu) else {
            return false;
        };
        self.destroyed.insert(menu);
        for submenu in items.into_iter().filter_map(|item| item.submenu) {
            self.destroy(submenu);
        }
        true
    }

    /// Locate an item, searching submenus for command ids
    fn locate(&self, menu: RawMenu, item: ItemRef) -> Option<(RawMenu, usize)> {
        let items = self.menus.get(&menu)?;
        match item {
            ItemRef::Position(index) => {
                ((index as usize) < items.len()).then_some((menu, index as usize))
            }
            ItemRef::Id(id) => {
                if let Some(index) = items
                    .iter()
                    .position(|entry| entry.submenu.is_none() && entry.id == id)
                {
                    return Some((menu, index));
                }
                items
                    .iter()
                    .filter_map(|entry| entry.submenu)
                    .find_map(|submenu| self.locate(submenu, item))
            }
        }
    }

    fn check_failure(&self, function: &'static str) -> Result<(), PlatformError> {
        match self.failures.get(function) {
            Some(code) => Err(PlatformError::new(function, *code)),
            None => Ok(()),
        }
    }
}

/// Shared, cloneable test double
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_platform(self) -> Arc<dyn MenuPlatform> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every later call to `function` fail with `code`
    pub fn fail(&self, function: &'static str, code: u32) {
        self.lock().failures.insert(function, code);
    }

    /// Make the next popup panic on the thread that tracks it
    pub fn panic_next_popup(&self) {
        self.lock().panic_next_popup = true;
    }

    /// Script the next popup: returned command and the error code left behind
    pub fn set_popup_outcome(&self, result: u32, error: u32) {
        let mut state = self.lock();
        state.popup_result = result;
        state.popup_error = error;
    }

    pub fn set_drop_alignment(&self, right: bool) {
        self.lock().drop_alignment = right;
    }

    pub fn popups(&self) -> Vec<PopupCall> {
        self.lock().popups.clone()
    }

    pub fn is_live(&self, menu: RawMenu) -> bool {
        self.lock().menus.contains_key(&menu)
    }

    pub fn is_destroyed(&self, menu: RawMenu) -> bool {
        self.lock().destroyed.contains(&menu)
    }

    pub fn live_menus(&self) -> usize {
        self.lock().menus.len()
    }

    /// Submenu attached to the item at `position`, if any
    pub fn submenu_at(&self, menu: RawMenu, position: usize) -> Option<RawMenu> {
        self.lock()
            .menus
            .get(&menu)
            .and_then(|items| items.get(position))
            .and_then(|item| item.submenu)
    }
}

impl MenuPlatform for MockPlatform {
    fn load_menu_indirect(&self, template: &[u8]) -> Result<RawMenu, PlatformError> {
        let mut state = self.lock();
        state.check_failure("LoadMenuIndirectW")?;
        let records = parse_template(template)
            .map_err(|_| PlatformError::new("LoadMenuIndirectW", ERROR_INVALID_DATA))?;
        Ok(state.materialize(&records))
    }

    fn get_sub_menu(&self, menu: RawMenu, position: i32) -> Result<RawMenu, PlatformError> {
        let state = self.lock();
        state.check_failure("GetSubMenu")?;
        state
            .menus
            .get(&menu)
            .and_then(|items| items.get(position as usize))
            .and_then(|item| item.submenu)
            .ok_or(PlatformError::new("GetSubMenu", ERROR_INVALID_MENU_HANDLE))
    }

    fn remove_menu(&self, menu: RawMenu, position: u32) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.check_failure("RemoveMenu")?;
        let items = state
            .menus
            .get_mut(&menu)
            .ok_or(PlatformError::new("RemoveMenu", ERROR_INVALID_MENU_HANDLE))?;
        if position as usize >= items.len() {
            return Err(PlatformError::new("RemoveMenu", ERROR_MENU_ITEM_NOT_FOUND));
        }
        items.remove(position as usize);
        Ok(())
    }

    fn destroy_menu(&self, menu: RawMenu) -> Result<(), PlatformError> {
        if self.lock().destroy(menu) {
            Ok(())
        } else {
            Err(PlatformError::new("DestroyMenu", ERROR_INVALID_MENU_HANDLE))
        }
    }

    fn get_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &mut ItemInfo,
        text: Option<&mut [u16]>,
    ) -> Result<(), PlatformError> {
        let state = self.lock();
        state.check_failure("GetMenuItemInfoW")?;
        let (owner, index) = state
            .locate(menu, item)
            .ok_or(PlatformError::new("GetMenuItemInfoW", ERROR_MENU_ITEM_NOT_FOUND))?;
        let entry = &state.menus[&owner][index];

        if info.mask & MIIM_FTYPE != 0 {
            info.item_type = entry.item_type;
        }
        if info.mask & MIIM_STATE != 0 {
            info.state = entry.state;
        }
        if info.mask & MIIM_ID != 0 {
            info.id = entry.id;
        }
        if info.mask & MIIM_SUBMENU != 0 {
            info.submenu = entry.submenu;
        }
        if info.mask & MIIM_STRING != 0 {
            match text {
                None => {
                    info.cch = entry.text.len() as u32;
                    return Err(PlatformError::new(
                        "GetMenuItemInfoW",
                        ERROR_INVALID_PARAMETER,
                    ));
                }
                Some(buffer) => {
                    let copied = entry.text.len().min(buffer.len().saturating_sub(1));
                    buffer[..copied].copy_from_slice(&entry.text[..copied]);
                    if let Some(terminator) = buffer.get_mut(copied) {
                        *terminator = 0;
                    }
                    info.cch = copied as u32;
                }
            }
        }
        Ok(())
    }

    fn set_item_info(
        &self,
        menu: RawMenu,
        item: ItemRef,
        info: &ItemInfo,
        text: Option<&[u16]>,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.check_failure("SetMenuItemInfoW")?;
        let (owner, index) = state
            .locate(menu, item)
            .ok_or(PlatformError::new("SetMenuItemInfoW", ERROR_MENU_ITEM_NOT_FOUND))?;
        let entry = state
            .menus
            .get_mut(&owner)
            .and_then(|items| items.get_mut(index))
            .ok_or(PlatformError::new("SetMenuItemInfoW", ERROR_MENU_ITEM_NOT_FOUND))?;

        if info.mask & MIIM_FTYPE != 0 {
            entry.item_type = info.item_type;
        }
        if info.mask & MIIM_STATE != 0 {
            entry.state = info.state;
        }
        if info.mask & MIIM_ID != 0 {
            entry.id = info.id;
        }
        if info.mask & MIIM_SUBMENU != 0 {
            entry.submenu = info.submenu;
        }
        if info.mask & MIIM_STRING != 0 {
            let units = text.unwrap_or(&[]);
            entry.text = units.iter().copied().take_while(|unit| *unit != 0).collect();
        }
        Ok(())
    }

    fn menu_drop_alignment(&self) -> bool {
        self.lock().drop_alignment
    }

    fn track_popup(
        &self,
        menu: RawMenu,
        flags: u32,
        x: i32,
        y: i32,
        target: MessageTarget,
    ) -> u32 {
        let mut state = self.lock();
        state.popups.push(PopupCall {
            menu,
            flags,
            x,
            y,
            target,
            thread: thread::current().id(),
        });
        if std::mem::take(&mut state.panic_next_popup) {
            drop(state);
            panic!("popup crashed");
        }
        if !state.menus.contains_key(&menu) {
            state.last_error = ERROR_INVALID_MENU_HANDLE;
            return 0;
        }
        state.last_error = state.popup_error;
        state.popup_result
    }

    fn last_error(&self) -> u32 {
        self.lock().last_error
    }
}
