//! Extended menu template codec.
//!
//! Encodes a [`MenuItem`] tree into the binary layout accepted by
//! `LoadMenuIndirectW` and parses such buffers back into records.
//!
//! ```text
//! header  version: u16, offset: u16, help_id: u32
//! item    type: u32, state: u32, id: u32, flags: u16,
//!         text: u16[], terminator: u16, [filler: u16 when text length is odd]
//!         if flags & MFR_POPUP: help_id: u32, child items...
//! ```
//!
//! All integers are little-endian and every item record starts on a 4-byte
//! boundary.

use thiserror::Error;

use crate::MenuItem;

// ============================================================================
// Format Constants
// ============================================================================

/// Item type: plain text item
pub const MFT_STRING: u32 = 0x0000;
/// Item type: bitmap item
pub const MFT_BITMAP: u32 = 0x0004;
/// Item type: owner-drawn item
pub const MFT_OWNERDRAW: u32 = 0x0100;
/// Item type: non-selectable divider
pub const MFT_SEPARATOR: u32 = 0x0800;

/// Item state: disabled (grayed)
pub const MFS_DISABLED: u32 = 0x0003;
/// Item state: check mark shown
pub const MFS_CHECKED: u32 = 0x0008;

/// Item flag: last record of its sibling sequence
pub const MF_END: u16 = 0x0080;
/// Item flag: record is followed by a help id and a child sequence.
///
/// The platform headers never gave this bit a name; the value is fixed by the
/// template format.
pub const MFR_POPUP: u16 = 0x0001;

/// Size of the template header
pub const HEADER_SIZE: usize = 8;
/// Size of the fixed part of an item record
pub const ITEM_PREFIX_SIZE: usize = 14;
/// Size of the help id that precedes a child sequence
pub const POPUP_HELP_ID_SIZE: usize = 4;
/// Extended template version
pub const TEMPLATE_VERSION: u16 = 1;
/// Distance from the end of the version field to the first item
pub const TEMPLATE_HEADER_OFFSET: u16 = 4;

/// Label of the placeholder written for an empty sibling sequence
pub const EMPTY_MENU_TEXT: &str = "Empty";
/// Label of the wrapper item that carries the real items as a popup
const ROOT_TEXT: &str = "root";

/// Deepest nesting of sibling sequences a template may carry, counting the
/// top-level sequence. Item trees get one level less because
/// [`build_template`] wraps them in a popup item.
pub const MAX_MENU_DEPTH: usize = 64;

// ============================================================================
// Errors
// ============================================================================

/// Template encoding precondition violations and malformed buffers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("submenu at {path} has no items")]
    EmptySubmenu { path: String },

    #[error("template truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("item text at offset {offset} has no terminator")]
    MissingTerminator { offset: usize },

    #[error("item record at offset {offset} is not 4-byte aligned")]
    Misaligned { offset: usize },

    #[error("unsupported template version {version}")]
    BadHeader { version: u16 },

    #[error("submenu at offset {offset} nests deeper than {} levels", MAX_MENU_DEPTH)]
    TooDeep { offset: usize },

    #[error("submenu at {path} nests deeper than {} levels", MAX_MENU_DEPTH)]
    ItemsTooDeep { path: String },

    #[error("text of item {path} contains a NUL character")]
    NulInText { path: String },
}

// ============================================================================
// Size Computation
// ============================================================================

/// Size in bytes of one item record whose label has `text_units` UTF-16 units.
///
/// Odd labels get an extra filler unit after the terminator so the record
/// length stays a multiple of 4.
pub fn item_record_size(text_units: usize) -> usize {
    ITEM_PREFIX_SIZE + text_units * 2 + if text_units % 2 == 1 { 4 } else { 2 }
}

/// Encoded size of a sibling sequence, including nested submenus.
pub fn template_size(items: &[MenuItem]) -> usize {
    if items.is_empty() {
        return item_record_size(EMPTY_MENU_TEXT.len());
    }
    items.iter().map(MenuItem::template_size).sum()
}

impl MenuItem {
    /// Number of UTF-16 code units in the label
    pub fn text_units(&self) -> usize {
        self.text
            .as_deref()
            .map_or(0, |text| text.encode_utf16().count())
    }

    /// Encoded size of this item and, for submenus, everything below it
    pub fn template_size(&self) -> usize {
        let mut size = item_record_size(self.text_units());
        if let Some(items) = &self.items {
            size += POPUP_HELP_ID_SIZE + template_size(items);
        }
        size
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Reject trees the codec cannot encode.
///
/// A nested `items: []` asks for a submenu with nothing in it. Only the top
/// level may be empty (it encodes as a placeholder). Labels are written
/// NUL-terminated, so they must not contain NUL themselves.
pub fn validate_items(items: &[MenuItem]) -> Result<(), TemplateError> {
    // Level 1 is taken by the wrapper item
    validate_level(items, "", 2)
}

/// Reject a label the template (or a `SetMenuItemInfoW` call) would cut short.
pub fn validate_text(text: &str, path: impl Into<String>) -> Result<(), TemplateError> {
    if text.contains('\0') {
        return Err(TemplateError::NulInText { path: path.into() });
    }
    Ok(())
}

fn validate_level(items: &[MenuItem], prefix: &str, depth: usize) -> Result<(), TemplateError> {
    for (index, item) in items.iter().enumerate() {
        let path = format!("{prefix}{index}");
        if let Some(text) = &item.text {
            validate_text(text, path.as_str())?;
        }
        if let Some(children) = &item.items {
            if children.is_empty() {
                return Err(TemplateError::EmptySubmenu { path });
            }
            if depth >= MAX_MENU_DEPTH {
                return Err(TemplateError::ItemsTooDeep { path });
            }
            validate_level(children, &format!("{path}."), depth + 1)?;
        }
    }
    Ok(())
}

// ============================================================================
// Encoding
// ============================================================================

/// Fixed fields of one item record
#[derive(Debug, Clone, Copy, Default)]
struct RecordFields {
    item_type: u32,
    state: u32,
    id: u32,
    flags: u16,
}

/// Encode `items` into `buf` starting at `offset` and return the end offset.
///
/// `buf` must be zeroed and hold at least `offset + template_size(items)`
/// bytes; the returned offset is exactly that sum.
///
/// # Panics
///
/// Panics if `buf` is shorter than the encoded sequence.
pub fn write_template(items: &[MenuItem], buf: &mut [u8], offset: usize) -> usize {
    let Some((last, rest)) = items.split_last() else {
        let placeholder = RecordFields {
            state: MFS_DISABLED,
            flags: MF_END,
            ..Default::default()
        };
        return write_record(buf, offset, placeholder, EMPTY_MENU_TEXT);
    };

    let mut cursor = offset;
    for item in rest {
        cursor = write_item(item, buf, cursor, false);
    }
    write_item(last, buf, cursor, true)
}

fn write_item(item: &MenuItem, buf: &mut [u8], offset: usize, is_last: bool) -> usize {
    let mut fields = RecordFields {
        id: item.id.unwrap_or(0) as u32,
        ..Default::default()
    };
    if item.separator.unwrap_or(false) {
        fields.item_type |= MFT_SEPARATOR;
    }
    if item.disabled.unwrap_or(false) {
        fields.state |= MFS_DISABLED;
    }
    if item.checked.unwrap_or(false) {
        fields.state |= MFS_CHECKED;
    }
    if is_last {
        fields.flags |= MF_END;
    }
    if item.items.is_some() {
        fields.flags |= MFR_POPUP;
    }

    let end = write_record(buf, offset, fields, item.text.as_deref().unwrap_or(""));
    match &item.items {
        Some(children) => {
            put_u32(buf, end, 0);
            write_template(children, buf, end + POPUP_HELP_ID_SIZE)
        }
        None => end,
    }
}

fn write_record(buf: &mut [u8], offset: usize, fields: RecordFields, text: &str) -> usize {
    put_u32(buf, offset, fields.item_type);
    put_u32(buf, offset + 4, fields.state);
    put_u32(buf, offset + 8, fields.id);
    put_u16(buf, offset + 12, fields.flags);
    write_text(buf, offset + ITEM_PREFIX_SIZE, text)
}

fn write_text(buf: &mut [u8], offset: usize, text: &str) -> usize {
    let mut cursor = offset;
    let mut units = 0usize;
    for unit in text.encode_utf16() {
        put_u16(buf, cursor, unit);
        cursor += 2;
        units += 1;
    }
    put_u16(buf, cursor, 0);
    cursor += 2;
    if units % 2 == 1 {
        put_u16(buf, cursor, 0);
        cursor += 2;
    }
    cursor
}

/// Build a complete template (header included) for a popup menu.
///
/// The items are wrapped in a single `"root"` popup item; loading the
/// template and taking submenu 0 yields a popup menu holding `items`.
/// Callers are expected to have run [`validate_items`] first.
pub fn build_template(items: Vec<MenuItem>) -> Vec<u8> {
    let root = MenuItem {
        text: Some(ROOT_TEXT.to_string()),
        items: Some(items),
        ..Default::default()
    };

    let size = HEADER_SIZE + root.template_size();
    let mut data = vec![0u8; size];
    put_u16(&mut data, 0, TEMPLATE_VERSION);
    put_u16(&mut data, 2, TEMPLATE_HEADER_OFFSET);
    put_u32(&mut data, 4, 0);

    let end = write_item(&root, &mut data, HEADER_SIZE, true);
    debug_assert_eq!(end, size);
    data
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Decoding
// ============================================================================

/// One decoded item record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    /// Byte offset of the record within the parsed buffer
    pub offset: usize,
    /// Length of the record itself, children excluded
    pub size: usize,
    pub item_type: u32,
    pub state: u32,
    pub id: u32,
    pub flags: u16,
    pub text: String,
    pub children: Option<Vec<TemplateRecord>>,
}

impl TemplateRecord {
    pub fn is_last(&self) -> bool {
        self.flags & MF_END != 0
    }

    pub fn is_popup(&self) -> bool {
        self.flags & MFR_POPUP != 0
    }

    /// Convert back into the item model. Every flag comes back set; the
    /// label is absent only for separators without text.
    pub fn to_menu_item(&self) -> MenuItem {
        let separator = self.item_type & MFT_SEPARATOR != 0;
        MenuItem {
            id: Some(self.id as i32),
            text: if separator && self.text.is_empty() {
                None
            } else {
                Some(self.text.clone())
            },
            separator: Some(separator),
            disabled: Some(self.state & MFS_DISABLED != 0),
            checked: Some(self.state & MFS_CHECKED != 0),
            items: self
                .children
                .as_ref()
                .map(|children| children.iter().map(TemplateRecord::to_menu_item).collect()),
        }
    }
}

/// Parse a full template, header included, into its top-level records.
pub fn parse_template(bytes: &[u8]) -> Result<Vec<TemplateRecord>, TemplateError> {
    let version = get_u16(bytes, 0)?;
    if version != TEMPLATE_VERSION {
        return Err(TemplateError::BadHeader { version });
    }
    let offset = get_u16(bytes, 2)? as usize;
    let (records, _) = parse_items(bytes, 4 + offset)?;
    Ok(records)
}

/// Parse one sibling sequence starting at `offset`.
///
/// Returns the records and the offset just past the sequence. Submenus nested
/// more than [`MAX_MENU_DEPTH`] sequences deep are rejected.
pub fn parse_items(
    bytes: &[u8],
    offset: usize,
) -> Result<(Vec<TemplateRecord>, usize), TemplateError> {
    parse_level(bytes, offset, 1)
}

fn parse_level(
    bytes: &[u8],
    offset: usize,
    depth: usize,
) -> Result<(Vec<TemplateRecord>, usize), TemplateError> {
    let mut records = Vec::new();
    let mut cursor = offset;
    loop {
        let (record, next) = parse_record(bytes, cursor, depth)?;
        cursor = next;
        let last = record.is_last();
        records.push(record);
        if last {
            return Ok((records, cursor));
        }
    }
}

fn parse_record(
    bytes: &[u8],
    offset: usize,
    depth: usize,
) -> Result<(TemplateRecord, usize), TemplateError> {
    if offset % 4 != 0 {
        return Err(TemplateError::Misaligned { offset });
    }
    let item_type = get_u32(bytes, offset)?;
    let state = get_u32(bytes, offset + 4)?;
    let id = get_u32(bytes, offset + 8)?;
    let flags = get_u16(bytes, offset + 12)?;

    let mut cursor = offset + ITEM_PREFIX_SIZE;
    let mut units = Vec::new();
    loop {
        let unit =
            get_u16(bytes, cursor).map_err(|_| TemplateError::MissingTerminator { offset })?;
        cursor += 2;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    if units.len() % 2 == 1 {
        cursor += 2;
    }
    if cursor > bytes.len() {
        return Err(TemplateError::Truncated { offset: cursor });
    }

    let mut record = TemplateRecord {
        offset,
        size: cursor - offset,
        item_type,
        state,
        id,
        flags,
        text: String::from_utf16_lossy(&units),
        children: None,
    };

    if record.is_popup() {
        if depth >= MAX_MENU_DEPTH {
            return Err(TemplateError::TooDeep { offset });
        }
        get_u32(bytes, cursor)?;
        let (children, end) = parse_level(bytes, cursor + POPUP_HELP_ID_SIZE, depth + 1)?;
        record.children = Some(children);
        cursor = end;
    }

    Ok((record, cursor))
}

fn get_u16(bytes: &[u8], offset: usize) -> Result<u16, TemplateError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(TemplateError::Truncated { offset })
}

fn get_u32(bytes: &[u8], offset: usize) -> Result<u32, TemplateError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(TemplateError::Truncated { offset })
}

// ============================================================================
// Tests
// ============================================================================
