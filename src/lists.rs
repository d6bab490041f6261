//! Structured (RFC 6313) list values: basicList, subTemplateList and
//! subTemplateMultiList.
//!
//! Lists nest: a basicList of subTemplateLists whose records carry more
//! basicLists is legal and round-trips. The wire forms live in
//! [`transcode`](crate::transcode); these are the in-memory shapes.

use crate::info_model::InfoElement;
use crate::values::{Record, Value};

use serde::Serialize;

use std::sync::Arc;

/// List semantic: none of.
pub const SEM_NONE_OF: u8 = 0x00;
/// List semantic: exactly one of.
pub const SEM_EXACTLY_ONE_OF: u8 = 0x01;
/// List semantic: one or more of.
pub const SEM_ONE_OR_MORE_OF: u8 = 0x02;
/// List semantic: all of.
pub const SEM_ALL_OF: u8 = 0x03;
/// List semantic: ordered.
pub const SEM_ORDERED: u8 = 0x04;
/// List semantic: undefined.
pub const SEM_UNDEFINED: u8 = 0xFF;

/// Repetition of a single information element.
///
/// `element` is `None` only for the zeroed list produced when the source
/// record had no matching field; such a list encodes as an empty
/// varfield.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicList {
    pub semantic: u8,
    pub element: Option<Arc<InfoElement>>,
    pub values: Vec<Value>,
}

impl BasicList {
    pub fn new(semantic: u8, element: Arc<InfoElement>, values: Vec<Value>) -> Self {
        Self {
            semantic,
            element: Some(element),
            values,
        }
    }

    /// The zeroed list: no element, no contents.
    pub fn empty() -> Self {
        Self {
            semantic: SEM_NONE_OF,
            element: None,
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

/// Sequence of records under one template id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubTemplateList {
    pub semantic: u8,
    pub tmpl_id: u16,
    pub records: Vec<Record>,
}

impl SubTemplateList {
    pub fn new(semantic: u8, tmpl_id: u16, records: Vec<Record>) -> Self {
        Self {
            semantic,
            tmpl_id,
            records,
        }
    }

    /// The zeroed list: template id 0, no records.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

/// One entry of a subTemplateMultiList. An entry whose template was
/// unknown at decode time keeps `tmpl_id` 0 and no records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubTemplateMultiListEntry {
    pub tmpl_id: u16,
    pub records: Vec<Record>,
}

impl SubTemplateMultiListEntry {
    pub fn new(tmpl_id: u16, records: Vec<Record>) -> Self {
        Self { tmpl_id, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Sequence of entries, each with its own template id and records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubTemplateMultiList {
    pub semantic: u8,
    pub entries: Vec<SubTemplateMultiListEntry>,
}

impl SubTemplateMultiList {
    pub fn new(semantic: u8, entries: Vec<SubTemplateMultiListEntry>) -> Self {
        Self { semantic, entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: SubTemplateMultiListEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubTemplateMultiListEntry> {
        self.entries.iter()
    }
}
