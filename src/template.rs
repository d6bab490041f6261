//! Templates: ordered element references with derived layout facts.
//!
//! A template is built by appending `(element, length)` pairs, then
//! installed in a [`Session`](crate::session::Session) under a template
//! id, after which it is immutable and shared. The derivations the
//! transcoder needs (variable-length flag, minimum wire record length,
//! the element index map, and per-field wire offsets for fixed layouts)
//! are maintained incrementally as fields are appended.

use crate::IpfixError;
use crate::info_model::{ElementKind, InfoElement, VARLEN};

use serde::Serialize;

use std::collections::HashMap;
use std::sync::Arc;

/// Set id reserved for template sets.
pub const TID_TEMPLATE_SET: u16 = 2;
/// Set id reserved for options-template sets.
pub const TID_OPTIONS_TEMPLATE_SET: u16 = 3;
/// Smallest id usable for data templates (and data sets).
pub const TID_MIN_DATA: u16 = 256;

/// One field of a template: an element reference and its wire length.
///
/// The length equals the element's canonical length, a reduced length for
/// integer elements, or [`VARLEN`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateField {
    pub element: Arc<InfoElement>,
    pub length: u16,
}

impl TemplateField {
    pub fn is_varlen(&self) -> bool {
        self.length == VARLEN
    }
}

/// Ordered field list with an optional scope prefix.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Template {
    fields: Vec<TemplateField>,
    scope_count: u16,
    is_varlen: bool,
    wire_min_len: u16,
    record_len: u16,
    defaulted: bool,
    #[serde(skip)]
    index: HashMap<(u32, u16), u16>,
    #[serde(skip)]
    offsets: Vec<u16>,
}

impl Template {
    pub fn new() -> Self {
        Self {
            record_len: 4,
            offsets: vec![0],
            ..Self::default()
        }
    }

    /// Appends a field. A `length` of 0 defaults to the element's
    /// canonical length and marks the template; defaulted templates are
    /// rejected as internal layouts at install time.
    pub fn append(&mut self, element: Arc<InfoElement>, length: u16) -> Result<(), IpfixError> {
        let length = if length == 0 {
            self.defaulted = true;
            element.len
        } else {
            length
        };

        if element.kind.is_list() {
            if length != VARLEN {
                return Err(IpfixError::Protocol {
                    context: format!(
                        "structured element {} requires variable length, got {length}",
                        element.name
                    ),
                });
            }
        } else if element.kind.is_integer() {
            if length == VARLEN || length > element.kind.canonical_len() {
                return Err(IpfixError::Protocol {
                    context: format!(
                        "illegal length {length} for integer element {} (canonical {})",
                        element.name,
                        element.kind.canonical_len()
                    ),
                });
            }
        } else if matches!(element.kind, ElementKind::OctetArray | ElementKind::Utf8String) {
            // any fixed width or VARLEN
        } else if length != element.kind.canonical_len() {
            return Err(IpfixError::Protocol {
                context: format!(
                    "element {} only supports its canonical length {}, got {length}",
                    element.name,
                    element.kind.canonical_len()
                ),
            });
        }

        if self.fields.len() >= u16::MAX as usize {
            return Err(IpfixError::Protocol {
                context: "template field count limit reached".to_string(),
            });
        }

        let idx = self.fields.len() as u16;
        self.index.entry((element.ent, element.num)).or_insert(idx);

        if length == VARLEN {
            self.is_varlen = true;
            self.offsets.clear();
            self.wire_min_len = self.wire_min_len.saturating_add(1);
        } else {
            if !self.is_varlen {
                let end = self.wire_min_len.saturating_add(length);
                self.offsets.push(end);
            }
            self.wire_min_len = self.wire_min_len.saturating_add(length);
        }

        self.record_len = self
            .record_len
            .saturating_add(if element.ent != 0 { 8 } else { 4 });

        self.fields.push(TemplateField { element, length });
        Ok(())
    }

    /// Marks the leading `count` fields as scope, turning this into an
    /// options template. `0 < count <= field count`.
    pub fn set_scope_count(&mut self, count: u16) -> Result<(), IpfixError> {
        if count == 0 || count as usize > self.fields.len() {
            return Err(IpfixError::Protocol {
                context: format!(
                    "illegal options scope count {count} for {} fields",
                    self.fields.len()
                ),
            });
        }
        if self.scope_count == 0 {
            self.record_len = self.record_len.saturating_add(2);
        }
        self.scope_count = count;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, i: usize) -> Option<&TemplateField> {
        self.fields.get(i)
    }

    pub fn fields(&self) -> impl Iterator<Item = &TemplateField> {
        self.fields.iter()
    }

    pub fn scope_count(&self) -> u16 {
        self.scope_count
    }

    pub fn is_options(&self) -> bool {
        self.scope_count > 0
    }

    /// True when any field carries the variable-length sentinel.
    pub fn is_varlen(&self) -> bool {
        self.is_varlen
    }

    /// Smallest possible wire record under this template: fixed fields at
    /// their length, varlen fields at one octet of length prefix. Equals
    /// the exact record length when the template is fixed. Trailing set
    /// bytes shorter than this are padding.
    pub fn wire_min_len(&self) -> u16 {
        self.wire_min_len
    }

    /// Wire size of the template record announcing this template.
    pub fn record_len(&self) -> u16 {
        self.record_len
    }

    /// True when any field was appended with a defaulted length.
    pub fn is_defaulted(&self) -> bool {
        self.defaulted
    }

    /// Position of the first field referencing `(ent, num)`.
    pub fn index_of(&self, ent: u32, num: u16) -> Option<u16> {
        self.index.get(&(ent, num)).copied()
    }

    /// Cached wire offsets (one per field, plus the record end) for fixed
    /// layouts; `None` when the template is varlen and offsets depend on
    /// the record contents.
    pub fn offsets(&self) -> Option<&[u16]> {
        if self.is_varlen {
            None
        } else {
            Some(&self.offsets)
        }
    }
}
