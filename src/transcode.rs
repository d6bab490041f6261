//! The transcoder: element-wise conversion between wire records and
//! in-memory [`Record`]s, driven by a (source template, destination
//! template) plan.
//!
//! Encode walks the external template and pulls values out of the record
//! through the plan; decode walks the internal template and pulls bytes
//! out of the wire record through the plan plus a per-record offset walk.
//! Structured elements recurse, temporarily rebinding the current
//! template pair to the sub-list's templates.

use crate::IpfixError;
use crate::info_model::{ElementKind, InfoElement, VARLEN};
use crate::lists::{BasicList, SubTemplateList, SubTemplateMultiList, SubTemplateMultiListEntry};
use crate::session::Session;
use crate::template::{TID_MIN_DATA, Template, TemplateField};
use crate::values::{Record, Value};

use log::warn;
use lru::LruCache;

use std::sync::Arc;

/// High bit of a wire element id, marking an enterprise element.
pub(crate) const ENTERPRISE_BIT: u16 = 0x8000;

/// Maximum nesting depth for structured elements.
const MAX_TEMPLATE_LEVELS: usize = 10;

// ---------------------------------------------------------------------
// Bounds-checked cursor helpers
// ---------------------------------------------------------------------

fn check_dst(dst: &[u8], pos: usize, need: usize) -> Result<(), IpfixError> {
    if pos + need > dst.len() {
        return Err(IpfixError::EndOfMessage {
            need,
            available: dst.len().saturating_sub(pos),
        });
    }
    Ok(())
}

fn put_bytes(dst: &mut [u8], pos: &mut usize, bytes: &[u8]) -> Result<(), IpfixError> {
    check_dst(dst, *pos, bytes.len())?;
    dst[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
    Ok(())
}

fn put_u8(dst: &mut [u8], pos: &mut usize, val: u8) -> Result<(), IpfixError> {
    put_bytes(dst, pos, &[val])
}

fn put_u16(dst: &mut [u8], pos: &mut usize, val: u16) -> Result<(), IpfixError> {
    put_bytes(dst, pos, &val.to_be_bytes())
}

fn put_u32(dst: &mut [u8], pos: &mut usize, val: u32) -> Result<(), IpfixError> {
    put_bytes(dst, pos, &val.to_be_bytes())
}

fn check_src(src: &[u8], pos: usize, need: usize) -> Result<(), IpfixError> {
    if pos + need > src.len() {
        return Err(IpfixError::EndOfMessage {
            need,
            available: src.len().saturating_sub(pos),
        });
    }
    Ok(())
}

fn get_u8(src: &[u8], pos: &mut usize) -> Result<u8, IpfixError> {
    check_src(src, *pos, 1)?;
    let val = src[*pos];
    *pos += 1;
    Ok(val)
}

fn get_u16(src: &[u8], pos: &mut usize) -> Result<u16, IpfixError> {
    check_src(src, *pos, 2)?;
    let val = u16::from_be_bytes([src[*pos], src[*pos + 1]]);
    *pos += 2;
    Ok(val)
}

fn get_u32(src: &[u8], pos: &mut usize) -> Result<u32, IpfixError> {
    check_src(src, *pos, 4)?;
    let val = u32::from_be_bytes([src[*pos], src[*pos + 1], src[*pos + 2], src[*pos + 3]]);
    *pos += 4;
    Ok(val)
}

/// Reads a varfield length prefix: one byte, or `0xFF` plus two bytes.
fn get_varlen_prefix(src: &[u8], pos: &mut usize) -> Result<usize, IpfixError> {
    let first = get_u8(src, pos)?;
    if first < 255 {
        Ok(first as usize)
    } else {
        Ok(get_u16(src, pos)? as usize)
    }
}

/// Locates a varfield's payload: `(payload offset, payload length)`
/// relative to `buf`, bounds-checked.
fn varfield_span(buf: &[u8]) -> Result<(usize, usize), IpfixError> {
    let mut pos = 0;
    let len = get_varlen_prefix(buf, &mut pos)?;
    check_src(buf, pos, len)?;
    Ok((pos, len))
}

/// Writes a scalar varfield: length prefix plus payload.
fn put_varfield(dst: &mut [u8], pos: &mut usize, payload: &[u8]) -> Result<(), IpfixError> {
    if payload.len() > u16::MAX as usize {
        return Err(IpfixError::Protocol {
            context: format!("varfield payload of {} octets cannot be encoded", payload.len()),
        });
    }
    if payload.len() < 255 {
        put_u8(dst, pos, payload.len() as u8)?;
    } else {
        put_u8(dst, pos, 255)?;
        put_u16(dst, pos, payload.len() as u16)?;
    }
    put_bytes(dst, pos, payload)
}

// ---------------------------------------------------------------------
// Transcode plans
// ---------------------------------------------------------------------

/// Field mapping for one (source, destination) template pair: per
/// destination index, the source index carrying the same element, or
/// `None` when the source has no such field.
#[derive(Debug)]
pub struct TranscodePlan {
    src: Arc<Template>,
    dst: Arc<Template>,
    map: Vec<Option<u16>>,
}

impl TranscodePlan {
    fn build(src: &Arc<Template>, dst: &Arc<Template>) -> Self {
        let map = dst
            .fields()
            .map(|f| src.index_of(f.element.ent, f.element.num))
            .collect();
        Self {
            src: src.clone(),
            dst: dst.clone(),
            map,
        }
    }

    pub fn source_index(&self, dst_index: usize) -> Option<u16> {
        self.map.get(dst_index).copied().flatten()
    }

    pub fn source_template(&self) -> &Arc<Template> {
        &self.src
    }

    pub fn destination_template(&self) -> &Arc<Template> {
        &self.dst
    }
}

/// Recency-ordered plan cache, one per message buffer.
///
/// Keys are the template pair's allocation identities; every cached plan
/// holds strong handles to both templates, so an identity can never be
/// recycled while its plan is alive. The owning buffer clears the cache
/// whenever the session's template tables change.
pub(crate) struct PlanCache {
    plans: LruCache<(usize, usize), Arc<TranscodePlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self {
            plans: LruCache::unbounded(),
        }
    }

    pub fn plan_for(&mut self, src: &Arc<Template>, dst: &Arc<Template>) -> Arc<TranscodePlan> {
        let key = (Arc::as_ptr(src) as usize, Arc::as_ptr(dst) as usize);
        if let Some(plan) = self.plans.get(&key) {
            return plan.clone();
        }
        let plan = Arc::new(TranscodePlan::build(src, dst));
        self.plans.put(key, plan.clone());
        plan
    }

    pub fn clear(&mut self) {
        self.plans.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.plans.len()
    }
}

// ---------------------------------------------------------------------
// Source record sizing
// ---------------------------------------------------------------------

/// Per-field wire offsets of one record under `tmpl`, plus the record's
/// total wire length. Fixed templates answer from their cached offset
/// vector; varlen templates walk the record's length prefixes.
pub fn record_offsets(tmpl: &Template, src: &[u8]) -> Result<(Vec<u32>, usize), IpfixError> {
    if let Some(cached) = tmpl.offsets() {
        let total = *cached.last().unwrap_or(&0) as usize;
        check_src(src, 0, total)?;
        return Ok((cached.iter().map(|&o| u32::from(o)).collect(), total));
    }

    let mut offsets = Vec::with_capacity(tmpl.len() + 1);
    let mut pos = 0usize;
    for field in tmpl.fields() {
        offsets.push(pos as u32);
        if field.is_varlen() {
            let len = get_varlen_prefix(src, &mut pos)?;
            check_src(src, pos, len)?;
            pos += len;
        } else {
            check_src(src, pos, field.length as usize)?;
            pos += field.length as usize;
        }
    }
    offsets.push(pos as u32);
    Ok((offsets, pos))
}

/// Wire length of one record under `tmpl` starting at `src`.
pub fn wire_record_len(tmpl: &Template, src: &[u8]) -> Result<usize, IpfixError> {
    if !tmpl.is_varlen() {
        let len = tmpl.wire_min_len() as usize;
        check_src(src, 0, len)?;
        return Ok(len);
    }
    record_offsets(tmpl, src).map(|(_, total)| total)
}

// ---------------------------------------------------------------------
// Fixed-width element codecs
// ---------------------------------------------------------------------

/// Writes the low-order `d_len` network-order bytes of `val`.
fn put_uint(dst: &mut [u8], pos: &mut usize, val: u64, d_len: u16) -> Result<(), IpfixError> {
    let bytes = val.to_be_bytes();
    put_bytes(dst, pos, &bytes[8 - d_len as usize..])
}

/// Reads `s` big-endian, zero-extended.
fn get_uint(s: &[u8]) -> u64 {
    let mut val = 0u64;
    for &b in s.iter().take(8) {
        val = (val << 8) | u64::from(b);
    }
    val
}

fn kind_mismatch(elem: &InfoElement, value: &Value) -> IpfixError {
    IpfixError::UnsupportedTranscode {
        context: format!(
            "value of kind {:?} cannot encode element {} ({:?})",
            value.kind(),
            elem.name,
            elem.kind
        ),
    }
}

/// Encodes one fixed-width field into `d_len` octets.
fn encode_fixed(
    value: &Value,
    elem: &InfoElement,
    d_len: u16,
    dst: &mut [u8],
    pos: &mut usize,
) -> Result<(), IpfixError> {
    match elem.kind {
        ElementKind::Unsigned8
        | ElementKind::Unsigned16
        | ElementKind::Unsigned32
        | ElementKind::Unsigned64
        | ElementKind::DateTimeSeconds
        | ElementKind::DateTimeMilliseconds
        | ElementKind::DateTimeMicroseconds
        | ElementKind::DateTimeNanoseconds => {
            let val = value.as_u64().ok_or_else(|| kind_mismatch(elem, value))?;
            put_uint(dst, pos, val, d_len)
        }
        ElementKind::Signed8
        | ElementKind::Signed16
        | ElementKind::Signed32
        | ElementKind::Signed64 => {
            let val = value.as_i64().ok_or_else(|| kind_mismatch(elem, value))?;
            put_uint(dst, pos, val as u64, d_len)
        }
        ElementKind::Float32 => match value {
            Value::F32(f) => put_bytes(dst, pos, &f.to_be_bytes()),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::Float64 => match value {
            Value::F64(f) => put_bytes(dst, pos, &f.to_be_bytes()),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::Boolean => match value {
            // RFC 7011: true encodes as 1, false as 2
            Value::Bool(b) => put_u8(dst, pos, if *b { 1 } else { 2 }),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::MacAddress => match value {
            Value::Mac(mac) => put_bytes(dst, pos, mac),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::Ipv4Address => match value {
            Value::Ip4(ip) => put_bytes(dst, pos, &ip.octets()),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::Ipv6Address => match value {
            Value::Ip6(ip) => put_bytes(dst, pos, &ip.octets()),
            _ => Err(kind_mismatch(elem, value)),
        },
        ElementKind::OctetArray | ElementKind::Utf8String => {
            let bytes = match value {
                Value::Octets(b) => b.as_slice(),
                Value::Str(s) => s.as_bytes(),
                _ => return Err(kind_mismatch(elem, value)),
            };
            let d_len = d_len as usize;
            check_dst(dst, *pos, d_len)?;
            if bytes.len() >= d_len {
                // non-endian quantity: truncate at the back
                dst[*pos..*pos + d_len].copy_from_slice(&bytes[..d_len]);
            } else {
                dst[*pos..*pos + bytes.len()].copy_from_slice(bytes);
                dst[*pos + bytes.len()..*pos + d_len].fill(0);
            }
            *pos += d_len;
            Ok(())
        }
        ElementKind::BasicList | ElementKind::SubTemplateList | ElementKind::SubTemplateMultiList => {
            Err(IpfixError::UnsupportedTranscode {
                context: format!("structured element {} cannot be fixed-width", elem.name),
            })
        }
    }
}

/// Decodes `s` (one fixed-width wire field) into a value of the
/// element's canonical kind, adjusted to `d_len` for byte kinds.
fn decode_fixed(elem: &InfoElement, s: &[u8], d_len: u16) -> Result<Value, IpfixError> {
    let value = match elem.kind {
        ElementKind::Unsigned8 => Value::U8(get_uint(s) as u8),
        ElementKind::Unsigned16 => Value::U16(get_uint(s) as u16),
        ElementKind::Unsigned32 => Value::U32(get_uint(s) as u32),
        ElementKind::Unsigned64 => Value::U64(get_uint(s)),
        ElementKind::Signed8 => Value::I8(get_uint(s) as i8),
        ElementKind::Signed16 => Value::I16(get_uint(s) as i16),
        ElementKind::Signed32 => Value::I32(get_uint(s) as i32),
        ElementKind::Signed64 => Value::I64(get_uint(s) as i64),
        ElementKind::DateTimeSeconds => Value::Seconds(get_uint(s) as u32),
        ElementKind::DateTimeMilliseconds => Value::Milliseconds(get_uint(s)),
        ElementKind::DateTimeMicroseconds => Value::Microseconds(get_uint(s)),
        ElementKind::DateTimeNanoseconds => Value::Nanoseconds(get_uint(s)),
        ElementKind::Float32 => {
            let bytes: [u8; 4] = s.try_into().map_err(|_| IpfixError::UnsupportedTranscode {
                context: format!("float32 element {} at width {}", elem.name, s.len()),
            })?;
            Value::F32(f32::from_be_bytes(bytes))
        }
        ElementKind::Float64 => {
            let bytes: [u8; 8] = s.try_into().map_err(|_| IpfixError::UnsupportedTranscode {
                context: format!("float64 element {} at width {}", elem.name, s.len()),
            })?;
            Value::F64(f64::from_be_bytes(bytes))
        }
        ElementKind::Boolean => Value::Bool(s.first() == Some(&1)),
        ElementKind::MacAddress => {
            let bytes: [u8; 6] = s.try_into().map_err(|_| IpfixError::UnsupportedTranscode {
                context: format!("MAC element {} at width {}", elem.name, s.len()),
            })?;
            Value::Mac(bytes)
        }
        ElementKind::Ipv4Address => {
            let bytes: [u8; 4] = s.try_into().map_err(|_| IpfixError::UnsupportedTranscode {
                context: format!("IPv4 element {} at width {}", elem.name, s.len()),
            })?;
            Value::Ip4(bytes.into())
        }
        ElementKind::Ipv6Address => {
            let bytes: [u8; 16] = s.try_into().map_err(|_| IpfixError::UnsupportedTranscode {
                context: format!("IPv6 element {} at width {}", elem.name, s.len()),
            })?;
            Value::Ip6(bytes.into())
        }
        ElementKind::Utf8String => {
            let text = String::from_utf8_lossy(s);
            Value::Str(text.trim_end_matches('\0').to_string())
        }
        ElementKind::OctetArray => {
            let d_len = d_len as usize;
            let mut bytes = vec![0u8; d_len];
            let take = s.len().min(d_len);
            bytes[..take].copy_from_slice(&s[..take]);
            Value::Octets(bytes)
        }
        ElementKind::BasicList | ElementKind::SubTemplateList | ElementKind::SubTemplateMultiList => {
            return Err(IpfixError::UnsupportedTranscode {
                context: format!("structured element {} cannot be fixed-width", elem.name),
            });
        }
    };
    Ok(value)
}

// ---------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------

/// Encodes records shaped by `int_tmpl` into the wire form of
/// `ext_tmpl`. Created per append; template rebinding during list
/// recursion is scoped to this value.
pub(crate) struct Encoder<'a> {
    pub session: &'a Session,
    pub plans: &'a mut PlanCache,
    pub int_tmpl: Arc<Template>,
    pub ext_tmpl: Arc<Template>,
    depth: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(
        session: &'a Session,
        plans: &'a mut PlanCache,
        int_tmpl: Arc<Template>,
        ext_tmpl: Arc<Template>,
    ) -> Self {
        Self {
            session,
            plans,
            int_tmpl,
            ext_tmpl,
            depth: 0,
        }
    }

    /// Encodes one record, returning the number of octets written.
    pub fn encode_record(&mut self, rec: &Record, dst: &mut [u8]) -> Result<usize, IpfixError> {
        let mut pos = 0;
        self.encode_record_at(rec, dst, &mut pos)?;
        Ok(pos)
    }

    fn encode_record_at(
        &mut self,
        rec: &Record,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        let int = self.int_tmpl.clone();
        let ext = self.ext_tmpl.clone();
        if rec.len() != int.len() {
            return Err(IpfixError::UnsupportedTranscode {
                context: format!(
                    "record carries {} values but the internal template has {} fields",
                    rec.len(),
                    int.len()
                ),
            });
        }
        let plan = self.plans.plan_for(&int, &ext);

        for (i, dst_field) in ext.fields().enumerate() {
            match plan.source_index(i) {
                None => encode_absent(dst_field, dst, pos)?,
                Some(si) => {
                    let value = &rec.values[si as usize];
                    self.encode_field(value, dst_field, dst, pos)?;
                }
            }
        }
        Ok(())
    }

    fn encode_field(
        &mut self,
        value: &Value,
        dst_field: &TemplateField,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        let elem = &dst_field.element;
        if elem.kind.is_list() {
            return match (elem.kind, value) {
                (ElementKind::BasicList, Value::BasicList(list)) => {
                    self.encode_basic_list(list, dst, pos)
                }
                (ElementKind::SubTemplateList, Value::SubTemplateList(list)) => {
                    self.encode_sub_template_list(list, dst, pos)
                }
                (ElementKind::SubTemplateMultiList, Value::SubTemplateMultiList(list)) => {
                    self.encode_sub_template_multi_list(list, dst, pos)
                }
                _ => Err(kind_mismatch(elem, value)),
            };
        }

        if dst_field.is_varlen() {
            let byte_kind =
                matches!(elem.kind, ElementKind::Utf8String | ElementKind::OctetArray);
            return match value {
                Value::Str(s) if byte_kind => put_varfield(dst, pos, s.as_bytes()),
                Value::Octets(b) if byte_kind => put_varfield(dst, pos, b),
                _ => Err(IpfixError::UnsupportedTranscode {
                    context: format!(
                        "fixed value of kind {:?} into variable-length element {}",
                        value.kind(),
                        elem.name
                    ),
                }),
            };
        }

        encode_fixed(value, elem, dst_field.length, dst, pos)
    }

    fn enter_list(&mut self) -> Result<(), IpfixError> {
        self.depth += 1;
        if self.depth > MAX_TEMPLATE_LEVELS {
            return Err(IpfixError::MalformedList {
                context: format!("list nesting exceeds {MAX_TEMPLATE_LEVELS} levels"),
            });
        }
        Ok(())
    }

    fn encode_basic_list(
        &mut self,
        list: &BasicList,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        let Some(elem) = list.element.clone() else {
            return Err(IpfixError::MalformedList {
                context: "basicList without an information element".to_string(),
            });
        };
        self.enter_list()?;
        let result = self.encode_basic_list_inner(list, &elem, dst, pos);
        self.depth -= 1;
        result
    }

    fn encode_basic_list_inner(
        &mut self,
        list: &BasicList,
        elem: &Arc<InfoElement>,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        // lists always use the three-octet length form
        put_u8(dst, pos, 255)?;
        let len_at = *pos;
        put_u16(dst, pos, 0)?;
        let content_start = *pos;

        put_u8(dst, pos, list.semantic)?;
        let mut num = elem.num;
        if elem.ent != 0 {
            num |= ENTERPRISE_BIT;
        }
        put_u16(dst, pos, num)?;
        put_u16(dst, pos, elem.len)?;
        if elem.ent != 0 {
            put_u32(dst, pos, elem.ent)?;
        }

        for value in list.iter() {
            if elem.len == VARLEN {
                match (elem.kind, value) {
                    (ElementKind::BasicList, Value::BasicList(inner)) => {
                        self.encode_basic_list(inner, dst, pos)?;
                    }
                    (ElementKind::SubTemplateList, Value::SubTemplateList(inner)) => {
                        self.encode_sub_template_list(inner, dst, pos)?;
                    }
                    (ElementKind::SubTemplateMultiList, Value::SubTemplateMultiList(inner)) => {
                        self.encode_sub_template_multi_list(inner, dst, pos)?;
                    }
                    (_, Value::Str(s)) => put_varfield(dst, pos, s.as_bytes())?,
                    (_, Value::Octets(b)) => put_varfield(dst, pos, b)?,
                    _ => return Err(kind_mismatch(elem, value)),
                }
            } else {
                encode_fixed(value, elem, elem.len, dst, pos)?;
            }
        }

        let content_len = (*pos - content_start) as u16;
        dst[len_at..len_at + 2].copy_from_slice(&content_len.to_be_bytes());
        Ok(())
    }

    /// Resolves the template pair a sub-list encodes under: the wire
    /// layout from the external table, the record layout from the
    /// internal table when declared, else the wire layout itself.
    fn sub_templates(&self, tmpl_id: u16) -> Result<(Arc<Template>, Arc<Template>), IpfixError> {
        if tmpl_id < TID_MIN_DATA {
            return Err(IpfixError::MalformedList {
                context: format!("illegal sub-list template id {tmpl_id}"),
            });
        }
        let ext = self
            .session
            .get_external(tmpl_id)
            .ok_or(IpfixError::MissingTemplate {
                template_id: tmpl_id,
            })?;
        let int = self.session.get_internal(tmpl_id).unwrap_or_else(|| ext.clone());
        Ok((int, ext))
    }

    fn encode_sub_records(
        &mut self,
        int: Arc<Template>,
        ext: Arc<Template>,
        records: &[Record],
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        let saved_int = std::mem::replace(&mut self.int_tmpl, int);
        let saved_ext = std::mem::replace(&mut self.ext_tmpl, ext);
        let mut result = Ok(());
        for rec in records {
            result = self.encode_record_at(rec, dst, pos);
            if result.is_err() {
                break;
            }
        }
        // restore the outer pair on every path
        self.int_tmpl = saved_int;
        self.ext_tmpl = saved_ext;
        result
    }

    fn encode_sub_template_list(
        &mut self,
        list: &SubTemplateList,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        self.enter_list()?;
        let result = (|| {
            let (int, ext) = self.sub_templates(list.tmpl_id)?;

            put_u8(dst, pos, 255)?;
            let len_at = *pos;
            put_u16(dst, pos, 0)?;
            let content_start = *pos;

            put_u8(dst, pos, list.semantic)?;
            put_u16(dst, pos, list.tmpl_id)?;

            self.encode_sub_records(int, ext, &list.records, dst, pos)?;

            let content_len = (*pos - content_start) as u16;
            dst[len_at..len_at + 2].copy_from_slice(&content_len.to_be_bytes());
            Ok(())
        })();
        self.depth -= 1;
        result
    }

    fn encode_sub_template_multi_list(
        &mut self,
        list: &SubTemplateMultiList,
        dst: &mut [u8],
        pos: &mut usize,
    ) -> Result<(), IpfixError> {
        self.enter_list()?;
        let result = (|| {
            put_u8(dst, pos, 255)?;
            let len_at = *pos;
            put_u16(dst, pos, 0)?;
            let content_start = *pos;

            put_u8(dst, pos, list.semantic)?;

            for entry in list.iter() {
                // entries produced by decoding around an unknown template
                // carry id 0; they have nothing to say on the wire
                if entry.tmpl_id < TID_MIN_DATA {
                    continue;
                }
                let (int, ext) = self.sub_templates(entry.tmpl_id)?;

                put_u16(dst, pos, entry.tmpl_id)?;
                let entry_len_at = *pos;
                put_u16(dst, pos, 0)?;

                self.encode_sub_records(int, ext, &entry.records, dst, pos)?;

                let entry_len = (*pos - entry_len_at + 2) as u16;
                dst[entry_len_at..entry_len_at + 2].copy_from_slice(&entry_len.to_be_bytes());
            }

            let content_len = (*pos - content_start) as u16;
            dst[len_at..len_at + 2].copy_from_slice(&content_len.to_be_bytes());
            Ok(())
        })();
        self.depth -= 1;
        result
    }
}

/// Zero-fills an absent destination field: a zero-length varfield for
/// varlen elements, zeroes across the width otherwise.
fn encode_absent(
    dst_field: &TemplateField,
    dst: &mut [u8],
    pos: &mut usize,
) -> Result<(), IpfixError> {
    if dst_field.is_varlen() {
        put_u8(dst, pos, 0)
    } else {
        let len = dst_field.length as usize;
        check_dst(dst, *pos, len)?;
        dst[*pos..*pos + len].fill(0);
        *pos += len;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------

/// Decodes wire records of `ext_tmpl` into records shaped by
/// `int_tmpl`. Holds the session mutably so unknown wire elements can be
/// alien-registered.
pub(crate) struct Decoder<'a> {
    pub session: &'a mut Session,
    pub plans: &'a mut PlanCache,
    pub int_tmpl: Arc<Template>,
    pub ext_tmpl: Arc<Template>,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(
        session: &'a mut Session,
        plans: &'a mut PlanCache,
        int_tmpl: Arc<Template>,
        ext_tmpl: Arc<Template>,
    ) -> Self {
        Self {
            session,
            plans,
            int_tmpl,
            ext_tmpl,
            depth: 0,
        }
    }

    /// Decodes one record starting at `src`, returning it with the
    /// number of source octets consumed.
    pub fn decode_record(&mut self, src: &[u8]) -> Result<(Record, usize), IpfixError> {
        let ext = self.ext_tmpl.clone();
        let int = self.int_tmpl.clone();
        let (offsets, total) = record_offsets(&ext, src)?;
        let plan = self.plans.plan_for(&ext, &int);

        let mut values = Vec::with_capacity(int.len());
        for (i, int_field) in int.fields().enumerate() {
            match plan.source_index(i) {
                None => values.push(Value::zero(int_field.element.kind, int_field.length)),
                Some(si) => {
                    let src_field = ext.field(si as usize).ok_or_else(|| IpfixError::Protocol {
                        context: "transcode plan references a field beyond its template".to_string(),
                    })?;
                    let off = offsets[si as usize] as usize;
                    let value = self.decode_field(src, off, src_field, int_field)?;
                    values.push(value);
                }
            }
        }
        Ok((Record { values }, total))
    }

    fn decode_field(
        &mut self,
        src: &[u8],
        off: usize,
        src_field: &TemplateField,
        int_field: &TemplateField,
    ) -> Result<Value, IpfixError> {
        let kind = int_field.element.kind;
        if kind.is_list() {
            return match kind {
                ElementKind::BasicList => {
                    self.decode_basic_list(&src[off..]).map(Value::BasicList)
                }
                ElementKind::SubTemplateList => self
                    .decode_sub_template_list(&src[off..])
                    .map(Value::SubTemplateList),
                _ => self
                    .decode_sub_template_multi_list(&src[off..])
                    .map(Value::SubTemplateMultiList),
            };
        }

        match (src_field.is_varlen(), int_field.is_varlen()) {
            (true, true) => {
                let (payload_off, payload_len) = varfield_span(&src[off..])?;
                let payload = &src[off + payload_off..off + payload_off + payload_len];
                Ok(match kind {
                    ElementKind::Utf8String => {
                        Value::Str(String::from_utf8_lossy(payload).into_owned())
                    }
                    _ => Value::Octets(payload.to_vec()),
                })
            }
            (false, false) => {
                let s_len = src_field.length as usize;
                decode_fixed(&int_field.element, &src[off..off + s_len], int_field.length)
            }
            _ => Err(IpfixError::UnsupportedTranscode {
                context: format!(
                    "fixed/variable length mismatch on element {}",
                    int_field.element.name
                ),
            }),
        }
    }

    fn enter_list(&mut self) -> Result<(), IpfixError> {
        self.depth += 1;
        if self.depth > MAX_TEMPLATE_LEVELS {
            return Err(IpfixError::MalformedList {
                context: format!("list nesting exceeds {MAX_TEMPLATE_LEVELS} levels"),
            });
        }
        Ok(())
    }

    fn decode_basic_list(&mut self, wrapped: &[u8]) -> Result<BasicList, IpfixError> {
        self.enter_list()?;
        let result = self.decode_basic_list_inner(wrapped);
        self.depth -= 1;
        result
    }

    fn decode_basic_list_inner(&mut self, wrapped: &[u8]) -> Result<BasicList, IpfixError> {
        let (payload_off, payload_len) = varfield_span(wrapped)?;
        let content = &wrapped[payload_off..payload_off + payload_len];
        if content.len() < 5 {
            return Err(IpfixError::MalformedList {
                context: format!("basicList header needs 5 octets, found {}", content.len()),
            });
        }

        let mut pos = 0;
        let semantic = get_u8(content, &mut pos)?;
        let raw_num = get_u16(content, &mut pos)?;
        let elem_len = get_u16(content, &mut pos)?;
        if elem_len == 0 {
            return Err(IpfixError::MalformedList {
                context: "basicList element length is zero".to_string(),
            });
        }
        let (ent, num) = if raw_num & ENTERPRISE_BIT != 0 {
            let ent = get_u32(content, &mut pos).map_err(|_| IpfixError::MalformedList {
                context: "basicList header truncated before enterprise number".to_string(),
            })?;
            (ent, raw_num & !ENTERPRISE_BIT)
        } else {
            (0, raw_num)
        };

        let elem = match self.session.model().lookup(ent, num) {
            Some(elem) => elem,
            None => self.session.model_mut().add_alien(ent, num, elem_len),
        };

        let payload = &content[pos..];
        let mut list = BasicList::new(semantic, elem.clone(), Vec::new());

        if elem_len == VARLEN {
            let mut p = 0;
            while p < payload.len() {
                let item = &payload[p..];
                let (item_off, item_len) = varfield_span(item)?;
                match elem.kind {
                    ElementKind::BasicList => {
                        list.push(Value::BasicList(self.decode_basic_list(item)?));
                    }
                    ElementKind::SubTemplateList => {
                        list.push(Value::SubTemplateList(self.decode_sub_template_list(item)?));
                    }
                    ElementKind::SubTemplateMultiList => {
                        list.push(Value::SubTemplateMultiList(
                            self.decode_sub_template_multi_list(item)?,
                        ));
                    }
                    ElementKind::Utf8String => {
                        let bytes = &item[item_off..item_off + item_len];
                        list.push(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
                    }
                    _ => {
                        let bytes = &item[item_off..item_off + item_len];
                        list.push(Value::Octets(bytes.to_vec()));
                    }
                }
                p += item_off + item_len;
            }
        } else {
            let count = payload.len() / elem_len as usize;
            for i in 0..count {
                let chunk = &payload[i * elem_len as usize..(i + 1) * elem_len as usize];
                list.push(decode_fixed(&elem, chunk, elem_len)?);
            }
        }

        Ok(list)
    }

    /// Resolves the template pair a sub-list decodes under, applying the
    /// external→internal pair map. `Ok(None)` means the list contents are
    /// to be dropped (unknown wire template, or an explicit drop pair).
    fn sub_decode_templates(
        &mut self,
        ext_tid: u16,
    ) -> Result<Option<(u16, Arc<Template>, Arc<Template>)>, IpfixError> {
        let Some(ext) = self.session.get_external(ext_tid) else {
            warn!("skipping sub-list: no template {ext_tid:#06x} present");
            return Ok(None);
        };
        let int_tid = self.session.lookup_template_pair(ext_tid);
        if int_tid == 0 {
            return Ok(None);
        }
        let int = if int_tid == ext_tid {
            self.session.get_internal(int_tid).unwrap_or_else(|| ext.clone())
        } else {
            self.session
                .get_internal(int_tid)
                .ok_or(IpfixError::MissingTemplate {
                    template_id: int_tid,
                })?
        };
        Ok(Some((int_tid, int, ext)))
    }

    fn decode_sub_records(
        &mut self,
        int: Arc<Template>,
        ext: Arc<Template>,
        src: &[u8],
    ) -> Result<Vec<Record>, IpfixError> {
        let saved_int = std::mem::replace(&mut self.int_tmpl, int);
        let saved_ext = std::mem::replace(&mut self.ext_tmpl, ext);

        let mut records = Vec::new();
        let mut pos = 0;
        let mut result = Ok(());
        while pos < src.len() {
            match self.decode_record(&src[pos..]) {
                Ok((rec, used)) => {
                    records.push(rec);
                    pos += used;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        self.int_tmpl = saved_int;
        self.ext_tmpl = saved_ext;
        result.map(|_| records)
    }

    fn decode_sub_template_list(&mut self, wrapped: &[u8]) -> Result<SubTemplateList, IpfixError> {
        self.enter_list()?;
        let result = self.decode_sub_template_list_inner(wrapped);
        self.depth -= 1;
        result
    }

    fn decode_sub_template_list_inner(
        &mut self,
        wrapped: &[u8],
    ) -> Result<SubTemplateList, IpfixError> {
        let (payload_off, payload_len) = varfield_span(wrapped)?;
        let content = &wrapped[payload_off..payload_off + payload_len];
        if content.len() < 3 {
            return Err(IpfixError::MalformedList {
                context: format!(
                    "subTemplateList header needs 3 octets, found {}",
                    content.len()
                ),
            });
        }

        let mut pos = 0;
        let semantic = get_u8(content, &mut pos)?;
        let ext_tid = get_u16(content, &mut pos)?;

        let Some((int_tid, int, ext)) = self.sub_decode_templates(ext_tid)? else {
            return Ok(SubTemplateList::empty());
        };

        let records = self.decode_sub_records(int, ext, &content[pos..])?;
        Ok(SubTemplateList::new(semantic, int_tid, records))
    }

    fn decode_sub_template_multi_list(
        &mut self,
        wrapped: &[u8],
    ) -> Result<SubTemplateMultiList, IpfixError> {
        self.enter_list()?;
        let result = self.decode_sub_template_multi_list_inner(wrapped);
        self.depth -= 1;
        result
    }

    fn decode_sub_template_multi_list_inner(
        &mut self,
        wrapped: &[u8],
    ) -> Result<SubTemplateMultiList, IpfixError> {
        let (payload_off, payload_len) = varfield_span(wrapped)?;
        let content = &wrapped[payload_off..payload_off + payload_len];
        if content.is_empty() {
            return Err(IpfixError::MalformedList {
                context: "subTemplateMultiList without a semantic octet".to_string(),
            });
        }

        let mut pos = 0;
        let semantic = get_u8(content, &mut pos)?;
        let mut list = SubTemplateMultiList::new(semantic, Vec::new());

        while pos + 4 <= content.len() {
            let ext_tid = get_u16(content, &mut pos)?;
            let entry_len = get_u16(content, &mut pos)? as usize;
            if entry_len < 4 {
                warn!("invalid length {entry_len} in subTemplateMultiList entry");
                break;
            }
            let body_len = entry_len - 4;
            check_src(content, pos, body_len)?;
            let body = &content[pos..pos + body_len];
            pos += body_len;

            match self.sub_decode_templates(ext_tid)? {
                None => list.push(SubTemplateMultiListEntry::default()),
                Some((int_tid, int, ext)) => {
                    let records = self.decode_sub_records(int, ext, body)?;
                    list.push(SubTemplateMultiListEntry::new(int_tid, records));
                }
            }
        }

        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info_model::InfoModel;

    fn session() -> Session {
        Session::new(InfoModel::default())
    }

    fn fixed_template(session: &Session) -> Arc<Template> {
        let mut tmpl = Template::new();
        tmpl.append(session.model().lookup(0, 1).unwrap(), 8).unwrap();
        tmpl.append(session.model().lookup(0, 7).unwrap(), 2).unwrap();
        Arc::new(tmpl)
    }

    #[test]
    fn plan_maps_shared_elements() {
        let session = session();
        let full = fixed_template(&session);
        let mut narrow = Template::new();
        narrow
            .append(session.model().lookup(0, 7).unwrap(), 2)
            .unwrap();
        narrow
            .append(session.model().lookup(0, 11).unwrap(), 2)
            .unwrap();
        let narrow = Arc::new(narrow);

        let plan = TranscodePlan::build(&full, &narrow);
        assert_eq!(plan.source_index(0), Some(1));
        assert_eq!(plan.source_index(1), None);
    }

    #[test]
    fn plan_cache_reuses_by_identity() {
        let session = session();
        let tmpl = fixed_template(&session);
        let mut cache = PlanCache::new();
        let a = cache.plan_for(&tmpl, &tmpl);
        let b = cache.plan_for(&tmpl, &tmpl);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn identity_encode_decode_round_trip() {
        let mut session = session();
        let tmpl = fixed_template(&session);
        let mut plans = PlanCache::new();

        let rec = Record::new(vec![Value::U64(0x0102_0304_0506_0708), Value::U16(443)]);
        let mut buf = [0u8; 64];
        let used = {
            let mut enc = Encoder::new(&session, &mut plans, tmpl.clone(), tmpl.clone());
            enc.encode_record(&rec, &mut buf).unwrap()
        };
        assert_eq!(used, 10);
        assert_eq!(&buf[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 0x01, 0xBB]);

        let (back, consumed) = {
            let mut dec = Decoder::new(&mut session, &mut plans, tmpl.clone(), tmpl.clone());
            dec.decode_record(&buf[..used]).unwrap()
        };
        assert_eq!(consumed, 10);
        assert_eq!(back, rec);
    }

    #[test]
    fn reduced_length_round_trip() {
        let mut session = session();
        let elem = session.model().lookup(0, 1).unwrap();

        let mut internal = Template::new();
        internal.append(elem.clone(), 8).unwrap();
        let internal = Arc::new(internal);

        let mut external = Template::new();
        external.append(elem, 4).unwrap();
        let external = Arc::new(external);

        let mut plans = PlanCache::new();
        let rec = Record::new(vec![Value::U64(0xFACE_F00D)]);
        let mut buf = [0u8; 16];
        let used = {
            let mut enc = Encoder::new(&session, &mut plans, internal.clone(), external.clone());
            enc.encode_record(&rec, &mut buf).unwrap()
        };
        assert_eq!(used, 4);
        assert_eq!(&buf[..4], &[0xFA, 0xCE, 0xF0, 0x0D]);

        let (back, _) = {
            let mut dec = Decoder::new(&mut session, &mut plans, internal, external);
            dec.decode_record(&buf[..4]).unwrap()
        };
        assert_eq!(back.values[0], Value::U64(0xFACE_F00D));
    }

    #[test]
    fn absent_fields_decode_zeroed() {
        let mut session = session();
        let mut narrow = Template::new();
        narrow
            .append(session.model().lookup(0, 7).unwrap(), 2)
            .unwrap();
        let narrow = Arc::new(narrow);
        let wide = fixed_template(&session);

        let mut plans = PlanCache::new();
        let mut buf = [0u8; 16];
        let used = {
            let mut enc = Encoder::new(&session, &mut plans, narrow.clone(), narrow.clone());
            enc.encode_record(&Record::new(vec![Value::U16(80)]), &mut buf)
                .unwrap()
        };

        // decode the 2-octet record into the wider internal layout
        let (rec, _) = {
            let mut dec = Decoder::new(&mut session, &mut plans, wide, narrow);
            dec.decode_record(&buf[..used]).unwrap()
        };
        assert_eq!(rec.values[0], Value::U64(0));
        assert_eq!(rec.values[1], Value::U16(80));
    }

    #[test]
    fn varfield_boundary_lengths() {
        let mut dst = vec![0u8; 70000];
        for len in [0usize, 254, 255, 256, 65535] {
            let payload = vec![0xAB; len];
            let mut pos = 0;
            put_varfield(&mut dst, &mut pos, &payload).unwrap();
            let expected_prefix = if len < 255 { 1 } else { 3 };
            assert_eq!(pos, len + expected_prefix, "prefix form for {len}");
            let (off, got_len) = varfield_span(&dst).unwrap();
            assert_eq!(off, expected_prefix);
            assert_eq!(got_len, len);
        }
    }

    #[test]
    fn mixed_fixed_varlen_is_rejected() {
        let mut session = session();
        let mut varlen = Template::new();
        varlen
            .append(session.model().lookup(0, 210).unwrap(), VARLEN)
            .unwrap();
        let varlen = Arc::new(varlen);

        let mut fixed_pad = Template::new();
        fixed_pad
            .append(session.model().lookup(0, 210).unwrap(), 4)
            .unwrap();
        let fixed_pad = Arc::new(fixed_pad);

        let mut plans = PlanCache::new();
        let wire = [1u8, 0xAA]; // one varfield of one octet
        let mut dec = Decoder::new(&mut session, &mut plans, fixed_pad, varlen);
        match dec.decode_record(&wire) {
            Err(IpfixError::UnsupportedTranscode { .. }) => {}
            other => panic!("expected UnsupportedTranscode, got {other:?}"),
        }
    }

    #[test]
    fn offsets_walk_varlen_records() {
        let session = session();
        let mut tmpl = Template::new();
        tmpl.append(session.model().lookup(0, 7).unwrap(), 2).unwrap();
        tmpl.append(session.model().lookup(0, 82).unwrap(), VARLEN)
            .unwrap();
        tmpl.append(session.model().lookup(0, 1).unwrap(), 8).unwrap();

        let mut wire = vec![0x00, 0x50, 0x03];
        wire.extend_from_slice(b"eth");
        wire.extend_from_slice(&[0; 8]);
        let (offsets, total) = record_offsets(&tmpl, &wire).unwrap();
        assert_eq!(offsets, vec![0, 2, 6, 14]);
        assert_eq!(total, 14);
        assert_eq!(wire_record_len(&tmpl, &wire).unwrap(), 14);

        // a truncated record reports need and availability
        match record_offsets(&tmpl, &wire[..4]) {
            Err(IpfixError::EndOfMessage { need, available }) => {
                assert_eq!(need, 3);
                assert_eq!(available, 1);
            }
            other => panic!("expected EndOfMessage, got {other:?}"),
        }
    }
}
