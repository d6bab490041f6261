//! In-memory record values.
//!
//! A decoded or to-be-encoded record is a vector of [`Value`]s, one per
//! field of the internal template that shapes it. `Value` is a tagged
//! variant keyed by element kind; the transcoder dispatches on the tag.
//! Decoded strings and octet arrays are owned copies, so records stay
//! valid after the message buffer moves to the next message.

use crate::info_model::{ElementKind, VARLEN};
use crate::lists::{BasicList, SubTemplateList, SubTemplateMultiList};

use serde::Serialize;

use std::net::{Ipv4Addr, Ipv6Addr};

/// One field value of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Mac([u8; 6]),
    Str(String),
    Octets(Vec<u8>),
    Seconds(u32),
    Milliseconds(u64),
    Microseconds(u64),
    Nanoseconds(u64),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    BasicList(BasicList),
    SubTemplateList(SubTemplateList),
    SubTemplateMultiList(SubTemplateMultiList),
}

impl Value {
    /// The element kind this value transcodes as.
    pub fn kind(&self) -> ElementKind {
        match self {
            Value::U8(_) => ElementKind::Unsigned8,
            Value::U16(_) => ElementKind::Unsigned16,
            Value::U32(_) => ElementKind::Unsigned32,
            Value::U64(_) => ElementKind::Unsigned64,
            Value::I8(_) => ElementKind::Signed8,
            Value::I16(_) => ElementKind::Signed16,
            Value::I32(_) => ElementKind::Signed32,
            Value::I64(_) => ElementKind::Signed64,
            Value::F32(_) => ElementKind::Float32,
            Value::F64(_) => ElementKind::Float64,
            Value::Bool(_) => ElementKind::Boolean,
            Value::Mac(_) => ElementKind::MacAddress,
            Value::Str(_) => ElementKind::Utf8String,
            Value::Octets(_) => ElementKind::OctetArray,
            Value::Seconds(_) => ElementKind::DateTimeSeconds,
            Value::Milliseconds(_) => ElementKind::DateTimeMilliseconds,
            Value::Microseconds(_) => ElementKind::DateTimeMicroseconds,
            Value::Nanoseconds(_) => ElementKind::DateTimeNanoseconds,
            Value::Ip4(_) => ElementKind::Ipv4Address,
            Value::Ip6(_) => ElementKind::Ipv6Address,
            Value::BasicList(_) => ElementKind::BasicList,
            Value::SubTemplateList(_) => ElementKind::SubTemplateList,
            Value::SubTemplateMultiList(_) => ElementKind::SubTemplateMultiList,
        }
    }

    /// Zero value for an absent source field, in the destination's kind.
    /// Fixed octet destinations are zero-filled across their width.
    pub fn zero(kind: ElementKind, len: u16) -> Value {
        match kind {
            ElementKind::Unsigned8 => Value::U8(0),
            ElementKind::Unsigned16 => Value::U16(0),
            ElementKind::Unsigned32 => Value::U32(0),
            ElementKind::Unsigned64 => Value::U64(0),
            ElementKind::Signed8 => Value::I8(0),
            ElementKind::Signed16 => Value::I16(0),
            ElementKind::Signed32 => Value::I32(0),
            ElementKind::Signed64 => Value::I64(0),
            ElementKind::Float32 => Value::F32(0.0),
            ElementKind::Float64 => Value::F64(0.0),
            ElementKind::Boolean => Value::Bool(false),
            ElementKind::MacAddress => Value::Mac([0; 6]),
            ElementKind::Utf8String => Value::Str(String::new()),
            ElementKind::OctetArray => {
                if len == VARLEN {
                    Value::Octets(Vec::new())
                } else {
                    Value::Octets(vec![0; len as usize])
                }
            }
            ElementKind::DateTimeSeconds => Value::Seconds(0),
            ElementKind::DateTimeMilliseconds => Value::Milliseconds(0),
            ElementKind::DateTimeMicroseconds => Value::Microseconds(0),
            ElementKind::DateTimeNanoseconds => Value::Nanoseconds(0),
            ElementKind::Ipv4Address => Value::Ip4(Ipv4Addr::UNSPECIFIED),
            ElementKind::Ipv6Address => Value::Ip6(Ipv6Addr::UNSPECIFIED),
            ElementKind::BasicList => Value::BasicList(BasicList::empty()),
            ElementKind::SubTemplateList => Value::SubTemplateList(SubTemplateList::empty()),
            ElementKind::SubTemplateMultiList => {
                Value::SubTemplateMultiList(SubTemplateMultiList::empty())
            }
        }
    }

    /// Unsigned integer view across the unsigned and timestamp variants.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            Value::Seconds(v) => Some(u64::from(*v)),
            Value::Milliseconds(v) | Value::Microseconds(v) | Value::Nanoseconds(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Value::Octets(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_basic_list(&self) -> Option<&BasicList> {
        match self {
            Value::BasicList(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_sub_template_list(&self) -> Option<&SubTemplateList> {
        match self {
            Value::SubTemplateList(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_sub_template_multi_list(&self) -> Option<&SubTemplateMultiList> {
        match self {
            Value::SubTemplateMultiList(l) => Some(l),
            _ => None,
        }
    }
}

/// A record shaped by an internal template: one value per field, in
/// template order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}
