//! Information element descriptors and the model that resolves them.
//!
//! Every field carried in an IPFIX template references an information
//! element by `(enterprise number, element number)`. The [`InfoModel`]
//! resolves that pair to a descriptor holding the element's canonical
//! length, abstract data type and flags. A curated subset of the IANA
//! registry is preloaded; applications register their own enterprise
//! elements with [`InfoModel::add`], and the decoder registers "alien"
//! elements it meets on the wire with [`InfoModel::add_alien`].

use serde::Serialize;

use std::collections::HashMap;
use std::sync::Arc;

/// Sentinel length marking a variable-length element.
pub const VARLEN: u16 = 0xFFFF;

/// Element flag: multibyte integer quantity subject to network byte order.
pub const FLAG_ENDIAN: u8 = 0x01;

/// Abstract data types an information element can carry.
///
/// The three structured kinds always pair with [`VARLEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElementKind {
    OctetArray,
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float32,
    Float64,
    Boolean,
    MacAddress,
    Utf8String,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
    Ipv4Address,
    Ipv6Address,
    BasicList,
    SubTemplateList,
    SubTemplateMultiList,
}

impl ElementKind {
    /// Canonical wire length in octets, or [`VARLEN`].
    pub fn canonical_len(&self) -> u16 {
        match self {
            ElementKind::OctetArray | ElementKind::Utf8String => VARLEN,
            ElementKind::Unsigned8 | ElementKind::Signed8 => 1,
            ElementKind::Unsigned16 | ElementKind::Signed16 => 2,
            ElementKind::Unsigned32 | ElementKind::Signed32 => 4,
            ElementKind::Unsigned64 | ElementKind::Signed64 => 8,
            ElementKind::Float32 => 4,
            ElementKind::Float64 => 8,
            ElementKind::Boolean => 1,
            ElementKind::MacAddress => 6,
            ElementKind::DateTimeSeconds => 4,
            ElementKind::DateTimeMilliseconds
            | ElementKind::DateTimeMicroseconds
            | ElementKind::DateTimeNanoseconds => 8,
            ElementKind::Ipv4Address => 4,
            ElementKind::Ipv6Address => 16,
            ElementKind::BasicList
            | ElementKind::SubTemplateList
            | ElementKind::SubTemplateMultiList => VARLEN,
        }
    }

    /// True for the integer kinds that accept reduced-length encoding.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ElementKind::Unsigned8
                | ElementKind::Unsigned16
                | ElementKind::Unsigned32
                | ElementKind::Unsigned64
                | ElementKind::Signed8
                | ElementKind::Signed16
                | ElementKind::Signed32
                | ElementKind::Signed64
        )
    }

    /// True for the three structured kinds.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            ElementKind::BasicList
                | ElementKind::SubTemplateList
                | ElementKind::SubTemplateMultiList
        )
    }

    fn default_flags(&self) -> u8 {
        match self {
            ElementKind::Unsigned16
            | ElementKind::Unsigned32
            | ElementKind::Unsigned64
            | ElementKind::Signed16
            | ElementKind::Signed32
            | ElementKind::Signed64
            | ElementKind::Float32
            | ElementKind::Float64
            | ElementKind::DateTimeSeconds
            | ElementKind::DateTimeMilliseconds
            | ElementKind::DateTimeMicroseconds
            | ElementKind::DateTimeNanoseconds => FLAG_ENDIAN,
            _ => 0,
        }
    }
}

/// Descriptor of one information element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoElement {
    /// IANA private enterprise number, 0 for the standard registry.
    pub ent: u32,
    /// Element number within the enterprise.
    pub num: u16,
    /// Canonical length in octets, or [`VARLEN`].
    pub len: u16,
    /// Abstract data type.
    pub kind: ElementKind,
    /// Flag bits; see [`FLAG_ENDIAN`].
    pub flags: u8,
    /// Registry name, for diagnostics.
    pub name: String,
}

impl InfoElement {
    /// Builds a descriptor with the kind's canonical length and flags.
    pub fn new(ent: u32, num: u16, name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            ent,
            num,
            len: kind.canonical_len(),
            kind,
            flags: kind.default_flags(),
            name: name.into(),
        }
    }

    /// Builds a fixed-length descriptor, for octet-array style elements
    /// whose registry definition pins a width.
    pub fn with_len(ent: u32, num: u16, name: impl Into<String>, kind: ElementKind, len: u16) -> Self {
        Self {
            ent,
            num,
            len,
            kind,
            flags: kind.default_flags(),
            name: name.into(),
        }
    }

    pub fn is_varlen(&self) -> bool {
        self.len == VARLEN
    }

    pub fn is_endian(&self) -> bool {
        self.flags & FLAG_ENDIAN != 0
    }
}

/// Resolves `(enterprise, number)` pairs to element descriptors.
///
/// Descriptors are handed out as shared handles; templates, lists and
/// transcode plans all reference the same allocation.
#[derive(Debug, Clone)]
pub struct InfoModel {
    elements: HashMap<(u32, u16), Arc<InfoElement>>,
}

impl Default for InfoModel {
    fn default() -> Self {
        let mut model = Self {
            elements: HashMap::new(),
        };
        for (num, name, kind) in IANA_ELEMENTS {
            model.add(InfoElement::new(0, *num, *name, *kind));
        }
        model
    }
}

impl InfoModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an element descriptor by identity.
    pub fn lookup(&self, ent: u32, num: u16) -> Option<Arc<InfoElement>> {
        self.elements.get(&(ent, num)).cloned()
    }

    /// Registers (or redefines) an element and returns its shared handle.
    pub fn add(&mut self, element: InfoElement) -> Arc<InfoElement> {
        let handle = Arc::new(element);
        self.elements
            .insert((handle.ent, handle.num), handle.clone());
        handle
    }

    /// Registers an element observed on the wire but absent from the
    /// model. Aliens are octet arrays with no endian flag; a later
    /// [`add`](Self::add) with the true definition overrides them.
    pub fn add_alien(&mut self, ent: u32, num: u16, len: u16) -> Arc<InfoElement> {
        let handle = Arc::new(InfoElement {
            ent,
            num,
            len,
            kind: ElementKind::OctetArray,
            flags: 0,
            name: format!("alien({ent}/{num})"),
        });
        self.elements.insert((ent, num), handle.clone());
        handle
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// IANA registry subset preloaded into every model.
const IANA_ELEMENTS: &[(u16, &str, ElementKind)] = &[
    (1, "octetDeltaCount", ElementKind::Unsigned64),
    (2, "packetDeltaCount", ElementKind::Unsigned64),
    (4, "protocolIdentifier", ElementKind::Unsigned8),
    (5, "ipClassOfService", ElementKind::Unsigned8),
    (6, "tcpControlBits", ElementKind::Unsigned16),
    (7, "sourceTransportPort", ElementKind::Unsigned16),
    (8, "sourceIPv4Address", ElementKind::Ipv4Address),
    (9, "sourceIPv4PrefixLength", ElementKind::Unsigned8),
    (10, "ingressInterface", ElementKind::Unsigned32),
    (11, "destinationTransportPort", ElementKind::Unsigned16),
    (12, "destinationIPv4Address", ElementKind::Ipv4Address),
    (13, "destinationIPv4PrefixLength", ElementKind::Unsigned8),
    (14, "egressInterface", ElementKind::Unsigned32),
    (16, "bgpSourceAsNumber", ElementKind::Unsigned32),
    (17, "bgpDestinationAsNumber", ElementKind::Unsigned32),
    (27, "sourceIPv6Address", ElementKind::Ipv6Address),
    (28, "destinationIPv6Address", ElementKind::Ipv6Address),
    (32, "icmpTypeCodeIPv4", ElementKind::Unsigned16),
    (56, "sourceMacAddress", ElementKind::MacAddress),
    (80, "destinationMacAddress", ElementKind::MacAddress),
    (82, "interfaceName", ElementKind::Utf8String),
    (83, "interfaceDescription", ElementKind::Utf8String),
    (85, "octetTotalCount", ElementKind::Unsigned64),
    (86, "packetTotalCount", ElementKind::Unsigned64),
    (136, "flowEndReason", ElementKind::Unsigned8),
    (148, "flowId", ElementKind::Unsigned64),
    (150, "flowStartSeconds", ElementKind::DateTimeSeconds),
    (151, "flowEndSeconds", ElementKind::DateTimeSeconds),
    (152, "flowStartMilliseconds", ElementKind::DateTimeMilliseconds),
    (153, "flowEndMilliseconds", ElementKind::DateTimeMilliseconds),
    (154, "flowStartMicroseconds", ElementKind::DateTimeMicroseconds),
    (155, "flowEndMicroseconds", ElementKind::DateTimeMicroseconds),
    (156, "flowStartNanoseconds", ElementKind::DateTimeNanoseconds),
    (157, "flowEndNanoseconds", ElementKind::DateTimeNanoseconds),
    (161, "flowDurationMilliseconds", ElementKind::Unsigned32),
    (210, "paddingOctets", ElementKind::OctetArray),
    (230, "natEvent", ElementKind::Unsigned8),
    (239, "biflowDirection", ElementKind::Unsigned8),
    (276, "dataRecordsReliability", ElementKind::Boolean),
    (291, "basicList", ElementKind::BasicList),
    (292, "subTemplateList", ElementKind::SubTemplateList),
    (293, "subTemplateMultiList", ElementKind::SubTemplateMultiList),
    (320, "absoluteError", ElementKind::Float64),
];
