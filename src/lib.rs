#![doc = include_str!("../README.md")]

pub mod info_model;
pub mod lists;
pub mod message;
pub mod session;
pub mod template;
pub mod transcode;
pub mod transport;
pub mod values;

mod tests;

pub use info_model::{ElementKind, InfoElement, InfoModel, VARLEN};
pub use lists::{BasicList, SubTemplateList, SubTemplateMultiList, SubTemplateMultiListEntry};
pub use message::{MessageBuffer, MessageBufferBuilder, Records};
pub use session::{NewTemplateHook, Session};
pub use template::{TID_MIN_DATA, TID_OPTIONS_TEMPLATE_SET, TID_TEMPLATE_SET, Template};
pub use transport::{BufferCollector, BufferExporter, Collector, Exporter, MessageLog};
pub use values::{Record, Value};

/// Errors surfaced at the crate boundary.
///
/// Peer-induced faults that the protocol lets a collector recover from
/// (unknown data-set templates, malformed template records, unknown
/// sub-list templates, sequence gaps) are handled internally with a
/// `log` warning and never reach this type.
#[derive(Debug)]
pub enum IpfixError {
    /// A read or write ran out of message, set or record space.
    ///
    /// On the write side this is the retryable condition automatic mode
    /// answers with a flush; on the read side it marks the end of the
    /// current message.
    EndOfMessage {
        /// Octets the operation needed.
        need: usize,
        /// Octets that were available.
        available: usize,
    },

    /// An exporter or collector failed; passed through untouched.
    Io(std::io::Error),

    /// The byte stream violates RFC 7011 framing: bad version, length
    /// mismatch, illegal set id or length, or an invalid template
    /// definition.
    Protocol {
        /// What was violated.
        context: String,
    },

    /// A template id was referenced but is not present in the relevant
    /// session table.
    MissingTemplate { template_id: u16 },

    /// A structured-data field could not be read or written.
    MalformedList { context: String },

    /// A message or payload does not fit the buffer offered for it.
    BufferTooSmall { need: usize, capacity: usize },

    /// An internal template carried a defaulted element length; rejected
    /// at install time.
    DefaultedLength { template_id: u16 },

    /// The transcoder has no rule for this source/destination pairing
    /// (fixed vs. variable length, or a value of the wrong kind).
    UnsupportedTranscode { context: String },

    /// A blocking collector read was woken by
    /// [`MessageBuffer::interrupt`].
    Interrupted,
}

impl std::fmt::Display for IpfixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpfixError::EndOfMessage { need, available } => {
                write!(
                    f,
                    "end of message (need {need} bytes, {available} available)"
                )
            }
            IpfixError::Io(err) => write!(f, "transport I/O error: {err}"),
            IpfixError::Protocol { context } => write!(f, "IPFIX protocol violation: {context}"),
            IpfixError::MissingTemplate { template_id } => {
                write!(f, "no template {template_id:#06x} present")
            }
            IpfixError::MalformedList { context } => {
                write!(f, "malformed structured data: {context}")
            }
            IpfixError::BufferTooSmall { need, capacity } => {
                write!(
                    f,
                    "buffer too small (need {need} bytes, capacity {capacity})"
                )
            }
            IpfixError::DefaultedLength { template_id } => {
                write!(
                    f,
                    "internal template {template_id:#06x} carries a defaulted element length"
                )
            }
            IpfixError::UnsupportedTranscode { context } => {
                write!(f, "unsupported transcode: {context}")
            }
            IpfixError::Interrupted => write!(f, "collector read interrupted"),
        }
    }
}

impl std::error::Error for IpfixError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpfixError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IpfixError {
    fn from(err: std::io::Error) -> Self {
        IpfixError::Io(err)
    }
}
