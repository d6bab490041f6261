//! Transport collaborator interfaces.
//!
//! The core performs no I/O of its own: a [`MessageBuffer`]
//! (crate::message::MessageBuffer) hands complete framed messages to an
//! [`Exporter`] and pulls complete framed messages from a [`Collector`].
//! Concrete transports (file, TCP, UDP, TLS, ...) live outside this
//! crate; the in-memory implementations here back tests and
//! applications that do their own framing.

use crate::IpfixError;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Sink for complete framed IPFIX messages.
pub trait Exporter {
    fn open(&mut self) -> Result<(), IpfixError>;

    /// Writes one complete message. `msg` is a whole frame; partial
    /// writes are the implementation's problem.
    fn write(&mut self, msg: &[u8]) -> Result<(), IpfixError>;

    fn close(&mut self);

    /// Largest message this transport can carry. Never below 32.
    fn mtu(&self) -> u16 {
        u16::MAX
    }
}

/// Source of complete framed IPFIX messages.
pub trait Collector {
    /// Reads exactly one framed message into `buf` and returns its
    /// length. 0 is clean end of stream; a message that does not fit is
    /// [`IpfixError::BufferTooSmall`].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IpfixError>;

    /// Wakes a blocked [`read`](Self::read); the interrupted call
    /// returns [`IpfixError::Interrupted`]. Default: nothing to wake.
    fn interrupt(&self) {}
}

/// Shared in-memory message store, cloneable on the cheap so a test or
/// application keeps a handle after moving the transport into a buffer.
#[derive(Clone, Default, Debug)]
pub struct MessageLog {
    messages: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: Vec<u8>) {
        self.messages.borrow_mut().push(msg);
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }

    /// Copies out message `i`.
    pub fn get(&self, i: usize) -> Option<Vec<u8>> {
        self.messages.borrow().get(i).cloned()
    }

    /// Drains all messages in arrival order.
    pub fn take_all(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.messages.borrow_mut())
    }
}

/// Exporter that appends every emitted message to a [`MessageLog`].
#[derive(Debug)]
pub struct BufferExporter {
    log: MessageLog,
    mtu: u16,
    open: bool,
}

impl BufferExporter {
    pub fn new(log: MessageLog) -> Self {
        Self {
            log,
            mtu: u16::MAX,
            open: false,
        }
    }

    pub fn with_mtu(log: MessageLog, mtu: u16) -> Self {
        Self {
            log,
            mtu,
            open: false,
        }
    }
}

impl Exporter for BufferExporter {
    fn open(&mut self) -> Result<(), IpfixError> {
        self.open = true;
        Ok(())
    }

    fn write(&mut self, msg: &[u8]) -> Result<(), IpfixError> {
        if !self.open {
            return Err(IpfixError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "exporter is not open",
            )));
        }
        self.log.push(msg.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

/// Collector that replays a queue of framed messages.
#[derive(Debug, Default)]
pub struct BufferCollector {
    messages: VecDeque<Vec<u8>>,
}

impl BufferCollector {
    pub fn new(messages: Vec<Vec<u8>>) -> Self {
        Self {
            messages: messages.into(),
        }
    }

    /// Replays everything an exporter wrote into `log`.
    pub fn from_log(log: &MessageLog) -> Self {
        Self::new(log.take_all())
    }
}

impl Collector for BufferCollector {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IpfixError> {
        let Some(msg) = self.messages.pop_front() else {
            return Ok(0);
        };
        if msg.len() > buf.len() {
            return Err(IpfixError::BufferTooSmall {
                need: msg.len(),
                capacity: buf.len(),
            });
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }
}
