//! The message buffer: the framing state machine that turns appended
//! records into framed IPFIX messages for an [`Exporter`], and framed
//! messages from a [`Collector`] back into records.
//!
//! A buffer owns its [`Session`] and is bound to exactly one transport
//! direction. It is single-owner and single-threaded; the only calls
//! that may block are the collaborator's `read` and `write`.

use crate::IpfixError;
use crate::session::{NewTemplateHook, Session};
use crate::template::{TID_MIN_DATA, TID_OPTIONS_TEMPLATE_SET, TID_TEMPLATE_SET, Template};
use crate::transcode::{Decoder, Encoder, PlanCache};
use crate::transport::{Collector, Exporter};
use crate::values::Record;

use log::warn;
use nom_derive::{Nom, Parse};

use std::any::Any;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame capacity: the largest message IPFIX can describe.
const MSG_BUF_LEN: usize = 65535;
/// Wire size of the message header.
const MSG_HEADER_LEN: usize = 16;
/// Protocol version carried in every message header.
const IPFIX_VERSION: u16 = 0x000A;
/// Smallest MTU an exporter may report.
const MTU_MIN: u16 = 32;

/// IPFIX message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
struct MessageHeader {
    version: u16,
    length: u16,
    export_time: u32,
    sequence: u32,
    domain: u32,
}

/// One field specifier of a template record. The high bit of the raw id
/// flags a trailing enterprise number.
#[derive(Debug, Clone, Copy, Nom)]
struct FieldSpecifier {
    raw_id: u16,
    length: u16,
    #[nom(Cond = "raw_id & 0x8000 != 0")]
    enterprise: Option<u32>,
}

impl FieldSpecifier {
    fn identity(&self) -> (u32, u16) {
        (self.enterprise.unwrap_or(0), self.raw_id & 0x7FFF)
    }
}

/// Builder for [`MessageBuffer`], covering the knobs that are fixed for
/// a buffer's lifetime.
#[derive(Clone, Default)]
pub struct MessageBufferBuilder {
    automatic: Option<bool>,
    trust_framing: bool,
    export_time: u32,
    hook: Option<NewTemplateHook>,
}

impl std::fmt::Debug for MessageBufferBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBufferBuilder")
            .field("automatic", &self.automatic)
            .field("trust_framing", &self.trust_framing)
            .field("export_time", &self.export_time)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl MessageBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Automatic mode: end-of-message failures flush and retry on write,
    /// and advance to the next message on read. On by default.
    #[must_use]
    pub fn with_automatic(mut self, automatic: bool) -> Self {
        self.automatic = Some(automatic);
        self
    }

    /// Trust the collector's framing over the header length field, for
    /// collectors that rewrite messages in flight.
    #[must_use]
    pub fn with_trust_framing(mut self, trust: bool) -> Self {
        self.trust_framing = trust;
        self
    }

    /// Fixed export time for emitted messages; 0 (the default) stamps
    /// each message with the wall clock at header append.
    #[must_use]
    pub fn with_export_time(mut self, export_time: u32) -> Self {
        self.export_time = export_time;
        self
    }

    /// Registers the session's new-template callback.
    #[must_use]
    pub fn on_new_template<F>(mut self, hook: F) -> Self
    where
        F: Fn(u16, &Arc<Template>) -> Option<Box<dyn Any>> + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Builds a buffer that frames appended records for `exporter`.
    pub fn build_export(
        self,
        session: Session,
        exporter: Box<dyn Exporter>,
    ) -> Result<MessageBuffer, IpfixError> {
        let mtu = exporter.mtu();
        if mtu < MTU_MIN {
            return Err(IpfixError::BufferTooSmall {
                need: MTU_MIN as usize,
                capacity: mtu as usize,
            });
        }
        Ok(self.build(session, Some(exporter), None))
    }

    /// Builds a buffer that decodes messages produced by `collector`.
    pub fn build_collect(self, session: Session, collector: Box<dyn Collector>) -> MessageBuffer {
        self.build(session, None, Some(collector))
    }

    fn build(
        self,
        mut session: Session,
        exporter: Option<Box<dyn Exporter>>,
        collector: Option<Box<dyn Collector>>,
    ) -> MessageBuffer {
        if let Some(hook) = self.hook.clone() {
            session.on_new_template(move |tid, tmpl| hook(tid, tmpl));
        }
        let seen_generation = session.generation();
        MessageBuffer {
            buf: vec![0; MSG_BUF_LEN],
            cp: 0,
            mep: 0,
            msgbase: None,
            setbase: None,
            sep: 0,
            rc: 0,
            extime: self.export_time,
            int_tid: 0,
            ext_tid: 0,
            int_tmpl: None,
            ext_tmpl: None,
            spec_tid: None,
            automatic: self.automatic.unwrap_or(true),
            trust_framing: self.trust_framing,
            seen_generation,
            plans: PlanCache::new(),
            session,
            exporter,
            exporter_open: false,
            collector,
        }
    }
}

/// Framing state machine over one 65535-octet frame.
pub struct MessageBuffer {
    buf: Vec<u8>,
    /// Write/read cursor.
    cp: usize,
    /// End of the usable frame: MTU-bounded on write, message end on read.
    mep: usize,
    msgbase: Option<usize>,
    setbase: Option<usize>,
    sep: usize,
    /// Records appended or extracted since the last emit/rewind.
    rc: u32,
    extime: u32,
    int_tid: u16,
    ext_tid: u16,
    int_tmpl: Option<Arc<Template>>,
    ext_tmpl: Option<Arc<Template>>,
    /// Pending template-set id while exporting or consuming templates.
    spec_tid: Option<u16>,
    automatic: bool,
    trust_framing: bool,
    seen_generation: u64,
    plans: PlanCache,
    session: Session,
    exporter: Option<Box<dyn Exporter>>,
    exporter_open: bool,
    collector: Option<Box<dyn Collector>>,
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("cp", &self.cp)
            .field("mep", &self.mep)
            .field("msgbase", &self.msgbase)
            .field("setbase", &self.setbase)
            .field("rc", &self.rc)
            .field("int_tid", &self.int_tid)
            .field("ext_tid", &self.ext_tid)
            .field("spec_tid", &self.spec_tid)
            .field("automatic", &self.automatic)
            .field("session", &self.session)
            .finish()
    }
}

impl MessageBuffer {
    pub fn builder() -> MessageBufferBuilder {
        MessageBufferBuilder::new()
    }

    /// Export buffer with default settings.
    pub fn for_export(session: Session, exporter: Box<dyn Exporter>) -> Result<Self, IpfixError> {
        MessageBufferBuilder::new().build_export(session, exporter)
    }

    /// Collection buffer with default settings.
    pub fn for_collection(session: Session, collector: Box<dyn Collector>) -> Self {
        MessageBufferBuilder::new().build_collect(session, collector)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Tears the buffer down, handing the session back.
    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn automatic(&self) -> bool {
        self.automatic
    }

    pub fn set_automatic(&mut self, automatic: bool) {
        self.automatic = automatic;
    }

    pub fn set_export_time(&mut self, export_time: u32) {
        self.extime = export_time;
    }

    /// Export time of the message being read, or the configured stamp on
    /// the write side.
    pub fn export_time(&self) -> u32 {
        self.extime
    }

    pub fn export_template(&self) -> u16 {
        self.ext_tid
    }

    pub fn internal_template(&self) -> u16 {
        self.int_tid
    }

    /// Unblocks a pending collector read; the interrupted operation
    /// fails with [`IpfixError::Interrupted`].
    pub fn interrupt(&self) {
        if let Some(collector) = &self.collector {
            collector.interrupt();
        }
    }

    // -----------------------------------------------------------------
    // Cursor helpers
    // -----------------------------------------------------------------

    fn rem_msg(&self) -> usize {
        self.mep.saturating_sub(self.cp)
    }

    fn rem_set(&self) -> usize {
        self.sep.saturating_sub(self.cp)
    }

    fn put_u8(&mut self, val: u8) -> Result<(), IpfixError> {
        if self.cp + 1 > self.mep {
            return Err(IpfixError::EndOfMessage {
                need: 1,
                available: self.rem_msg(),
            });
        }
        self.buf[self.cp] = val;
        self.cp += 1;
        Ok(())
    }

    fn put_u16(&mut self, val: u16) -> Result<(), IpfixError> {
        if self.cp + 2 > self.mep {
            return Err(IpfixError::EndOfMessage {
                need: 2,
                available: self.rem_msg(),
            });
        }
        self.buf[self.cp..self.cp + 2].copy_from_slice(&val.to_be_bytes());
        self.cp += 2;
        Ok(())
    }

    fn put_u32(&mut self, val: u32) -> Result<(), IpfixError> {
        if self.cp + 4 > self.mep {
            return Err(IpfixError::EndOfMessage {
                need: 4,
                available: self.rem_msg(),
            });
        }
        self.buf[self.cp..self.cp + 4].copy_from_slice(&val.to_be_bytes());
        self.cp += 4;
        Ok(())
    }

    fn patch_u16(&mut self, at: usize, val: u16) {
        self.buf[at..at + 2].copy_from_slice(&val.to_be_bytes());
    }

    fn rd_u16(&mut self) -> Result<u16, IpfixError> {
        if self.cp + 2 > self.mep {
            return Err(IpfixError::EndOfMessage {
                need: 2,
                available: self.rem_msg(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.cp], self.buf[self.cp + 1]]);
        self.cp += 2;
        Ok(val)
    }

    fn rewind(&mut self) {
        self.cp = 0;
        self.mep = 0;
        self.msgbase = None;
        self.setbase = None;
        self.sep = 0;
        self.rc = 0;
    }

    /// Drops cached plans and re-resolves bound templates after any
    /// session template-table mutation.
    fn sync_session_generation(&mut self) {
        let generation = self.session.generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;
        self.plans.clear();
        if self.ext_tmpl.is_some() {
            self.ext_tmpl = self.session.get_external(self.ext_tid);
        }
        if self.int_tmpl.is_some() {
            self.int_tmpl = self.session.get_internal(self.int_tid);
        }
    }

    // -----------------------------------------------------------------
    // Template binding
    // -----------------------------------------------------------------

    /// Binds the wire layout data records are appended under. Changing
    /// the template closes the open set.
    pub fn set_export_template(&mut self, tid: u16) -> Result<(), IpfixError> {
        self.sync_session_generation();
        if self.ext_tmpl.is_none() || self.ext_tid != tid {
            let tmpl = self
                .session
                .get_external(tid)
                .ok_or(IpfixError::MissingTemplate { template_id: tid })?;
            self.ext_tid = tid;
            self.ext_tmpl = Some(tmpl);
            self.close_set();
        }
        Ok(())
    }

    /// Binds the internal layout records take in memory. Without a
    /// binding, the pair map resolves a layout per data set.
    pub fn set_internal_template(&mut self, tid: u16) -> Result<(), IpfixError> {
        self.sync_session_generation();
        if self.int_tmpl.is_none() || self.int_tid != tid {
            let tmpl = self
                .session
                .get_internal(tid)
                .ok_or(IpfixError::MissingTemplate { template_id: tid })?;
            self.int_tid = tid;
            self.int_tmpl = Some(tmpl);
        }
        Ok(())
    }

    pub fn clear_internal_template(&mut self) {
        self.int_tid = 0;
        self.int_tmpl = None;
    }

    // -----------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------

    fn wall_time() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32)
    }

    fn append_message_header(&mut self) -> Result<(), IpfixError> {
        let mtu = self
            .exporter
            .as_ref()
            .map(|e| e.mtu())
            .ok_or_else(|| IpfixError::Protocol {
                context: "message buffer is not configured for export".to_string(),
            })?;
        self.cp = 0;
        self.mep = MSG_BUF_LEN.min(mtu as usize);
        self.msgbase = Some(0);

        self.put_u16(IPFIX_VERSION)?;
        self.put_u16(0)?; // patched at emit
        let time = if self.extime != 0 {
            self.extime
        } else {
            Self::wall_time()
        };
        self.put_u32(time)?;
        self.put_u32(self.session.sequence())?;
        self.put_u32(self.session.domain())?;
        Ok(())
    }

    fn append_set_header(&mut self) -> Result<(), IpfixError> {
        let (set_id, set_minlen) = match self.spec_tid {
            Some(tid) => (tid, 4),
            None => {
                let tmpl = self.ext_tmpl.as_ref().ok_or_else(|| IpfixError::Protocol {
                    context: "no export template bound".to_string(),
                })?;
                (self.ext_tid, 4 + tmpl.wire_min_len() as usize)
            }
        };
        // room for the set header and at least one record
        if self.rem_msg() < set_minlen {
            return Err(IpfixError::EndOfMessage {
                need: set_minlen,
                available: self.rem_msg(),
            });
        }
        self.setbase = Some(self.cp);
        self.put_u16(set_id)?;
        self.put_u16(0)?; // patched at close
        Ok(())
    }

    fn close_set(&mut self) {
        if let Some(base) = self.setbase.take() {
            let len = (self.cp - base) as u16;
            self.patch_u16(base + 2, len);
        }
    }

    fn append_template_single(
        &mut self,
        tid: u16,
        tmpl: Option<&Arc<Template>>,
        revoked: bool,
    ) -> Result<(), IpfixError> {
        if self.msgbase.is_none() {
            self.append_message_header()?;
        }

        let spec = match tmpl {
            Some(t) if t.is_options() => TID_OPTIONS_TEMPLATE_SET,
            _ => TID_TEMPLATE_SET,
        };
        if self.spec_tid != Some(spec) {
            self.spec_tid = Some(spec);
            self.close_set();
        }
        if self.setbase.is_none() {
            self.append_set_header()?;
        }

        if revoked {
            if self.rem_msg() < 4 {
                return Err(IpfixError::EndOfMessage {
                    need: 4,
                    available: self.rem_msg(),
                });
            }
            self.put_u16(tid)?;
            self.put_u16(0)?;
            return Ok(());
        }

        let tmpl = tmpl
            .ok_or(IpfixError::MissingTemplate { template_id: tid })?
            .clone();
        let record_len = tmpl.record_len() as usize;
        if self.rem_msg() < record_len {
            return Err(IpfixError::EndOfMessage {
                need: record_len,
                available: self.rem_msg(),
            });
        }

        self.put_u16(tid)?;
        self.put_u16(tmpl.len() as u16)?;
        if tmpl.is_options() {
            self.put_u16(tmpl.scope_count())?;
        }
        for field in tmpl.fields() {
            if field.element.ent != 0 {
                self.put_u16(field.element.num | 0x8000)?;
                self.put_u16(field.length)?;
                self.put_u32(field.element.ent)?;
            } else {
                self.put_u16(field.element.num)?;
                self.put_u16(field.length)?;
            }
        }
        Ok(())
    }

    fn retry_eom<T>(
        &mut self,
        first: Result<T, IpfixError>,
        retry: impl FnOnce(&mut Self) -> Result<T, IpfixError>,
    ) -> Result<T, IpfixError> {
        match first {
            Err(IpfixError::EndOfMessage { .. }) if self.automatic => {
                self.emit()?;
                retry(self)
            }
            other => other,
        }
    }

    /// Appends the template record announcing external template `tid`.
    /// Template sets precede data sets within a message; appending a
    /// template while a data set is open starts the matching template
    /// set (flushing first in automatic mode when space ran out).
    pub fn append_template(&mut self, tid: u16) -> Result<(), IpfixError> {
        self.sync_session_generation();
        let tmpl = self
            .session
            .get_external(tid)
            .ok_or(IpfixError::MissingTemplate { template_id: tid })?;
        let first = self.append_template_single(tid, Some(&tmpl), false);
        self.retry_eom(first, |buf| buf.append_template_single(tid, Some(&tmpl), false))
    }

    /// Appends a template withdrawal for `tid`.
    pub fn append_template_revocation(&mut self, tid: u16) -> Result<(), IpfixError> {
        self.sync_session_generation();
        let tmpl = self.session.get_external(tid);
        let first = self.append_template_single(tid, tmpl.as_ref(), true);
        self.retry_eom(first, |buf| buf.append_template_single(tid, tmpl.as_ref(), true))
    }

    /// Announces every template in the session's external table.
    pub fn export_templates(&mut self) -> Result<(), IpfixError> {
        let tids: Vec<u16> = self.session.external_ids().collect();
        for tid in tids {
            self.append_template(tid)?;
        }
        Ok(())
    }

    fn append_single(&mut self, record: &Record) -> Result<(), IpfixError> {
        let ext = self.ext_tmpl.clone().ok_or_else(|| IpfixError::Protocol {
            context: "no export template bound".to_string(),
        })?;
        let int = self.int_tmpl.clone().unwrap_or_else(|| ext.clone());

        // leaving template-export mode ends the template set
        if self.spec_tid.take().is_some() {
            self.close_set();
        }
        if self.msgbase.is_none() {
            self.append_message_header()?;
        }
        if self.setbase.is_none() {
            self.append_set_header()?;
        }

        let (cp, mep) = (self.cp, self.mep);
        let used = {
            let mut encoder = Encoder::new(&self.session, &mut self.plans, int, ext);
            encoder.encode_record(record, &mut self.buf[cp..mep])?
        };
        self.cp += used;
        self.rc += 1;
        Ok(())
    }

    /// Appends one data record under the bound export template. In
    /// automatic mode a full message is emitted and the append retried
    /// once.
    pub fn append(&mut self, record: &Record) -> Result<(), IpfixError> {
        self.sync_session_generation();
        let first = self.append_single(record);
        self.retry_eom(first, |buf| buf.append_single(record))
    }

    /// Closes the active message and hands it to the exporter. The
    /// session sequence number advances by the records emitted. A buffer
    /// with no active message is a no-op.
    pub fn emit(&mut self) -> Result<(), IpfixError> {
        let Some(base) = self.msgbase else {
            return Ok(());
        };
        self.close_set();
        let len = (self.cp - base) as u16;
        self.patch_u16(base + 2, len);

        let exporter = self.exporter.as_mut().ok_or_else(|| IpfixError::Protocol {
            context: "message buffer is not configured for export".to_string(),
        })?;
        if !self.exporter_open {
            exporter.open()?;
            self.exporter_open = true;
        }
        exporter.write(&self.buf[..self.cp])?;

        let rc = self.rc;
        self.session.advance_sequence(rc);
        self.rewind();
        Ok(())
    }

    /// Emits any pending message and closes the exporter.
    pub fn close(&mut self) -> Result<(), IpfixError> {
        self.emit()?;
        if let Some(exporter) = self.exporter.as_mut() {
            if self.exporter_open {
                exporter.close();
                self.exporter_open = false;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------

    /// Reads and validates the next framed message. `Ok(false)` is clean
    /// end of stream.
    pub fn next_message(&mut self) -> Result<bool, IpfixError> {
        self.ext_tid = 0;
        self.ext_tmpl = None;
        self.rewind();

        let len = {
            let collector = self
                .collector
                .as_mut()
                .ok_or_else(|| IpfixError::Protocol {
                    context: "message buffer is not configured for collection".to_string(),
                })?;
            collector.read(&mut self.buf)?
        };
        if len == 0 {
            return Ok(false);
        }
        self.mep = len;

        if len < MSG_HEADER_LEN {
            return Err(IpfixError::EndOfMessage {
                need: MSG_HEADER_LEN,
                available: len,
            });
        }
        let (_, header) =
            MessageHeader::parse(&self.buf[..len]).map_err(|_| IpfixError::Protocol {
                context: "unreadable message header".to_string(),
            })?;

        if header.version != IPFIX_VERSION {
            return Err(IpfixError::Protocol {
                context: format!(
                    "illegal IPFIX version {:#06x}; input is probably not an IPFIX stream",
                    header.version
                ),
            });
        }
        if header.length as usize != len && !self.trust_framing {
            return Err(IpfixError::Protocol {
                context: format!(
                    "message length mismatch (transport {len}, header {})",
                    header.length
                ),
            });
        }

        self.extime = header.export_time;
        self.session.set_domain(header.domain);

        let expected = self.session.sequence();
        if expected != header.sequence {
            if expected != 0 {
                warn!(
                    "IPFIX message out of sequence (domain {:#010x}, expected {:#010x}, got {:#010x})",
                    header.domain, expected, header.sequence
                );
            }
            self.session.set_sequence(header.sequence);
        }

        self.msgbase = Some(0);
        self.cp = MSG_HEADER_LEN;
        Ok(true)
    }

    fn skip_current_set(&mut self) {
        if self.setbase.take().is_some() {
            self.cp = self.sep;
        }
    }

    fn next_set_header(&mut self) -> Result<(), IpfixError> {
        // may skip over sets whose template is missing
        loop {
            if self.rem_msg() < 4 {
                return Err(IpfixError::EndOfMessage {
                    need: 4,
                    available: self.rem_msg(),
                });
            }
            let set_id = self.rd_u16()?;
            let set_len = self.rd_u16()? as usize;
            if set_len < 4 {
                return Err(IpfixError::Protocol {
                    context: format!("illegal IPFIX set length {set_len}"),
                });
            }
            if set_len - 4 > self.rem_msg() {
                return Err(IpfixError::EndOfMessage {
                    need: set_len - 4,
                    available: self.rem_msg(),
                });
            }

            if set_id < TID_MIN_DATA {
                if set_id != TID_TEMPLATE_SET && set_id != TID_OPTIONS_TEMPLATE_SET {
                    return Err(IpfixError::Protocol {
                        context: format!("illegal IPFIX set id {set_id:#06x}"),
                    });
                }
                self.spec_tid = Some(set_id);
            } else if self.ext_tmpl.is_none() || self.ext_tid != set_id {
                self.spec_tid = None;
                self.ext_tid = set_id;
                match self.session.get_external(set_id) {
                    Some(tmpl) => self.ext_tmpl = Some(tmpl),
                    None => {
                        warn!("skipping set: no template {set_id:#06x} present");
                        self.ext_tmpl = None;
                        self.setbase = Some(self.cp - 4);
                        self.sep = self.cp - 4 + set_len;
                        self.skip_current_set();
                        continue;
                    }
                }
            } else {
                self.spec_tid = None;
            }

            self.setbase = Some(self.cp - 4);
            self.sep = self.cp - 4 + set_len;
            return Ok(());
        }
    }

    /// Consumes every template record in the pending (options-)template
    /// set. Malformed records are skipped with a warning; withdrawals
    /// and redefinitions go through the session.
    fn consume_template_set(&mut self) -> Result<(), IpfixError> {
        let options = self.spec_tid == Some(TID_OPTIONS_TEMPLATE_SET);

        // keep reading until only padding remains
        while self.rem_set() >= 4 {
            let tid = self.rd_u16()?;
            let field_count = self.rd_u16()?;

            if field_count == 0 {
                // template withdrawal; unknown ids are ignored
                if tid >= TID_MIN_DATA {
                    self.session.remove_external(tid);
                    if self.ext_tid == tid {
                        self.ext_tmpl = None;
                        self.ext_tid = 0;
                    }
                } else {
                    warn!("ignoring withdrawal of reserved template id {tid:#06x}");
                }
                continue;
            }

            if 4 * field_count as usize > self.rem_set() {
                warn!(
                    "end of set reading template record {tid:#06x} (need {} bytes, {} available)",
                    4 * field_count,
                    self.rem_set()
                );
                self.skip_current_set();
                break;
            }

            let mut scope_count = 0;
            let mut valid = tid >= TID_MIN_DATA;
            if !valid {
                warn!("ignoring template {tid:#06x}: reserved template id");
            }
            if options {
                scope_count = self.rd_u16()?;
                if scope_count == 0 || scope_count > field_count {
                    warn!(
                        "ignoring template {tid:#06x}: illegal options scope count {scope_count} of {field_count}"
                    );
                    valid = false;
                }
            }

            let mut tmpl = Template::new();
            for _ in 0..field_count {
                let parsed = {
                    let input = &self.buf[self.cp..self.sep];
                    FieldSpecifier::parse(input)
                        .ok()
                        .map(|(rest, spec)| (input.len() - rest.len(), spec))
                };
                let Some((consumed, spec)) = parsed else {
                    warn!("end of set reading template record {tid:#06x}");
                    self.skip_current_set();
                    self.spec_tid = None;
                    return Ok(());
                };
                self.cp += consumed;

                if !valid {
                    continue;
                }
                let (ent, num) = spec.identity();
                let element = match self.session.model().lookup(ent, num) {
                    Some(element) => element,
                    None => self.session.model_mut().add_alien(ent, num, spec.length),
                };
                if let Err(err) = tmpl.append(element, spec.length) {
                    warn!("ignoring template {tid:#06x}: {err}");
                    valid = false;
                }
            }
            if !valid {
                continue;
            }
            if scope_count != 0 {
                if let Err(err) = tmpl.set_scope_count(scope_count) {
                    warn!("ignoring template {tid:#06x}: {err}");
                    continue;
                }
            }

            let tmpl = self.session.add_external(tid, tmpl)?;
            if let Some(hook) = self.session.hook() {
                let ctx = hook(tid, &tmpl);
                self.session.set_template_ctx(tid, ctx);
            }
            // drop a stale binding so a following data set re-resolves
            if self.ext_tid == tid {
                self.ext_tmpl = None;
                self.ext_tid = 0;
            }
        }

        self.skip_current_set();
        self.spec_tid = None;
        Ok(())
    }

    fn next_data_set(&mut self) -> Result<(), IpfixError> {
        loop {
            self.next_set_header()?;
            if self.spec_tid.is_some() {
                self.consume_template_set()?;
                self.sync_session_generation();
                continue;
            }
            return Ok(());
        }
    }

    fn next_record_single(&mut self) -> Result<Option<Record>, IpfixError> {
        if self.msgbase.is_none() && !self.next_message()? {
            return Ok(None);
        }

        loop {
            // trailing bytes shorter than a minimum record are padding
            if self.setbase.is_some() {
                let min_len = self.ext_tmpl.as_ref().map(|e| e.wire_min_len() as usize);
                if min_len.is_some_and(|min_len| self.rem_set() < min_len) {
                    self.skip_current_set();
                }
            }
            if self.setbase.is_none() {
                self.next_data_set()?;
            }

            let ext = self.ext_tmpl.clone().ok_or(IpfixError::MissingTemplate {
                template_id: self.ext_tid,
            })?;
            let int = match &self.int_tmpl {
                Some(tmpl) => tmpl.clone(),
                None => {
                    let int_tid = self.session.lookup_template_pair(self.ext_tid);
                    if int_tid == 0 {
                        warn!("dropping data set {:#06x} per template pair", self.ext_tid);
                        self.skip_current_set();
                        continue;
                    }
                    if int_tid == self.ext_tid {
                        self.session
                            .get_internal(int_tid)
                            .unwrap_or_else(|| ext.clone())
                    } else {
                        self.session
                            .get_internal(int_tid)
                            .ok_or(IpfixError::MissingTemplate {
                                template_id: int_tid,
                            })?
                    }
                }
            };

            let (cp, sep) = (self.cp, self.sep);
            let (record, used) = {
                let src = &self.buf[cp..sep];
                let mut decoder = Decoder::new(&mut self.session, &mut self.plans, int, ext);
                decoder.decode_record(src)?
            };
            self.cp += used;
            self.rc += 1;
            return Ok(Some(record));
        }
    }

    /// Extracts the next data record, reading messages and consuming
    /// template sets as needed. `Ok(None)` is clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<Record>, IpfixError> {
        self.sync_session_generation();
        loop {
            match self.next_record_single() {
                Err(IpfixError::EndOfMessage { need, available }) => {
                    // finish this message and move to the next
                    let rc = self.rc;
                    self.session.advance_sequence(rc);
                    self.rewind();
                    if !self.automatic {
                        return Err(IpfixError::EndOfMessage { need, available });
                    }
                }
                other => return other,
            }
        }
    }

    /// Iterator over the remaining records of the stream. Stops at the
    /// first error; clean end of stream simply ends the iteration.
    pub fn records(&mut self) -> Records<'_> {
        Records {
            buf: self,
            done: false,
        }
    }
}

/// Iterator adapter over [`MessageBuffer::next_record`].
pub struct Records<'a> {
    buf: &'a mut MessageBuffer,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, IpfixError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.buf.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
