//! Transport-session state: template tables, the external→internal pair
//! map, sequence numbering and the observation domain.
//!
//! A session keeps two template tables. The *external* table holds wire
//! layouts: announced to the peer on export, learned from the peer on
//! collection. The *internal* table holds the layouts application records
//! take in memory. The pair map tells the decoder which internal layout
//! to materialize for a given external id; unmapped ids resolve to
//! themselves, and an explicit mapping to 0 drops that id's sub-list
//! contents.
//!
//! Templates are immutable once installed and shared via `Arc`. Any table
//! mutation bumps a generation counter; the owning
//! [`MessageBuffer`](crate::message::MessageBuffer) watches it to drop
//! cached transcode plans and re-resolve its bound templates.

use crate::IpfixError;
use crate::info_model::InfoModel;
use crate::template::{TID_MIN_DATA, Template};

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callback invoked once per newly accepted external template.
///
/// The returned context is owned by the session, retrievable with
/// [`Session::template_ctx`], and dropped when the template is revoked or
/// redefined.
pub type NewTemplateHook = Arc<dyn Fn(u16, &Arc<Template>) -> Option<Box<dyn Any>>>;

/// Per-(peer, observation domain) template and sequence state.
pub struct Session {
    model: InfoModel,
    external: BTreeMap<u16, Arc<Template>>,
    internal: BTreeMap<u16, Arc<Template>>,
    pairs: BTreeMap<u16, u16>,
    ctx: BTreeMap<u16, Box<dyn Any>>,
    hook: Option<NewTemplateHook>,
    sequence: u32,
    domain: u32,
    generation: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("external", &self.external.keys().collect::<Vec<_>>())
            .field("internal", &self.internal.keys().collect::<Vec<_>>())
            .field("pairs", &self.pairs)
            .field("sequence", &self.sequence)
            .field("domain", &self.domain)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(InfoModel::default())
    }
}

impl Session {
    pub fn new(model: InfoModel) -> Self {
        Self {
            model,
            external: BTreeMap::new(),
            internal: BTreeMap::new(),
            pairs: BTreeMap::new(),
            ctx: BTreeMap::new(),
            hook: None,
            sequence: 0,
            domain: 0,
            generation: 0,
        }
    }

    fn check_tid(tid: u16) -> Result<(), IpfixError> {
        if tid < TID_MIN_DATA {
            return Err(IpfixError::Protocol {
                context: format!("illegal data template id {tid} (must be >= {TID_MIN_DATA})"),
            });
        }
        Ok(())
    }

    /// Installs an application-declared record layout. Templates with a
    /// defaulted element length are rejected to keep records immune to
    /// registry-side default changes.
    pub fn add_internal(&mut self, tid: u16, tmpl: Template) -> Result<Arc<Template>, IpfixError> {
        Self::check_tid(tid)?;
        if tmpl.is_defaulted() {
            return Err(IpfixError::DefaultedLength { template_id: tid });
        }
        let tmpl = Arc::new(tmpl);
        self.internal.insert(tid, tmpl.clone());
        self.generation += 1;
        Ok(tmpl)
    }

    /// Installs a wire layout. Redefinition under a live id is allowed;
    /// plans built against the old template are invalidated through the
    /// generation counter, and its context is dropped.
    pub fn add_external(&mut self, tid: u16, tmpl: Template) -> Result<Arc<Template>, IpfixError> {
        Self::check_tid(tid)?;
        let tmpl = Arc::new(tmpl);
        if self.external.insert(tid, tmpl.clone()).is_some() {
            self.ctx.remove(&tid);
        }
        self.generation += 1;
        Ok(tmpl)
    }

    pub fn get_external(&self, tid: u16) -> Option<Arc<Template>> {
        self.external.get(&tid).cloned()
    }

    pub fn get_internal(&self, tid: u16) -> Option<Arc<Template>> {
        self.internal.get(&tid).cloned()
    }

    pub fn external_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.external.keys().copied()
    }

    pub fn internal_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.internal.keys().copied()
    }

    /// Handles a template withdrawal. Unknown ids are ignored.
    pub fn remove_external(&mut self, tid: u16) -> bool {
        self.ctx.remove(&tid);
        if self.external.remove(&tid).is_some() {
            self.generation += 1;
            true
        } else {
            false
        }
    }

    /// Maps an external id to the internal layout the decoder should
    /// materialize. An `int_tid` of 0 drops sub-list contents under
    /// `ext_tid`.
    pub fn set_template_pair(&mut self, ext_tid: u16, int_tid: u16) {
        self.pairs.insert(ext_tid, int_tid);
    }

    /// Resolves the pair map; identity when unmapped.
    pub fn lookup_template_pair(&self, ext_tid: u16) -> u16 {
        self.pairs.get(&ext_tid).copied().unwrap_or(ext_tid)
    }

    /// Registers the new-template callback.
    pub fn on_new_template<F>(&mut self, hook: F)
    where
        F: Fn(u16, &Arc<Template>) -> Option<Box<dyn Any>> + 'static,
    {
        self.hook = Some(Arc::new(hook));
    }

    pub(crate) fn hook(&self) -> Option<NewTemplateHook> {
        self.hook.clone()
    }

    pub(crate) fn set_template_ctx(&mut self, tid: u16, ctx: Option<Box<dyn Any>>) {
        match ctx {
            Some(ctx) => {
                self.ctx.insert(tid, ctx);
            }
            None => {
                self.ctx.remove(&tid);
            }
        }
    }

    /// Context produced by the new-template callback for `tid`.
    pub fn template_ctx(&self, tid: u16) -> Option<&dyn Any> {
        self.ctx.get(&tid).map(|b| b.as_ref())
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    pub(crate) fn advance_sequence(&mut self, records: u32) {
        self.sequence = self.sequence.wrapping_add(records);
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    pub fn set_domain(&mut self, domain: u32) {
        self.domain = domain;
    }

    pub fn model(&self) -> &InfoModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut InfoModel {
        &mut self.model
    }

    /// Monotone counter bumped on every template-table mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
