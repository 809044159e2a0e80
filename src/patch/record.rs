//! Patch declarations and the process-wide patch table.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use dashmap::DashMap;
use strum::{Display, EnumIter};

use crate::{
    assembly::{Fingerprint, InstructionStream},
    events::EventKind,
    metadata::token::Token,
    patch::{anchor::AnchorPattern, block::PatchBlock},
    Error, Result,
};

/// Lifecycle state of a patch record.
///
/// ```text
/// Pending ──install──▶ Installed ──rollback──▶ RolledBack
///    │                                            │
///    └──────────── failure ──▶ Failed ◀── failure ┘
/// ```
///
/// `Failed` is terminal: the method body was left exactly as before and the cause was
/// recorded as a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum InstallState {
    /// Declared, never installed
    Pending,
    /// The edited body is live
    Installed,
    /// The original body was restored
    RolledBack,
    /// Install failed; the body was not touched
    Failed,
}

/// Identifier of a declared patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(pub u64);

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declaration of a patch: where, what, and which event it raises.
///
/// # Examples
///
/// ```rust
/// use dotpatch::events::EventKind;
/// use dotpatch::metadata::token::Token;
/// use dotpatch::patch::{AnchorPattern, Patch, PatchBlock};
///
/// let patch = Patch::new("ReservedSlotPatch")
///     .target(Token::method_def(0x42))
///     .anchor(AnchorPattern::before_last_return())
///     .insert(PatchBlock::default())
///     .event(EventKind::RESERVED_SLOT);
/// assert_eq!(patch.name(), "ReservedSlotPatch");
/// ```
#[derive(Debug, Clone)]
pub struct Patch {
    name: Arc<str>,
    target: Option<Token>,
    anchor: Option<AnchorPattern>,
    block: Option<PatchBlock>,
    event: Option<EventKind>,
}

impl Patch {
    /// Starts a declaration.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            target: None,
            anchor: None,
            block: None,
            event: None,
        }
    }

    /// Sets the method to patch.
    #[must_use]
    pub fn target(mut self, method: Token) -> Self {
        self.target = Some(method);
        self
    }

    /// Sets the anchor pattern.
    #[must_use]
    pub fn anchor(mut self, pattern: AnchorPattern) -> Self {
        self.anchor = Some(pattern);
        self
    }

    /// Sets the block to insert.
    #[must_use]
    pub fn insert(mut self, block: PatchBlock) -> Self {
        self.block = Some(block);
        self
    }

    /// Associates the event kind the block raises.
    #[must_use]
    pub fn event(mut self, kind: EventKind) -> Self {
        self.event = Some(kind);
        self
    }

    /// Patch name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn into_record(self, id: PatchId) -> Result<PatchRecord> {
        let missing = |what: &str| Error::InvalidPatch {
            name: self.name.to_string(),
            reason: format!("no {what} given"),
        };
        let target = self.target.ok_or_else(|| missing("target method"))?;
        let anchor = self.anchor.clone().ok_or_else(|| missing("anchor"))?;
        let block = self.block.clone().ok_or_else(|| missing("block"))?;

        Ok(PatchRecord {
            id,
            name: self.name,
            target,
            anchor,
            block,
            event: self.event,
            state: InstallState::Pending,
            snapshot: None,
            edited: None,
            fingerprint: None,
            install_sequence: None,
            failure: None,
        })
    }
}

/// Everything known about one declared patch.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    /// Patch id
    pub id: PatchId,
    /// Patch name
    pub name: Arc<str>,
    /// Patched method
    pub target: Token,
    /// Where the block goes
    pub anchor: AnchorPattern,
    /// What is inserted
    pub block: PatchBlock,
    /// Event the block raises, if any
    pub event: Option<EventKind>,
    /// Lifecycle state
    pub state: InstallState,
    /// Live body before the install
    pub snapshot: Option<Arc<InstructionStream>>,
    /// Body swapped in by the install
    pub edited: Option<Arc<InstructionStream>>,
    /// Fingerprint of `edited`
    pub fingerprint: Option<Fingerprint>,
    /// Position in the global install order, while installed
    pub install_sequence: Option<u64>,
    /// Cause of the failure, once failed
    pub failure: Option<String>,
}

impl PatchRecord {
    pub(crate) fn mark_installed(
        &mut self,
        snapshot: Arc<InstructionStream>,
        edited: Arc<InstructionStream>,
        fingerprint: Fingerprint,
        sequence: u64,
    ) {
        self.state = InstallState::Installed;
        self.snapshot = Some(snapshot);
        self.edited = Some(edited);
        self.fingerprint = Some(fingerprint);
        self.install_sequence = Some(sequence);
    }

    pub(crate) fn mark_rolled_back(&mut self) {
        self.state = InstallState::RolledBack;
        self.install_sequence = None;
    }

    pub(crate) fn mark_failed(&mut self, cause: &Error) {
        self.state = InstallState::Failed;
        self.install_sequence = None;
        self.failure = Some(cause.to_string());
    }
}

/// Process-wide table of declared patches.
///
/// The table is the single source of truth for what differs from the shipped host: every
/// record in state [`InstallState::Installed`] names a method whose live body is an edited
/// one.
#[derive(Debug, Default)]
pub struct PatchTable {
    records: DashMap<PatchId, Arc<Mutex<PatchRecord>>>,
    next_id: AtomicU64,
}

impl PatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a declaration as a `Pending` patch.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPatch`] if target, anchor or block are missing.
    pub fn declare(&self, patch: Patch) -> Result<PatchId> {
        let id = PatchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let record = patch.into_record(id)?;
        tracing::debug!(patch = %id, name = %record.name, target = %record.target, "declared patch");
        self.records.insert(id, Arc::new(Mutex::new(record)));
        Ok(id)
    }

    /// Shared handle on a record.
    ///
    /// # Errors
    /// Returns [`Error::PatchNotFound`] for unknown ids.
    pub fn get(&self, id: PatchId) -> Result<Arc<Mutex<PatchRecord>>> {
        self.records
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(Error::PatchNotFound(id.0))
    }

    /// Copy of a record.
    ///
    /// # Errors
    /// Returns [`Error::PatchNotFound`] or [`Error::LockError`].
    pub fn snapshot(&self, id: PatchId) -> Result<PatchRecord> {
        let record = self.get(id)?;
        let guard = lock(&record)?;
        Ok(guard.clone())
    }

    /// Current state of a record.
    ///
    /// # Errors
    /// Returns [`Error::PatchNotFound`] or [`Error::LockError`].
    pub fn state(&self, id: PatchId) -> Result<InstallState> {
        let record = self.get(id)?;
        let state = lock(&record)?.state;
        Ok(state)
    }

    /// All ids in declaration order.
    #[must_use]
    pub fn ids(&self) -> Vec<PatchId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of records in `state`, in declaration order.
    #[must_use]
    pub fn in_state(&self, state: InstallState) -> Vec<PatchId> {
        self.ids()
            .into_iter()
            .filter(|id| self.state(*id).is_ok_and(|s| s == state))
            .collect()
    }

    /// Ids of records targeting `method`, in declaration order.
    #[must_use]
    pub fn for_target(&self, method: Token) -> Vec<PatchId> {
        self.ids()
            .into_iter()
            .filter(|id| {
                self.get(*id)
                    .ok()
                    .and_then(|r| r.lock().ok().map(|g| g.target == method))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Number of declared patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::LockError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn declared(table: &PatchTable, name: &str, target: u32) -> PatchId {
        table
            .declare(
                Patch::new(name)
                    .target(Token::method_def(target))
                    .anchor(AnchorPattern::Start)
                    .insert(PatchBlock::default()),
            )
            .unwrap()
    }

    #[test]
    fn declare_starts_pending() {
        let table = PatchTable::new();
        let id = declared(&table, "a", 1);
        assert_eq!(id, PatchId(1));
        assert_eq!(table.state(id).unwrap(), InstallState::Pending);
        assert_eq!(table.in_state(InstallState::Pending), vec![id]);
    }

    #[test]
    fn incomplete_declarations_rejected() {
        let table = PatchTable::new();
        let err = table
            .declare(Patch::new("broken").target(Token::method_def(1)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPatch { ref reason, .. } if reason.contains("anchor")));
        assert!(table.is_empty());
    }

    #[test]
    fn lookup() {
        let table = PatchTable::new();
        let a = declared(&table, "a", 1);
        let b = declared(&table, "b", 2);
        let c = declared(&table, "c", 1);
        assert_eq!(table.ids(), vec![a, b, c]);
        assert_eq!(table.for_target(Token::method_def(1)), vec![a, c]);
        assert!(matches!(
            table.get(PatchId(99)),
            Err(Error::PatchNotFound(99))
        ));
        assert_eq!(table.snapshot(b).unwrap().name.as_ref(), "b");
    }

    #[test]
    fn transitions() {
        let table = PatchTable::new();
        let id = declared(&table, "a", 1);
        let record = table.get(id).unwrap();
        lock(&record)
            .unwrap()
            .mark_failed(&Error::AnchorNotFound {
                pattern: "ret".into(),
            });
        let snapshot = table.snapshot(id).unwrap();
        assert_eq!(snapshot.state, InstallState::Failed);
        assert!(snapshot.failure.unwrap().contains("ret"));
    }

    #[test]
    fn state_names() {
        let names: Vec<_> = InstallState::iter().map(|s| s.to_string()).collect();
        assert_eq!(names, ["Pending", "Installed", "RolledBack", "Failed"]);
        assert_eq!(PatchId(4).to_string(), "#4");
    }
}
