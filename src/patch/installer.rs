//! Swapping edited bodies into the host's live method table.
//!
//! The installer owns the only code path that changes a live method body. Every change is a
//! compare-and-swap of the whole body against the body that was read when the edit was
//! computed, so an install either lands completely or not at all, and an install racing
//! with another writer is detected as a conflict instead of silently overwriting it.
//!
//! # Locking
//!
//! Install, rollback and reinstall of patches targeting the same method are serialized by a
//! per-target mutex; patches on different methods proceed in parallel. The target lock is
//! always taken before the record lock.
//!
//! # Stacked patches
//!
//! Several patches may target one method. Each install snapshots the body it replaced, so
//! stacked patches must be rolled back in reverse install order. Rolling back a patch that
//! is no longer the live body is an [`Error::InstallConflict`]; [`HookInstaller::rollback_all`]
//! walks the install order backwards and never hits this case.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    assembly::{fingerprint, Fingerprint, InstructionStream},
    config::{EditorConfig, InstallerConfig},
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    metadata::token::Token,
    patch::{
        anchor::locate,
        editor::splice,
        record::{lock, InstallState, PatchId, PatchRecord, PatchTable},
    },
    Error, Result,
};

/// The host's table of live method bodies.
///
/// Implementations must make [`MethodTable::compare_exchange`] atomic with respect to
/// [`MethodTable::read`].
pub trait MethodTable: Send + Sync {
    /// Current live body of `method`.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the method is unknown.
    fn read(&self, method: Token) -> Result<Arc<InstructionStream>>;

    /// Replaces the body of `method` with `new` if it is still `current`.
    ///
    /// # Errors
    /// Returns [`Error::InstallConflict`] if the live body is no longer `current`, and
    /// [`Error::MethodNotFound`] if the method is unknown.
    fn compare_exchange(
        &self,
        method: Token,
        current: &Arc<InstructionStream>,
        new: Arc<InstructionStream>,
    ) -> Result<()>;
}

/// Concurrent in-memory method table.
///
/// Bodies are compared by identity: a compare-and-swap succeeds only against the exact
/// `Arc` that is live.
#[derive(Debug, Default)]
pub struct LiveMethodTable {
    bodies: DashMap<Token, Arc<InstructionStream>>,
}

impl LiveMethodTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads (or unconditionally replaces) the body of `method`, as the host does when it
    /// loads code.
    pub fn load(&self, method: Token, body: InstructionStream) -> Arc<InstructionStream> {
        let body = Arc::new(body);
        self.bodies.insert(method, Arc::clone(&body));
        body
    }

    /// Number of known methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// Returns true if no method is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl MethodTable for LiveMethodTable {
    fn read(&self, method: Token) -> Result<Arc<InstructionStream>> {
        self.bodies
            .get(&method)
            .map(|b| Arc::clone(b.value()))
            .ok_or(Error::MethodNotFound(method))
    }

    fn compare_exchange(
        &self,
        method: Token,
        current: &Arc<InstructionStream>,
        new: Arc<InstructionStream>,
    ) -> Result<()> {
        let mut live = self
            .bodies
            .get_mut(&method)
            .ok_or(Error::MethodNotFound(method))?;
        if !Arc::ptr_eq(live.value(), current) {
            return Err(Error::InstallConflict {
                method,
                reason: "live body changed since it was read".to_string(),
            });
        }
        *live = new;
        Ok(())
    }
}

/// Position of a patch's edited body in the live method.
enum Layer {
    /// The edited body is the live body
    Live,
    /// Later installed patches were applied on top of the edited body
    Stacked {
        /// The chain of later patches ends at the live body
        intact: bool,
    },
    /// Something outside the patch table replaced the body
    Replaced,
}

/// Applies, verifies and reverts patch records.
pub struct HookInstaller {
    methods: Arc<dyn MethodTable>,
    table: Arc<PatchTable>,
    diagnostics: Arc<Diagnostics>,
    editor: EditorConfig,
    config: InstallerConfig,
    target_locks: DashMap<Token, Arc<Mutex<()>>>,
    sequence: AtomicU64,
}

impl HookInstaller {
    /// Creates an installer over `methods` and `table`.
    pub fn new(
        methods: Arc<dyn MethodTable>,
        table: Arc<PatchTable>,
        diagnostics: Arc<Diagnostics>,
        editor: EditorConfig,
        config: InstallerConfig,
    ) -> Self {
        Self {
            methods,
            table,
            diagnostics,
            editor,
            config,
            target_locks: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// The patch table this installer works on.
    #[must_use]
    pub fn table(&self) -> &Arc<PatchTable> {
        &self.table
    }

    fn target_lock(&self, method: Token) -> Arc<Mutex<()>> {
        Arc::clone(self.target_locks.entry(method).or_default().value())
    }

    fn target_of(&self, id: PatchId) -> Result<(Arc<Mutex<PatchRecord>>, Token)> {
        let record = self.table.get(id)?;
        let target = lock(&record)?.target;
        Ok((record, target))
    }

    fn report(&self, record: &PatchRecord, category: DiagnosticCategory, error: &Error) {
        tracing::warn!(
            patch = %record.id,
            name = %record.name,
            target = %record.target,
            error = %error,
            "patch operation failed"
        );
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticSeverity::Error,
                category,
                format!("{}: {error}", record.name),
            )
            .with_patch(record.id.0)
            .with_method(record.target),
        );
    }

    /// Locates, splices and swaps in the edited body. The record must not be installed.
    fn apply(&self, record: &mut PatchRecord) -> Result<()> {
        let result = self.try_apply(record);
        if let Err((category, error)) = result {
            self.report(record, category, &error);
            record.mark_failed(&error);
            return Err(error);
        }
        Ok(())
    }

    fn try_apply(
        &self,
        record: &mut PatchRecord,
    ) -> std::result::Result<(), (DiagnosticCategory, Error)> {
        let install = |e| (DiagnosticCategory::Install, e);

        let live = self.methods.read(record.target).map_err(install)?;
        let anchor =
            locate(&live, &record.anchor).map_err(|e| (DiagnosticCategory::Anchor, e))?;
        let edited = splice(&live, &anchor, &record.block, &self.editor)
            .map_err(|e| (DiagnosticCategory::Edit, e))?;
        let expected = fingerprint(&edited).map_err(install)?;
        let edited = Arc::new(edited);

        self.methods
            .compare_exchange(record.target, &live, Arc::clone(&edited))
            .map_err(|e| (DiagnosticCategory::Conflict, e))?;

        if self.config.verify_after_install {
            let now = self.methods.read(record.target).map_err(install)?;
            let actual = fingerprint(&now).map_err(install)?;
            if actual != expected {
                // best effort: put the original back if our body is still the live one
                let _ = self
                    .methods
                    .compare_exchange(record.target, &edited, Arc::clone(&live));
                return Err((
                    DiagnosticCategory::Conflict,
                    Error::InstallConflict {
                        method: record.target,
                        reason: format!("live body {actual} does not match {expected}"),
                    },
                ));
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        record.mark_installed(live, edited, expected, sequence);
        tracing::info!(
            patch = %record.id,
            name = %record.name,
            target = %record.target,
            anchor = anchor.index,
            fingerprint = %expected,
            "installed patch"
        );
        self.diagnostics.push(
            Diagnostic::new(
                DiagnosticSeverity::Info,
                DiagnosticCategory::Install,
                format!("{} installed", record.name),
            )
            .with_patch(record.id.0)
            .with_method(record.target),
        );
        Ok(())
    }

    /// Installs a patch.
    ///
    /// Installing an installed patch is a successful no-op. A failure leaves the method body
    /// untouched, marks the record [`InstallState::Failed`] and records a diagnostic.
    ///
    /// # Errors
    /// - [`Error::AnchorNotFound`], [`Error::StackImbalance`], [`Error::RegionCorruption`] or
    ///   [`Error::InstallConflict`] from the install itself
    /// - [`Error::InvalidState`] if the record already failed
    /// - [`Error::PatchNotFound`] for unknown ids
    pub fn install(&self, id: PatchId) -> Result<()> {
        let (record, target) = self.target_of(id)?;
        let target_lock = self.target_lock(target);
        let _serial = lock(&target_lock)?;
        let mut record = lock(&record)?;

        match record.state {
            InstallState::Installed => {
                tracing::debug!(patch = %id, "already installed");
                Ok(())
            }
            InstallState::Failed => Err(Error::InvalidState {
                id: id.0,
                state: record.state.to_string(),
                operation: "install",
            }),
            InstallState::Pending | InstallState::RolledBack => self.apply(&mut record),
        }
    }

    /// Restores the body the patch replaced.
    ///
    /// Rolling back a patch that is not installed is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::InstallConflict`] if the live body is not the one this patch
    /// installed (another patch was stacked on top, or the host replaced the body).
    pub fn rollback(&self, id: PatchId) -> Result<()> {
        let (record, target) = self.target_of(id)?;
        let target_lock = self.target_lock(target);
        let _serial = lock(&target_lock)?;
        let mut record = lock(&record)?;

        if record.state != InstallState::Installed {
            return Ok(());
        }
        let (Some(snapshot), Some(edited)) = (record.snapshot.clone(), record.edited.clone())
        else {
            return Err(malformed_error!(
                "Installed patch {} has no snapshot",
                record.id
            ));
        };

        if let Err(error) = self
            .methods
            .compare_exchange(target, &edited, snapshot)
        {
            let error = match error {
                Error::InstallConflict { method, .. } => Error::InstallConflict {
                    method,
                    reason: format!(
                        "{} is no longer the live body; roll back later patches first",
                        record.name
                    ),
                },
                other => other,
            };
            self.report(&record, DiagnosticCategory::Conflict, &error);
            return Err(error);
        }

        record.mark_rolled_back();
        tracing::info!(patch = %id, name = %record.name, target = %target, "rolled back patch");
        Ok(())
    }

    /// Finds where the body this patch installed sits relative to the live body.
    ///
    /// Must not be called with a lock held on any record of `target` other than `id`.
    fn layer(
        &self,
        id: PatchId,
        target: Token,
        edited: &Arc<InstructionStream>,
        expected: Fingerprint,
    ) -> Result<Layer> {
        let live = self.methods.read(target)?;
        if Arc::ptr_eq(&live, edited) || fingerprint(&live)? == expected {
            return Ok(Layer::Live);
        }

        // (replaced body, installed body) of every other installed patch on the target
        let mut installed = Vec::new();
        for other in self.table.ids() {
            if other == id {
                continue;
            }
            let record = self.table.get(other)?;
            let record = lock(&record)?;
            if record.target != target || record.state != InstallState::Installed {
                continue;
            }
            if let (Some(snapshot), Some(body)) = (&record.snapshot, &record.edited) {
                installed.push((Arc::clone(snapshot), Arc::clone(body)));
            }
        }

        let mut top = Arc::clone(edited);
        let mut stacked = false;
        for _ in 0..installed.len() {
            let Some((_, body)) = installed.iter().find(|(snapshot, _)| Arc::ptr_eq(snapshot, &top))
            else {
                break;
            };
            top = Arc::clone(body);
            stacked = true;
            if Arc::ptr_eq(&top, &live) {
                return Ok(Layer::Stacked { intact: true });
            }
        }

        Ok(if stacked {
            Layer::Stacked { intact: false }
        } else {
            Layer::Replaced
        })
    }

    /// Checks that the body this patch installed is still in effect.
    ///
    /// A patch is intact when its edited body is live, or when it lies under a chain of
    /// later installed patches on the same method whose top is live.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the patch is not installed.
    pub fn verify(&self, id: PatchId) -> Result<bool> {
        let (record, target) = self.target_of(id)?;
        let (edited, expected) = {
            let record = lock(&record)?;
            match (record.state, &record.edited, record.fingerprint) {
                (InstallState::Installed, Some(edited), Some(fp)) => (Arc::clone(edited), fp),
                (state, _, _) => {
                    return Err(Error::InvalidState {
                        id: id.0,
                        state: state.to_string(),
                        operation: "verify",
                    })
                }
            }
        };
        let intact = match self.layer(id, target, &edited, expected)? {
            Layer::Live | Layer::Stacked { intact: true } => true,
            Layer::Stacked { intact: false } | Layer::Replaced => false,
        };
        if !intact {
            tracing::warn!(patch = %id, target = %target, "live body no longer carries the patch");
        }
        Ok(intact)
    }

    /// Re-applies a patch whose live body was replaced behind the installer's back.
    ///
    /// An installed patch that still verifies is left alone. A rolled back or pending patch
    /// is installed.
    ///
    /// # Errors
    /// - [`Error::InstallConflict`] if later installed patches sit on top of this one and
    ///   the chain no longer reaches the live body; roll those back first
    /// - Otherwise the same as [`HookInstaller::install`]
    pub fn reinstall(&self, id: PatchId) -> Result<()> {
        let (record, target) = self.target_of(id)?;
        let target_lock = self.target_lock(target);
        let _serial = lock(&target_lock)?;
        let mut record = lock(&record)?;

        match record.state {
            InstallState::Failed => Err(Error::InvalidState {
                id: id.0,
                state: record.state.to_string(),
                operation: "reinstall",
            }),
            InstallState::Installed => {
                let (Some(edited), Some(expected)) = (record.edited.clone(), record.fingerprint)
                else {
                    return Err(malformed_error!(
                        "Installed patch {} has no edited body",
                        record.id
                    ));
                };
                match self.layer(id, target, &edited, expected)? {
                    Layer::Live | Layer::Stacked { intact: true } => Ok(()),
                    Layer::Stacked { intact: false } => {
                        let error = Error::InstallConflict {
                            method: target,
                            reason: format!(
                                "later patches are stacked on {}; roll them back first",
                                record.name
                            ),
                        };
                        self.report(&record, DiagnosticCategory::Conflict, &error);
                        Err(error)
                    }
                    Layer::Replaced => {
                        tracing::info!(patch = %id, target = %target, "re-applying patch");
                        self.apply(&mut record)
                    }
                }
            }
            InstallState::Pending | InstallState::RolledBack => self.apply(&mut record),
        }
    }

    /// Installs every pending or rolled back patch in declaration order.
    pub fn install_all(&self) -> Vec<(PatchId, Result<()>)> {
        let mut ids = self.table.in_state(InstallState::Pending);
        ids.extend(self.table.in_state(InstallState::RolledBack));
        ids.sort_unstable();
        ids.into_iter().map(|id| (id, self.install(id))).collect()
    }

    /// Verifies every installed patch in parallel.
    pub fn verify_all(&self) -> Vec<(PatchId, Result<bool>)> {
        self.table
            .in_state(InstallState::Installed)
            .into_par_iter()
            .map(|id| (id, self.verify(id)))
            .collect()
    }

    /// Rolls back every installed patch, most recently installed first.
    pub fn rollback_all(&self) -> Vec<(PatchId, Result<()>)> {
        let mut installed: Vec<(u64, PatchId)> = self
            .table
            .in_state(InstallState::Installed)
            .into_iter()
            .filter_map(|id| {
                let sequence = self.table.snapshot(id).ok()?.install_sequence?;
                Some((sequence, id))
            })
            .collect();
        installed.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        installed
            .into_iter()
            .map(|(_, id)| (id, self.rollback(id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{encode, InstructionEmitter, StreamBuilder},
        patch::{
            anchor::AnchorPattern,
            block::{BlockBuilder, PatchBlock},
            record::Patch,
        },
    };

    const TARGET: Token = Token::method_def(1);

    fn body() -> InstructionStream {
        let mut b = StreamBuilder::new();
        b.ldarg(0).unwrap().ret().unwrap();
        b.build(1, true).unwrap()
    }

    fn increment() -> PatchBlock {
        let mut b = BlockBuilder::new();
        b.ldc_i4(1).unwrap().op("add").unwrap();
        b.build().unwrap()
    }

    fn setup(config: InstallerConfig) -> (HookInstaller, Arc<LiveMethodTable>, Arc<Diagnostics>) {
        let methods = Arc::new(LiveMethodTable::new());
        methods.load(TARGET, body());
        let diagnostics = Arc::new(Diagnostics::new());
        let installer = HookInstaller::new(
            methods.clone(),
            Arc::new(PatchTable::new()),
            diagnostics.clone(),
            EditorConfig::default(),
            config,
        );
        (installer, methods, diagnostics)
    }

    fn declare(installer: &HookInstaller, anchor: AnchorPattern) -> PatchId {
        installer
            .table()
            .declare(
                Patch::new("inc")
                    .target(TARGET)
                    .anchor(anchor)
                    .insert(increment()),
            )
            .unwrap()
    }

    #[test]
    fn install_rollback_round_trip() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        let original = encode(&methods.read(TARGET).unwrap()).unwrap();
        let id = declare(&installer, AnchorPattern::before_last_return());

        installer.install(id).unwrap();
        assert_eq!(installer.table().state(id).unwrap(), InstallState::Installed);
        assert_eq!(methods.read(TARGET).unwrap().len(), 4);
        assert!(installer.verify(id).unwrap());

        installer.rollback(id).unwrap();
        assert_eq!(installer.table().state(id).unwrap(), InstallState::RolledBack);
        assert_eq!(encode(&methods.read(TARGET).unwrap()).unwrap(), original);

        // idempotent rollback
        installer.rollback(id).unwrap();
    }

    #[test]
    fn install_is_idempotent() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        let id = declare(&installer, AnchorPattern::before_last_return());
        installer.install(id).unwrap();
        let first = methods.read(TARGET).unwrap();
        installer.install(id).unwrap();
        assert!(Arc::ptr_eq(&first, &methods.read(TARGET).unwrap()));
    }

    #[test]
    fn missing_anchor_fails_without_touching_body() {
        let (installer, methods, diagnostics) = setup(InstallerConfig::default());
        let before = methods.read(TARGET).unwrap();
        let id = declare(
            &installer,
            AnchorPattern::Window(crate::patch::anchor::WindowPattern::new(vec![
                crate::patch::anchor::OpPattern::call("Missing"),
            ])),
        );

        assert!(matches!(
            installer.install(id),
            Err(Error::AnchorNotFound { .. })
        ));
        assert_eq!(installer.table().state(id).unwrap(), InstallState::Failed);
        assert!(Arc::ptr_eq(&before, &methods.read(TARGET).unwrap()));
        assert_eq!(diagnostics.by_category(DiagnosticCategory::Anchor).len(), 1);

        // failed is terminal
        assert!(matches!(
            installer.install(id),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn stacked_patches_roll_back_in_reverse() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        let original = methods.read(TARGET).unwrap();
        let first = declare(&installer, AnchorPattern::before_last_return());
        let second = declare(&installer, AnchorPattern::before_last_return());
        installer.install(first).unwrap();
        installer.install(second).unwrap();
        assert_eq!(methods.read(TARGET).unwrap().len(), 6);

        assert!(matches!(
            installer.rollback(first),
            Err(Error::InstallConflict { .. })
        ));
        assert_eq!(installer.table().state(first).unwrap(), InstallState::Installed);

        let results = installer.rollback_all();
        assert_eq!(results[0].0, second);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(Arc::ptr_eq(&original, &methods.read(TARGET).unwrap()));
    }

    #[test]
    fn buried_patch_verifies_and_is_not_reapplied() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        let original = methods.read(TARGET).unwrap();
        let first = declare(&installer, AnchorPattern::before_last_return());
        let second = declare(&installer, AnchorPattern::before_last_return());
        installer.install(first).unwrap();
        installer.install(second).unwrap();

        assert!(installer.verify(first).unwrap());
        assert!(installer
            .verify_all()
            .iter()
            .all(|(_, r)| matches!(r, Ok(true))));

        // still intact: nothing to do
        installer.reinstall(first).unwrap();
        assert_eq!(methods.read(TARGET).unwrap().len(), 6);

        // the host reloads a different body; the buried patch must not be spliced again
        let mut b = StreamBuilder::new();
        b.op("nop").unwrap().ldarg(0).unwrap().ret().unwrap();
        let foreign = methods.load(TARGET, b.build(1, true).unwrap());
        assert!(!installer.verify(first).unwrap());
        assert!(matches!(
            installer.reinstall(first),
            Err(Error::InstallConflict { .. })
        ));
        assert!(Arc::ptr_eq(&foreign, &methods.read(TARGET).unwrap()));

        // repair from the top down, then the table describes the live body again
        installer.reinstall(second).unwrap();
        assert_eq!(methods.read(TARGET).unwrap().len(), 5);
        assert!(!installer.verify(first).unwrap());
        installer.reinstall(first).unwrap();
        assert!(installer.verify(first).unwrap());
        assert!(installer.verify(second).unwrap());
        assert_eq!(methods.read(TARGET).unwrap().len(), 7);

        let results = installer.rollback_all();
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(Arc::ptr_eq(&foreign, &methods.read(TARGET).unwrap()));
        assert!(!Arc::ptr_eq(&original, &foreign));
    }

    #[test]
    fn verify_detects_foreign_replacement_and_reinstall_repairs() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        let id = declare(&installer, AnchorPattern::before_last_return());
        installer.install(id).unwrap();

        // the host reloads the method
        methods.load(TARGET, body());
        assert!(!installer.verify(id).unwrap());
        let verified = installer.verify_all();
        assert_eq!(verified.len(), 1);
        assert!(!*verified[0].1.as_ref().unwrap());

        installer.reinstall(id).unwrap();
        assert!(installer.verify(id).unwrap());
    }

    #[test]
    fn verify_requires_installed() {
        let (installer, _, _) = setup(InstallerConfig::default());
        let id = declare(&installer, AnchorPattern::before_last_return());
        assert!(matches!(
            installer.verify(id),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn unknown_method() {
        let (installer, _, _) = setup(InstallerConfig::new().with_verify_after_install(false));
        let id = installer
            .table()
            .declare(
                Patch::new("ghost")
                    .target(Token::method_def(77))
                    .anchor(AnchorPattern::Start)
                    .insert(PatchBlock::default()),
            )
            .unwrap();
        assert!(matches!(
            installer.install(id),
            Err(Error::MethodNotFound(_))
        ));
    }

    #[test]
    fn install_all_and_parallel_targets() {
        let (installer, methods, _) = setup(InstallerConfig::default());
        for row in 2..6 {
            methods.load(Token::method_def(row), body());
            installer
                .table()
                .declare(
                    Patch::new(format!("inc{row}"))
                        .target(Token::method_def(row))
                        .anchor(AnchorPattern::before_last_return())
                        .insert(increment()),
                )
                .unwrap();
        }
        let results = installer.install_all();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(installer
            .verify_all()
            .iter()
            .all(|(_, r)| matches!(r, Ok(true))));
    }
}
