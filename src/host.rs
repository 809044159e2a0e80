//! Process-scoped extension host.
//!
//! An [`ExtensionHost`] owns everything that lives between attach and detach: the event
//! registry and dispatcher, the patch table and installer, the diagnostics collector and
//! the natives the event bridge provides to patched code. Nothing survives a detach; a host
//! attached afterwards starts from empty registries.
//!
//! The process normally has a single attached host. [`attach_global`] stores it in a
//! guarded slot that refuses a second attach until [`detach_global`] ran.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dotpatch::config::HostConfig;
//! use dotpatch::events::{Deniable, EventKind, Priority, ReservedSlotCheck, Subscriber};
//! use dotpatch::host::{Extension, ExtensionHost};
//! use dotpatch::patch::LiveMethodTable;
//!
//! struct NoReservedSlots;
//!
//! impl Extension for NoReservedSlots {
//!     fn name(&self) -> &str {
//!         "NoReservedSlots"
//!     }
//!
//!     fn subscriptions(&self) -> Vec<(EventKind, Subscriber)> {
//!         vec![(
//!             EventKind::RESERVED_SLOT,
//!             Subscriber::typed("deny-all", Priority::NORMAL, |ev: &mut ReservedSlotCheck| {
//!                 ev.deny();
//!                 Ok(())
//!             }),
//!         )]
//!     }
//! }
//!
//! let host = ExtensionHost::attach(Arc::new(LiveMethodTable::new()), HostConfig::default());
//! let handle = host.load_extension(&NoReservedSlots)?;
//! let ev = host.dispatch(&EventKind::RESERVED_SLOT, ReservedSlotCheck::new(true, "a@steam"))?;
//! assert!(!ev.is_allowed());
//!
//! host.unload_extension(&handle)?;
//! host.detach()?;
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;

use crate::{
    config::HostConfig,
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    emulation::{EmValue, EventBridge, Interpreter, NativeMethods},
    events::{Dispatcher, EventKind, EventRegistry, EventState, Subscriber, SubscriptionHandle},
    metadata::token::Token,
    patch::{lock, HookInstaller, InterceptionPoint, MethodTable, Patch, PatchId, PatchTable},
    Error, Result,
};

/// A unit of extension code: a name and the subscriptions it wants.
pub trait Extension: Send + Sync {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// `(kind, subscriber)` pairs to register at load.
    fn subscriptions(&self) -> Vec<(EventKind, Subscriber)>;
}

/// Handle of a loaded extension, used to unload it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionHandle {
    id: u64,
    name: Arc<str>,
}

impl ExtensionHandle {
    /// Name of the extension.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ExtensionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Owner of the registry, dispatcher, patch table, installer and bridge of one attach.
pub struct ExtensionHost {
    config: HostConfig,
    methods: Arc<dyn MethodTable>,
    diagnostics: Arc<Diagnostics>,
    registry: Arc<EventRegistry>,
    dispatcher: Dispatcher,
    patches: Arc<PatchTable>,
    installer: HookInstaller,
    natives: Arc<NativeMethods>,
    bridge: EventBridge,
    extensions: DashMap<u64, Vec<SubscriptionHandle>>,
    next_extension: AtomicU64,
    detached: AtomicBool,
    /// Held by detach and by every operation that adds state detach has to tear down
    lifecycle: Mutex<()>,
}

impl ExtensionHost {
    /// Creates fresh state over the host's method table.
    pub fn attach(methods: Arc<dyn MethodTable>, config: HostConfig) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let registry = Arc::new(EventRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&diagnostics),
            config.dispatch.clone(),
        );
        let patches = Arc::new(PatchTable::new());
        let installer = HookInstaller::new(
            Arc::clone(&methods),
            Arc::clone(&patches),
            Arc::clone(&diagnostics),
            config.editor.clone(),
            config.installer.clone(),
        );
        let natives = Arc::new(NativeMethods::new());
        let bridge = EventBridge::new(dispatcher.clone(), InterceptionPoint::standard());
        bridge.install(&natives);

        diagnostics.info(DiagnosticCategory::Lifecycle, "host attached");
        tracing::info!("extension host attached");

        ExtensionHost {
            config,
            methods,
            diagnostics,
            registry,
            dispatcher,
            patches,
            installer,
            natives,
            bridge,
            extensions: DashMap::new(),
            next_extension: AtomicU64::new(1),
            detached: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.detached.load(Ordering::Acquire) {
            return Err(Error::Detached);
        }
        Ok(())
    }

    /// Returns true once [`ExtensionHost::detach`] ran.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Configuration the host was attached with.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Diagnostics of this attach.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// The event registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The patch table.
    #[must_use]
    pub fn patches(&self) -> &Arc<PatchTable> {
        &self.patches
    }

    /// The installer.
    #[must_use]
    pub fn installer(&self) -> &HookInstaller {
        &self.installer
    }

    /// Natives available to interpreted code.
    #[must_use]
    pub fn natives(&self) -> &Arc<NativeMethods> {
        &self.natives
    }

    /// The event bridge, for registering event constructors.
    #[must_use]
    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    /// Registers every subscription of `extension`.
    ///
    /// A load never overlaps a detach: it either completes before the teardown starts or
    /// fails with [`Error::Detached`].
    ///
    /// # Errors
    /// Returns [`Error::Detached`] after detach.
    pub fn load_extension(&self, extension: &dyn Extension) -> Result<ExtensionHandle> {
        let subscriptions = extension.subscriptions();
        let _lifecycle = lock(&self.lifecycle)?;
        self.ensure_attached()?;
        let handles: Vec<_> = subscriptions
            .into_iter()
            .map(|(kind, subscriber)| self.registry.register(kind, subscriber))
            .collect();

        let id = self.next_extension.fetch_add(1, Ordering::Relaxed);
        let handle = ExtensionHandle {
            id,
            name: Arc::from(extension.name()),
        };
        tracing::info!(extension = %handle, subscriptions = handles.len(), "extension loaded");
        self.diagnostics.info(
            DiagnosticCategory::Lifecycle,
            format!("{handle} loaded with {} subscriptions", handles.len()),
        );
        self.extensions.insert(id, handles);
        Ok(handle)
    }

    /// Removes the subscriptions of a loaded extension and returns how many were removed.
    ///
    /// Unloading twice is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::Detached`] after detach.
    pub fn unload_extension(&self, handle: &ExtensionHandle) -> Result<usize> {
        let _lifecycle = lock(&self.lifecycle)?;
        self.ensure_attached()?;
        let Some((_, handles)) = self.extensions.remove(&handle.id) else {
            return Ok(0);
        };
        let removed = handles
            .iter()
            .filter(|h| self.registry.unregister(h))
            .count();
        tracing::info!(extension = %handle, removed, "extension unloaded");
        self.diagnostics.info(
            DiagnosticCategory::Lifecycle,
            format!("{handle} unloaded"),
        );
        Ok(removed)
    }

    /// Number of loaded extensions.
    #[must_use]
    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }

    /// Declares a patch as `Pending`.
    ///
    /// # Errors
    /// Returns [`Error::Detached`] after detach and [`Error::InvalidPatch`] for incomplete
    /// declarations.
    pub fn declare_patch(&self, patch: Patch) -> Result<PatchId> {
        let _lifecycle = lock(&self.lifecycle)?;
        self.ensure_attached()?;
        self.patches.declare(patch)
    }

    /// Declares and installs a patch.
    ///
    /// The record stays in the table when the install fails, in state `Failed`.
    ///
    /// # Errors
    /// Returns the install error, see [`HookInstaller::install`].
    pub fn apply_patch(&self, patch: Patch) -> Result<PatchId> {
        let _lifecycle = lock(&self.lifecycle)?;
        self.ensure_attached()?;
        let id = self.patches.declare(patch)?;
        self.installer.install(id)?;
        Ok(id)
    }

    /// Dispatches an event directly, as a call site would.
    ///
    /// # Errors
    /// Returns [`Error::Detached`] after detach.
    pub fn dispatch<E: EventState>(&self, kind: &EventKind, state: E) -> Result<E> {
        self.ensure_attached()?;
        Ok(self.dispatcher.dispatch(kind, state))
    }

    /// An interpreter over the live method table and this host's natives.
    #[must_use]
    pub fn interpreter(&self) -> Interpreter {
        Interpreter::new(Arc::clone(&self.natives), self.config.limits.clone())
            .with_methods(Arc::clone(&self.methods))
    }

    /// Runs the live body of `method`.
    ///
    /// # Errors
    /// Returns [`Error::Detached`] after detach and any execution error.
    pub fn execute(&self, method: Token, args: Vec<EmValue>) -> Result<Option<EmValue>> {
        self.ensure_attached()?;
        self.interpreter().execute(method, args)
    }

    /// Rolls back every installed patch, clears all subscriptions and removes the bridge.
    ///
    /// Teardown always completes; the first rollback failure is returned afterwards. A
    /// second detach is a no-op.
    ///
    /// # Errors
    /// Returns the first rollback error.
    pub fn detach(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle)?;
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for (id, result) in self.installer.rollback_all() {
            if let Err(error) = result {
                tracing::warn!(patch = %id, error = %error, "rollback during detach failed");
                first_error.get_or_insert(error);
            }
        }

        self.registry.clear();
        self.extensions.clear();
        self.bridge.uninstall(&self.natives);

        self.diagnostics.push(Diagnostic::new(
            if first_error.is_some() {
                DiagnosticSeverity::Error
            } else {
                DiagnosticSeverity::Info
            },
            DiagnosticCategory::Lifecycle,
            "host detached",
        ));
        tracing::info!(clean = first_error.is_none(), "extension host detached");

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("extensions", &self.extensions.len())
            .field("subscriptions", &self.registry.total())
            .field("patches", &self.patches.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

static CURRENT: Mutex<Option<Arc<ExtensionHost>>> = Mutex::new(None);

/// Attaches the process-wide host.
///
/// # Errors
/// Returns [`Error::AlreadyAttached`] if a host is attached.
pub fn attach_global(methods: Arc<dyn MethodTable>, config: HostConfig) -> Result<Arc<ExtensionHost>> {
    let mut slot = lock(&CURRENT)?;
    if slot.is_some() {
        return Err(Error::AlreadyAttached);
    }
    let host = Arc::new(ExtensionHost::attach(methods, config));
    *slot = Some(Arc::clone(&host));
    Ok(host)
}

/// Detaches the process-wide host and empties the slot.
///
/// The slot is emptied even if the teardown reports a rollback failure.
///
/// # Errors
/// Returns [`Error::Detached`] if no host is attached, or the teardown error.
pub fn detach_global() -> Result<()> {
    let host = lock(&CURRENT)?.take().ok_or(Error::Detached)?;
    host.detach()
}

/// The process-wide host, if attached.
#[must_use]
pub fn current() -> Option<Arc<ExtensionHost>> {
    CURRENT.lock().ok().and_then(|slot| slot.clone())
}
