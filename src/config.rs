//! Configuration types for the patch engine, dispatcher and host execution model.
//!
//! Configuration is organized into small structures, aggregated by [`HostConfig`]:
//!
//! - [`EditorConfig`] - How blocks are spliced into method bodies
//! - [`InstallerConfig`] - How edited bodies are swapped into the method table
//! - [`DispatchConfig`] - How subscriber faults are isolated and reported
//! - [`EmulationLimits`] - Execution limits for the host execution model
//!
//! # Configuration Presets
//!
//! - [`HostConfig::strict()`] - Reject anything that is not exactly balanced, verify every
//!   install
//! - [`HostConfig::lenient()`] - Repair positive stack surplus, skip post-install verify
//!
//! # Example
//!
//! ```rust
//! use dotpatch::config::{HostConfig, EmulationLimits};
//!
//! let config = HostConfig {
//!     limits: EmulationLimits::new().with_max_instructions(10_000),
//!     ..HostConfig::strict()
//! };
//! assert!(!config.editor.synthesize_balance);
//! ```

/// Stream editor settings.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `synthesize_balance` | false |
/// | `capture_anchor_branches` | true |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditorConfig {
    /// Append `pop`s when an inserted block leaves surplus values on the stack.
    ///
    /// When disabled, any non-zero net effect is a stack imbalance.
    pub synthesize_balance: bool,

    /// Redirect branches that target the anchor to the start of the inserted block.
    ///
    /// When disabled, such branches skip the block and land on the original instruction,
    /// unless the anchor starts a protected region: those branches are always captured.
    pub capture_anchor_branches: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            synthesize_balance: false,
            capture_anchor_branches: true,
        }
    }
}

impl EditorConfig {
    /// Creates editor settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables trailing `pop` synthesis.
    #[must_use]
    pub fn with_synthesize_balance(mut self, enabled: bool) -> Self {
        self.synthesize_balance = enabled;
        self
    }

    /// Enables or disables capturing branches that target the anchor.
    #[must_use]
    pub fn with_capture_anchor_branches(mut self, enabled: bool) -> Self {
        self.capture_anchor_branches = enabled;
        self
    }
}

/// Hook installer settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallerConfig {
    /// Re-read the live body after the swap and compare its fingerprint to the edited one.
    pub verify_after_install: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            verify_after_install: true,
        }
    }
}

impl InstallerConfig {
    /// Creates installer settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables post-install verification.
    #[must_use]
    pub fn with_verify_after_install(mut self, enabled: bool) -> Self {
        self.verify_after_install = enabled;
        self
    }
}

/// Dispatch engine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Catch subscriber panics and continue with the next subscriber.
    ///
    /// When disabled, a panicking subscriber unwinds through the dispatcher into the host.
    /// Returned errors are always isolated.
    pub catch_panics: bool,

    /// Append a diagnostic for every subscriber fault.
    pub record_faults: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            record_faults: true,
        }
    }
}

impl DispatchConfig {
    /// Creates dispatch settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables panic isolation.
    #[must_use]
    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    /// Enables or disables fault diagnostics.
    #[must_use]
    pub fn with_record_faults(mut self, enabled: bool) -> Self {
        self.record_faults = enabled;
        self
    }
}

/// Execution limits for the host execution model.
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `max_instructions` | 1 000 000 |
/// | `max_call_depth` | 256 |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulationLimits {
    /// Maximum instructions to execute per top-level invocation.
    ///
    /// Set to 0 for unlimited execution.
    pub max_instructions: u64,

    /// Maximum nested managed calls.
    pub max_call_depth: usize,
}

impl Default for EmulationLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_call_depth: 256,
        }
    }
}

impl EmulationLimits {
    /// Creates new limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum instruction count (0 for unlimited).
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    /// Sets the maximum call depth.
    #[must_use]
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }
}

/// Top-level configuration of an [`crate::host::ExtensionHost`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Stream editor settings
    pub editor: EditorConfig,
    /// Hook installer settings
    pub installer: InstallerConfig,
    /// Dispatch engine settings
    pub dispatch: DispatchConfig,
    /// Host execution limits
    pub limits: EmulationLimits,
}

impl HostConfig {
    /// Exact balance required, every install verified, every fault recorded.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            editor: EditorConfig::new().with_synthesize_balance(false),
            installer: InstallerConfig::new().with_verify_after_install(true),
            dispatch: DispatchConfig::new()
                .with_catch_panics(true)
                .with_record_faults(true),
            limits: EmulationLimits::default(),
        }
    }

    /// Positive surplus is repaired with `pop`s and installs are not re-verified.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            editor: EditorConfig::new().with_synthesize_balance(true),
            installer: InstallerConfig::new().with_verify_after_install(false),
            dispatch: DispatchConfig::default(),
            limits: EmulationLimits::default(),
        }
    }
}
