//! Diagnostics collection for patch installation and event dispatch.
//!
//! Failures in this crate are local: a patch that can not be installed leaves its target
//! untouched, and a subscriber that faults does not stop the remaining subscribers. Those
//! failures still need to be visible to whoever operates the host, so every component that
//! swallows an error for isolation reasons also records a [`Diagnostic`] here.
//!
//! The [`Diagnostics`] container uses `boxcar::Vec` for thread-safe, lock-free append
//! operations, so dispatch threads and installer threads can report concurrently without
//! coordination.
//!
//! # Key Components
//!
//! - [`Diagnostics`] - Thread-safe container for diagnostic entries
//! - [`Diagnostic`] - Individual diagnostic entry with severity and context
//! - [`DiagnosticSeverity`] - Severity level (Info, Warning, Error)
//! - [`DiagnosticCategory`] - Which part of the engine reported the entry
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::diagnostics::{Diagnostics, DiagnosticCategory};
//! use std::sync::Arc;
//!
//! let diagnostics = Arc::new(Diagnostics::new());
//!
//! diagnostics.error(
//!     DiagnosticCategory::Anchor,
//!     "ReservedSlotPatch: no window matches [call HasReservedSlot]",
//! );
//! diagnostics.warning(DiagnosticCategory::Subscriber, "on_door_damage panicked");
//!
//! assert_eq!(diagnostics.error_count(), 1);
//! assert_eq!(diagnostics.by_category(DiagnosticCategory::Subscriber).len(), 1);
//! ```
//!
//! # Thread Safety
//!
//! All types in this module are [`Send`] and [`Sync`]. Multiple threads can safely add
//! diagnostics simultaneously.

use std::fmt::{self, Write};

use strum::{Display, EnumIter};

use crate::metadata::token::Token;

/// Severity level of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DiagnosticSeverity {
    /// Informational message, not indicating a problem.
    #[strum(to_string = "INFO")]
    Info,

    /// Something was isolated and the system kept going.
    ///
    /// Subscriber faults land here: the dispatch completed for everyone else.
    #[strum(to_string = "WARN")]
    Warning,

    /// An operation failed and its effect did not happen.
    ///
    /// A failed patch install is an error: the hook it was supposed to place does not exist.
    #[strum(to_string = "ERROR")]
    Error,
}

/// Category indicating which part of the engine reported a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum DiagnosticCategory {
    /// The structural pattern of a patch was not found in its target.
    Anchor,

    /// Splicing a block failed stack or region validation.
    Edit,

    /// Patch lifecycle transitions (install, rollback, verify).
    Install,

    /// The live body of a method did not match what the installer expected.
    Conflict,

    /// A subscriber callback failed during dispatch.
    Subscriber,

    /// Extension host attach, detach, load and unload.
    Lifecycle,
}

/// A single diagnostic entry with context information.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level of this diagnostic.
    pub severity: DiagnosticSeverity,

    /// Category indicating the source of this diagnostic.
    pub category: DiagnosticCategory,

    /// Human-readable description of the issue.
    pub message: String,

    /// Optional patch id the entry relates to.
    pub patch: Option<u64>,

    /// Optional method token the entry relates to.
    pub method: Option<Token>,

    /// Optional event kind the entry relates to.
    pub event: Option<String>,
}

impl Diagnostic {
    /// Creates a new diagnostic entry.
    ///
    /// # Arguments
    ///
    /// * `severity` - Severity level of the diagnostic
    /// * `category` - Category of the diagnostic source
    /// * `message` - Human-readable description
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            patch: None,
            method: None,
            event: None,
        }
    }

    /// Adds the patch id to the diagnostic.
    #[must_use]
    pub fn with_patch(mut self, patch: u64) -> Self {
        self.patch = Some(patch);
        self
    }

    /// Adds the method token to the diagnostic.
    #[must_use]
    pub fn with_method(mut self, method: Token) -> Self {
        self.method = Some(method);
        self
    }

    /// Adds the event kind to the diagnostic.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(patch) = self.patch {
            write!(f, " (patch: #{patch})")?;
        }

        if let Some(method) = self.method {
            write!(f, " (method: {method})")?;
        }

        if let Some(event) = &self.event {
            write!(f, " (event: {event})")?;
        }

        Ok(())
    }
}

/// Thread-safe container for collecting diagnostic entries.
///
/// Uses `boxcar::Vec` internally for lock-free concurrent append operations. Entries are
/// never removed; the container lives as long as the host that owns it.
#[derive(Debug)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Creates a new empty diagnostics container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: boxcar::Vec::new(),
        }
    }

    /// Adds an informational diagnostic.
    pub fn info(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Info, category, message));
    }

    /// Adds a warning diagnostic.
    pub fn warning(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Warning,
            category,
            message,
        ));
    }

    /// Adds an error diagnostic.
    pub fn error(&self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Error,
            category,
            message,
        ));
    }

    /// Adds a diagnostic entry directly.
    ///
    /// Use this for diagnostics that carry patch, method or event context.
    pub fn push(&self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// Returns true if any diagnostics have been collected.
    pub fn has_any(&self) -> bool {
        self.entries.count() > 0
    }

    /// Returns true if any error-level diagnostics have been collected.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns the total number of diagnostics.
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    fn count_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.entries
            .iter()
            .filter(|(_, d)| d.severity == severity)
            .count()
    }

    /// Returns the number of error-level diagnostics.
    pub fn error_count(&self) -> usize {
        self.count_severity(DiagnosticSeverity::Error)
    }

    /// Returns the number of warning-level diagnostics.
    pub fn warning_count(&self) -> usize {
        self.count_severity(DiagnosticSeverity::Warning)
    }

    /// Returns the number of info-level diagnostics.
    pub fn info_count(&self) -> usize {
        self.count_severity(DiagnosticSeverity::Info)
    }

    /// Returns an iterator over all diagnostics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }

    /// Returns diagnostics filtered by category.
    pub fn by_category(&self, category: DiagnosticCategory) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|(_, d)| d.category == category)
            .map(|(_, d)| d)
            .collect()
    }

    /// Returns diagnostics related to one patch.
    pub fn for_patch(&self, patch: u64) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|(_, d)| d.patch == Some(patch))
            .map(|(_, d)| d)
            .collect()
    }

    /// Formats a summary of all diagnostics for display.
    pub fn summary(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "Diagnostics: {} error(s), {} warning(s), {} info(s)",
            self.error_count(),
            self.warning_count(),
            self.info_count()
        );

        for severity in [DiagnosticSeverity::Error, DiagnosticSeverity::Warning] {
            let mut header = false;
            for diag in self.iter().filter(|d| d.severity == severity) {
                if !header {
                    let _ = writeln!(output, "\n{severity}:");
                    header = true;
                }
                let _ = writeln!(output, "  {diag}");
            }
        }

        output
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use strum::IntoEnumIterator;

    #[test]
    fn test_diagnostic_with_context() {
        let diag = Diagnostic::new(
            DiagnosticSeverity::Error,
            DiagnosticCategory::Conflict,
            "live body changed",
        )
        .with_patch(3)
        .with_method(Token::method_def(7))
        .with_event("DamagingDoor");

        assert_eq!(diag.patch, Some(3));
        assert_eq!(diag.method, Some(Token::method_def(7)));

        let display = diag.to_string();
        assert!(display.starts_with("[ERROR] Conflict: live body changed"));
        assert!(display.contains("(patch: #3)"));
        assert!(display.contains("0x06000007"));
        assert!(display.contains("DamagingDoor"));
    }

    #[test]
    fn test_diagnostics_container() {
        let diagnostics = Diagnostics::new();

        diagnostics.info(DiagnosticCategory::Lifecycle, "attached");
        diagnostics.warning(DiagnosticCategory::Subscriber, "fault");
        diagnostics.error(DiagnosticCategory::Anchor, "missing");

        assert_eq!(diagnostics.count(), 3);
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(diagnostics.warning_count(), 1);
        assert_eq!(diagnostics.info_count(), 1);
        assert!(diagnostics.has_errors());
        assert!(diagnostics.has_any());

        let summary = diagnostics.summary();
        assert!(summary.contains("1 error(s), 1 warning(s), 1 info(s)"));
        assert!(summary.contains("ERROR:"));
        assert!(!summary.contains("attached"));
    }

    #[test]
    fn test_diagnostics_thread_safety() {
        let diagnostics = Arc::new(Diagnostics::new());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let diag_clone = Arc::clone(&diagnostics);
                thread::spawn(move || {
                    diag_clone.warning(DiagnosticCategory::Subscriber, format!("fault {i}"));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(diagnostics.count(), 10);
    }

    #[test]
    fn test_by_category_and_patch() {
        let diagnostics = Diagnostics::new();
        for category in DiagnosticCategory::iter() {
            diagnostics.push(
                Diagnostic::new(DiagnosticSeverity::Info, category, category.to_string())
                    .with_patch(1),
            );
        }
        diagnostics.error(DiagnosticCategory::Edit, "unbalanced");

        assert_eq!(diagnostics.by_category(DiagnosticCategory::Edit).len(), 2);
        assert_eq!(diagnostics.for_patch(1).len(), 6);
        assert!(diagnostics.for_patch(2).is_empty());
    }
}
