//! Status & Warning Reporting
//!
//! Cycles report their current phase as status text and surface non-fatal
//! warnings for unsupported configurations. Warnings are de-duplicated per
//! cause for the lifetime of a [`Diagnostics`] instance (one session), so a
//! broken placement does not re-emit the same warning on every tick.

use std::fmt;

use rustc_hash::FxHashSet;

/// Phase of a synchronisation cycle, shown as status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Digest,
    Traversal,
    Building,
    Applying,
    Idle,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Digest => "Checking scene for changes",
            Self::Traversal => "Collecting scene nodes",
            Self::Building => "Building geometry",
            Self::Applying => "Updating render scene",
            Self::Idle => "Ready",
        };
        f.write_str(text)
    }
}

/// Receiver of user-visible status text and warnings.
pub trait StatusSink: Send {
    fn status(&mut self, phase: SyncPhase);

    fn warning(&mut self, message: &str);
}

/// Default sink forwarding to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn status(&mut self, phase: SyncPhase) {
        log::debug!("{phase}");
    }

    fn warning(&mut self, message: &str) {
        log::warn!("{message}");
    }
}

/// Session-scoped status reporting with once-per-cause warnings.
pub struct Diagnostics {
    sink: Box<dyn StatusSink>,
    reported: FxHashSet<String>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Box::new(LogSink))
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("reported", &self.reported.len())
            .finish_non_exhaustive()
    }
}

impl Diagnostics {
    #[must_use]
    pub fn new(sink: Box<dyn StatusSink>) -> Self {
        Self {
            sink,
            reported: FxHashSet::default(),
        }
    }

    pub fn phase(&mut self, phase: SyncPhase) {
        self.sink.status(phase);
    }

    /// Emits `message` unless a warning for `cause` was already shown this session.
    ///
    /// Returns `true` if the warning was emitted.
    pub fn warn_once(&mut self, cause: &str, message: &str) -> bool {
        if self.reported.contains(cause) {
            return false;
        }
        self.reported.insert(cause.to_string());
        self.sink.warning(message);
        true
    }

    /// Number of distinct causes reported so far.
    #[must_use]
    pub fn reported_causes(&self) -> usize {
        self.reported.len()
    }
}
