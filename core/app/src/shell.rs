//! Outer-surface capability: updater, settings UI, error reporting.
//!
//! The daemon core never draws anything and never replaces its own binary;
//! those live in thin platform shells injected at startup. Tests and
//! headless runs use [`NoopShell`].

use studiosync_common::{ClientUpdate, Error, Result};

/// Hooks into the parts of the product that are out of the core's hands.
pub trait Shell: Send + Sync {
    /// Hand a downloaded-update descriptor to the platform updater. When
    /// this returns `Ok`, the daemon exits and the updater relaunches it.
    fn apply_update(&self, update: &ClientUpdate) -> Result<()>;

    /// Open the settings surface.
    fn open_settings(&self) -> Result<()>;

    /// Forward an unexpected handler error to the error-reporting backend.
    fn report_error(&self, error: &Error);
}

/// Shell that does nothing; for tests and `TEST=1` runs.
pub struct NoopShell;

impl Shell for NoopShell {
    fn apply_update(&self, _update: &ClientUpdate) -> Result<()> {
        Ok(())
    }

    fn open_settings(&self) -> Result<()> {
        Ok(())
    }

    fn report_error(&self, _error: &Error) {}
}
