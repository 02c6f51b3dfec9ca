//! Command plane of the StudioSync daemon.
//!
//! A single dispatcher task consumes `(task_id, command)` tuples from the
//! local HTTP endpoint (and the TUI), runs exactly one handler at a time,
//! and emits task-tagged status events back. Tray, dialogs, and the
//! auto-updater are reached only through the [`Shell`] capability.

pub mod dispatch;
pub mod logs;
pub mod shell;
pub mod update;

pub use dispatch::{AppContext, Dispatcher, DispatcherHandles};
pub use logs::zip_log;
pub use shell::{NoopShell, Shell};
pub use update::{host_tag, newest_applicable, spawn_update_checker};
