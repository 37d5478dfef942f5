//! Lists, searches, uninstalls and watches the programs registered under the
//! Windows Uninstall keys.

pub mod actions;
pub mod config;
pub mod enumerate;
pub mod icon_ref;
pub mod icons;
pub mod inventory;
pub mod keys;
pub mod launch;
pub mod memory;
#[cfg(windows)]
pub mod platform;
pub mod program;
pub mod watch;

pub use inventory::Inventory;
pub use keys::{Hive, KeyPath, RegistryError};
pub use program::{ProgramError, ProgramRecord};
pub use watch::{KeyWatcher, NotifyFilter, WatchScope};
