use std::collections::HashSet;

use log::debug;
use regex::{Regex, RegexBuilder};

use crate::enumerate::enumerate;
use crate::icons::IconIndex;
use crate::keys::{Hive, KeyPath, RegistryRead};
use crate::program::ProgramRecord;

pub const UNINSTALL: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";
pub const UNINSTALL_WOW6432: &str = r"Software\Wow6432Node\Microsoft\Windows\CurrentVersion\Uninstall";

/// The Uninstall keys in the order they are listed: machine before user,
/// native view before the 32-bit view.
pub fn uninstall_roots() -> [KeyPath; 4] {
    [
        KeyPath::new(Hive::LocalMachine, UNINSTALL),
        KeyPath::new(Hive::LocalMachine, UNINSTALL_WOW6432),
        KeyPath::new(Hive::CurrentUser, UNINSTALL),
        KeyPath::new(Hive::CurrentUser, UNINSTALL_WOW6432),
    ]
}

pub fn is_listable(record: &ProgramRecord) -> bool {
    record.is_listable()
}

/// Like [`is_listable`] but keeps components of other products.
pub fn is_named_uninstallable(record: &ProgramRecord) -> bool {
    record.display_name().is_some() && record.is_uninstallable()
}

/// Case-insensitive pattern for a free-text query: whitespace separated
/// words, matched literally and in order, with anything in between.
pub fn search_regex(query: &str) -> Result<Regex, regex::Error> {
    let pattern = query
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

/// Programs registered under the Uninstall keys.
///
/// Every call reads the registry again; nothing is cached between calls.
pub struct Inventory<'r, R: ?Sized> {
    registry: &'r R,
}

impl<'r, R: RegistryRead + ?Sized> Inventory<'r, R> {
    pub fn new(registry: &'r R) -> Self {
        Inventory { registry }
    }

    pub fn list_all_with<F>(&self, filter: F) -> Vec<ProgramRecord>
    where
        F: Fn(&ProgramRecord) -> bool,
    {
        let mut records = Vec::new();
        for root in uninstall_roots() {
            records.extend(enumerate(self.registry, &root, &filter));
        }

        // Stable, so equal names keep their root order.
        records.sort_by(|a, b| a.cmp_display_name(b));

        let records = IconIndex::load(self.registry).enrich(records);
        debug!("Listed {} programs", records.len());
        records
    }

    pub fn list_all(&self) -> Vec<ProgramRecord> {
        self.list_all_with(is_listable)
    }

    /// Records passing `filter` whose display name matches `query`.
    /// An empty query matches every named record.
    pub fn search_with<F>(&self, query: &str, filter: F) -> Result<Vec<ProgramRecord>, regex::Error>
    where
        F: Fn(&ProgramRecord) -> bool,
    {
        let regex = search_regex(query)?;
        Ok(self.list_all_with(|record| {
            filter(record) && record.display_name().is_some_and(|name| regex.is_match(name))
        }))
    }

    pub fn search(&self, query: &str) -> Result<Vec<ProgramRecord>, regex::Error> {
        self.search_with(query, is_listable)
    }
}

/// Programs that appeared or vanished between two listings, by registry path.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InventoryDiff {
    pub added: Vec<ProgramRecord>,
    pub removed: Vec<ProgramRecord>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(before: &[ProgramRecord], after: &[ProgramRecord]) -> InventoryDiff {
    let old: HashSet<&KeyPath> = before.iter().map(ProgramRecord::registry_path).collect();
    let new: HashSet<&KeyPath> = after.iter().map(ProgramRecord::registry_path).collect();

    InventoryDiff {
        added: after
            .iter()
            .filter(|r| !old.contains(r.registry_path()))
            .cloned()
            .collect(),
        removed: before
            .iter()
            .filter(|r| !new.contains(r.registry_path()))
            .cloned()
            .collect(),
    }
}
