use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::icon_ref::IconLocation;
use crate::keys::{KeyPath, KeyRead, RegistryError, RegistryWrite};
use crate::launch::{LaunchError, Launcher};

/// One entry of an Uninstall key, read in a single pass.
///
/// Two records are the same program when they were read from the same key,
/// whatever their other fields say.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramRecord {
    registry_path: KeyPath,
    display_name: Option<String>,
    uninstall_command: Option<String>,
    uninstall_working_dir: Option<String>,
    icon_reference: Option<String>,
    comments: Option<String>,
    publisher: Option<String>,
    parent_key_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("{name} : This program isn't uninstallable")]
    NotUninstallable { name: String },
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProgramRecord {
    pub fn from_key<K: KeyRead>(key: &K) -> Self {
        ProgramRecord {
            registry_path: key.key_path().clone(),
            display_name: key.string_value("DisplayName"),
            uninstall_command: key.string_value("UninstallString"),
            uninstall_working_dir: key.string_value("UninstallDir"),
            icon_reference: key.string_value("DisplayIcon"),
            comments: key.string_value("Comments"),
            publisher: key.string_value("Publisher"),
            parent_key_name: key.string_value("ParentKeyName"),
        }
    }

    /// Builds a record directly, for collaborators that already hold the values.
    pub fn builder(registry_path: KeyPath) -> ProgramRecordBuilder {
        ProgramRecordBuilder {
            record: ProgramRecord {
                registry_path,
                display_name: None,
                uninstall_command: None,
                uninstall_working_dir: None,
                icon_reference: None,
                comments: None,
                publisher: None,
                parent_key_name: None,
            },
        }
    }

    pub fn registry_path(&self) -> &KeyPath {
        &self.registry_path
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn uninstall_command(&self) -> Option<&str> {
        self.uninstall_command.as_deref()
    }

    pub fn uninstall_working_dir(&self) -> Option<&str> {
        self.uninstall_working_dir.as_deref()
    }

    pub fn icon_reference(&self) -> Option<&str> {
        self.icon_reference.as_deref()
    }

    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub fn parent_key_name(&self) -> Option<&str> {
        self.parent_key_name.as_deref()
    }

    pub fn is_uninstallable(&self) -> bool {
        self.uninstall_command.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// A top-level, named, uninstallable program. Components of other
    /// products (entries with a `ParentKeyName`) are not listable.
    pub fn is_listable(&self) -> bool {
        self.display_name.is_some() && self.parent_key_name.is_none() && self.is_uninstallable()
    }

    pub fn has_icon(&self) -> bool {
        self.icon_reference.as_deref().is_some_and(|i| !i.is_empty())
    }

    pub fn icon_location(&self) -> Option<IconLocation> {
        IconLocation::from_str(self.icon_reference.as_deref()?).ok()
    }

    /// Windows Installer entries are keyed by their braced product code.
    pub fn product_code(&self) -> Option<Uuid> {
        let leaf = self.registry_path.leaf();
        let inner = leaf.strip_prefix('{')?.strip_suffix('}')?;
        Uuid::parse_str(inner).ok()
    }

    /// Returns the record with `icon` set. Only meaningful when the record has none.
    pub fn with_icon_reference(self, icon: impl Into<String>) -> Self {
        ProgramRecord {
            icon_reference: Some(icon.into()),
            ..self
        }
    }

    /// Ordinal comparison of display names; records without a name come first.
    pub fn cmp_display_name(&self, other: &ProgramRecord) -> Ordering {
        self.display_name.cmp(&other.display_name)
    }

    pub fn uninstall<L: Launcher + ?Sized>(&self, launcher: &L) -> Result<(), ProgramError> {
        let command = match self.uninstall_command.as_deref() {
            Some(command) if !command.is_empty() => command,
            _ => {
                return Err(ProgramError::NotUninstallable {
                    name: self.to_string(),
                })
            }
        };

        info!("Launching uninstaller for {}: {}", self.registry_path, command);
        launcher.launch(command, self.uninstall_working_dir.as_deref())?;
        Ok(())
    }

    /// Deletes the entry's key without running any uninstaller.
    pub fn remove_from_registry<R: RegistryWrite + ?Sized>(&self, registry: &R) -> Result<(), ProgramError> {
        debug!("Deleting registry tree {}", self.registry_path);
        registry.delete_tree(&self.registry_path)?;
        Ok(())
    }
}

impl PartialEq for ProgramRecord {
    fn eq(&self, other: &Self) -> bool {
        self.registry_path == other.registry_path
    }
}

impl Eq for ProgramRecord {}

impl Hash for ProgramRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.registry_path.hash(state);
    }
}

impl std::fmt::Display for ProgramRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.registry_path.leaf()),
        }
    }
}

pub struct ProgramRecordBuilder {
    record: ProgramRecord,
}

impl ProgramRecordBuilder {
    pub fn display_name(mut self, value: impl Into<String>) -> Self {
        self.record.display_name = Some(value.into());
        self
    }

    pub fn uninstall_command(mut self, value: impl Into<String>) -> Self {
        self.record.uninstall_command = Some(value.into());
        self
    }

    pub fn uninstall_working_dir(mut self, value: impl Into<String>) -> Self {
        self.record.uninstall_working_dir = Some(value.into());
        self
    }

    pub fn icon_reference(mut self, value: impl Into<String>) -> Self {
        self.record.icon_reference = Some(value.into());
        self
    }

    pub fn comments(mut self, value: impl Into<String>) -> Self {
        self.record.comments = Some(value.into());
        self
    }

    pub fn publisher(mut self, value: impl Into<String>) -> Self {
        self.record.publisher = Some(value.into());
        self
    }

    pub fn parent_key_name(mut self, value: impl Into<String>) -> Self {
        self.record.parent_key_name = Some(value.into());
        self
    }

    pub fn build(self) -> ProgramRecord {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Hive, RegistryRead};
    use crate::launch::testing::RecordingLauncher;
    use crate::memory::{MemoryRegistry, Value};

    fn key(name: &str) -> KeyPath {
        KeyPath::new(Hive::LocalMachine, r"Software\Microsoft\Windows\CurrentVersion\Uninstall").child(name)
    }

    #[test]
    fn test_record_reads_named_values() {
        let registry = MemoryRegistry::new();
        let path = key("7-Zip");
        registry.set_value(&path, "DisplayName", Value::from("7-Zip 23.01"));
        registry.set_value(&path, "UninstallString", Value::from(r"C:\7-Zip\Uninstall.exe"));
        registry.set_value(&path, "UninstallDir", Value::from(r"C:\7-Zip"));
        registry.set_value(&path, "DisplayIcon", Value::from(r"C:\7-Zip\7zFM.exe"));
        registry.set_value(&path, "Publisher", Value::from("Igor Pavlov"));
        registry.set_value(&path, "Comments", Value::from("archiver"));

        let record = ProgramRecord::from_key(&registry.open_key(&path).unwrap());

        assert_eq!(record.registry_path(), &path);
        assert_eq!(record.display_name(), Some("7-Zip 23.01"));
        assert_eq!(record.uninstall_command(), Some(r"C:\7-Zip\Uninstall.exe"));
        assert_eq!(record.uninstall_working_dir(), Some(r"C:\7-Zip"));
        assert_eq!(record.icon_reference(), Some(r"C:\7-Zip\7zFM.exe"));
        assert_eq!(record.publisher(), Some("Igor Pavlov"));
        assert_eq!(record.comments(), Some("archiver"));
        assert_eq!(record.parent_key_name(), None);
        assert!(record.is_listable());
    }

    #[test]
    fn test_wrong_typed_value_is_absent() {
        let registry = MemoryRegistry::new();
        let path = key("Odd");
        registry.set_value(&path, "DisplayName", Value::Dword(7));
        registry.set_value(&path, "UninstallString", Value::from("odd.exe /x"));

        let record = ProgramRecord::from_key(&registry.open_key(&path).unwrap());

        assert_eq!(record.display_name(), None);
        assert!(!record.is_listable());
    }

    #[test]
    fn test_uninstallable_requires_non_empty_command() {
        let missing = ProgramRecord::builder(key("a")).display_name("A").build();
        let empty = ProgramRecord::builder(key("b")).display_name("B").uninstall_command("").build();
        let present = ProgramRecord::builder(key("c")).display_name("C").uninstall_command("c.exe").build();

        assert!(!missing.is_uninstallable());
        assert!(!empty.is_uninstallable());
        assert!(present.is_uninstallable());
    }

    #[test]
    fn test_component_is_not_listable() {
        let record = ProgramRecord::builder(key("KB123"))
            .display_name("Update for Office")
            .uninstall_command("msiexec /x")
            .parent_key_name("Office")
            .build();

        assert!(record.is_uninstallable());
        assert!(!record.is_listable());
    }

    #[test]
    fn test_equality_is_by_registry_path() {
        let before = ProgramRecord::builder(key("app")).display_name("App 1.0").build();
        let after = ProgramRecord::builder(key("app"))
            .display_name("App 2.0")
            .uninstall_command("app.exe /uninstall")
            .build();
        let other = ProgramRecord::builder(key("other")).display_name("App 1.0").build();

        assert_eq!(before, after);
        assert_ne!(before, other);
    }

    #[test]
    fn test_missing_names_sort_first() {
        let unnamed = ProgramRecord::builder(key("x")).build();
        let alpha = ProgramRecord::builder(key("a")).display_name("Alpha").build();
        let lower = ProgramRecord::builder(key("b")).display_name("alpha").build();

        assert_eq!(unnamed.cmp_display_name(&alpha), Ordering::Less);
        assert_eq!(alpha.cmp_display_name(&lower), Ordering::Less);
        assert_eq!(unnamed.cmp_display_name(&unnamed.clone()), Ordering::Equal);
    }

    #[test]
    fn test_product_code_from_braced_key() {
        let msi = ProgramRecord::builder(key("{23170F69-40C1-2702-2301-000001000000}")).build();
        let plain = ProgramRecord::builder(key("Notepad++")).build();

        assert_eq!(
            msi.product_code(),
            Some(Uuid::parse_str("23170f69-40c1-2702-2301-000001000000").unwrap())
        );
        assert_eq!(plain.product_code(), None);
    }

    #[test]
    fn test_uninstall_launches_command_in_working_dir() {
        let launcher = RecordingLauncher::default();
        let record = ProgramRecord::builder(key("app"))
            .display_name("App")
            .uninstall_command(r#""C:\App\unins000.exe" /SILENT"#)
            .uninstall_working_dir(r"C:\App")
            .build();

        record.uninstall(&launcher).unwrap();

        let launched = launcher.launched.lock();
        assert_eq!(
            launched.as_slice(),
            &[(r#""C:\App\unins000.exe" /SILENT"#.to_string(), Some(r"C:\App".to_string()))]
        );
    }

    #[test]
    fn test_uninstall_without_command_is_named_failure() {
        let launcher = RecordingLauncher::default();
        let record = ProgramRecord::builder(key("app")).display_name("App").build();

        match record.uninstall(&launcher) {
            Err(ProgramError::NotUninstallable { name }) => assert_eq!(name, "App"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(launcher.launched.lock().is_empty());
    }

    #[test]
    fn test_remove_from_registry_deletes_key_in_its_hive() {
        let registry = MemoryRegistry::new();
        let path = KeyPath::new(Hive::CurrentUser, r"Software\Microsoft\Windows\CurrentVersion\Uninstall\app");
        registry.set_value(&path, "DisplayName", Value::from("App"));
        registry.set_value(&path.child("Sub"), "X", Value::from("y"));
        let record = ProgramRecord::from_key(&registry.open_key(&path).unwrap());

        record.remove_from_registry(&registry).unwrap();

        assert!(!registry.contains(&path));
        assert!(!registry.contains(&path.child("Sub")));
        assert!(registry.contains(&path.parent().unwrap()));
    }
}
