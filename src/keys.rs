use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Top-level registry namespaces the inventory reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hive {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
}

impl Hive {
    pub fn name(&self) -> &'static str {
        match self {
            Hive::ClassesRoot => "HKEY_CLASSES_ROOT",
            Hive::CurrentUser => "HKEY_CURRENT_USER",
            Hive::LocalMachine => "HKEY_LOCAL_MACHINE",
            Hive::Users => "HKEY_USERS",
        }
    }
}

impl fmt::Display for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hive {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HKEY_CLASSES_ROOT" | "HKCR" => Ok(Hive::ClassesRoot),
            "HKEY_CURRENT_USER" | "HKCU" => Ok(Hive::CurrentUser),
            "HKEY_LOCAL_MACHINE" | "HKLM" => Ok(Hive::LocalMachine),
            "HKEY_USERS" | "HKU" => Ok(Hive::Users),
            _ => Err(format!("Unknown hive '{}'", s)),
        }
    }
}

/// A key addressed by hive and backslash separated sub path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    pub hive: Hive,
    pub path: String,
}

impl KeyPath {
    pub fn new(hive: Hive, path: impl Into<String>) -> Self {
        let path = path.into();
        KeyPath {
            hive,
            path: path.trim_matches('\\').to_string(),
        }
    }

    pub fn child(&self, name: &str) -> KeyPath {
        if self.path.is_empty() {
            KeyPath::new(self.hive, name)
        } else {
            KeyPath::new(self.hive, format!("{}\\{}", self.path, name))
        }
    }

    /// Last path component, the subkey name under its parent.
    pub fn leaf(&self) -> &str {
        self.path.rsplit('\\').next().unwrap_or_default()
    }

    /// The containing key; a first-level key's parent is the hive root.
    pub fn parent(&self) -> Option<KeyPath> {
        if self.path.is_empty() {
            return None;
        }
        let parent = self.path.rsplit_once('\\').map_or("", |(parent, _)| parent);
        Some(KeyPath::new(self.hive, parent))
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &KeyPath) -> bool {
        if self.hive != ancestor.hive || self.path.len() <= ancestor.path.len() {
            return false;
        }
        if ancestor.path.is_empty() {
            return true;
        }
        self.path.starts_with(&ancestor.path)
            && self.path.as_bytes()[ancestor.path.len()] == b'\\'
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.hive)
        } else {
            write!(f, "{}\\{}", self.hive, self.path)
        }
    }
}

impl FromStr for KeyPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hive, path) = s.split_once('\\').unwrap_or((s, ""));
        Ok(KeyPath::new(hive.parse()?, path))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry key {0} not found")]
    NotFound(KeyPath),
    #[error("access to registry key {0} denied")]
    AccessDenied(KeyPath),
    #[error("registry operation on {path} failed: {message}")]
    Os { path: KeyPath, message: String },
}

/// An open key that can be read.
///
/// Dropping the value releases whatever OS handle backs it.
pub trait KeyRead: Sized {
    fn key_path(&self) -> &KeyPath;

    /// Names of the immediate subkeys, in the order the store reports them.
    fn subkey_names(&self) -> Result<Vec<String>, RegistryError>;

    fn open_subkey(&self, name: &str) -> Result<Self, RegistryError>;

    /// A string value. Missing values and values of any other type are `None`.
    fn string_value(&self, name: &str) -> Option<String>;
}

pub trait RegistryRead {
    type Key: KeyRead;

    fn open_key(&self, key: &KeyPath) -> Result<Self::Key, RegistryError>;
}

pub trait RegistryWrite {
    /// Deletes `key` together with every subkey below it.
    fn delete_tree(&self, key: &KeyPath) -> Result<(), RegistryError>;
}
