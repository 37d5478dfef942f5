use log::{debug, trace};

use crate::keys::{KeyPath, KeyRead, RegistryRead};
use crate::program::ProgramRecord;

/// Records for the immediate subkeys of `root` that pass `filter`.
///
/// Subkeys are opened one at a time as the iterator advances and closed
/// before the next one is opened. A root that is missing or unreadable
/// yields nothing.
pub fn enumerate<R, F>(registry: &R, root: &KeyPath, filter: F) -> Programs<R::Key, F>
where
    R: RegistryRead + ?Sized,
    F: Fn(&ProgramRecord) -> bool,
{
    let opened = registry.open_key(root).and_then(|key| {
        let names = key.subkey_names()?;
        Ok((key, names))
    });

    match opened {
        Ok((key, names)) => {
            trace!("{} has {} subkeys", root, names.len());
            Programs {
                root: Some(key),
                names: names.into_iter(),
                filter,
            }
        }
        Err(e) => {
            debug!("Skipping {}: {}", root, e);
            Programs {
                root: None,
                names: Vec::new().into_iter(),
                filter,
            }
        }
    }
}

pub struct Programs<K, F> {
    root: Option<K>,
    names: std::vec::IntoIter<String>,
    filter: F,
}

impl<K, F> Iterator for Programs<K, F>
where
    K: KeyRead,
    F: Fn(&ProgramRecord) -> bool,
{
    type Item = ProgramRecord;

    fn next(&mut self) -> Option<ProgramRecord> {
        let root = self.root.as_ref()?;

        for name in self.names.by_ref() {
            let record = match root.open_subkey(&name) {
                Ok(key) => ProgramRecord::from_key(&key),
                Err(e) => {
                    debug!("Cannot open {}: {}", root.key_path().child(&name), e);
                    continue;
                }
            };

            if (self.filter)(&record) {
                return Some(record);
            }
        }

        // Release the root handle as soon as the children are exhausted.
        self.root = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Hive;
    use crate::memory::{MemoryRegistry, Value};

    fn root() -> KeyPath {
        KeyPath::new(Hive::LocalMachine, r"Software\Microsoft\Windows\CurrentVersion\Uninstall")
    }

    fn add(registry: &MemoryRegistry, key: &str, name: &str) {
        let path = root().child(key);
        registry.set_value(&path, "DisplayName", Value::from(name));
        registry.set_value(&path, "UninstallString", Value::from(format!("{}.exe /x", key).as_str()));
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let registry = MemoryRegistry::new();
        assert_eq!(enumerate(&registry, &root(), |_| true).count(), 0);
    }

    #[test]
    fn test_empty_root_yields_nothing() {
        let registry = MemoryRegistry::new();
        registry.create_key(&root());
        assert_eq!(enumerate(&registry, &root(), |_| true).count(), 0);
    }

    #[test]
    fn test_denied_root_yields_nothing() {
        let registry = MemoryRegistry::new();
        add(&registry, "app", "App");
        registry.deny(&root());

        assert_eq!(enumerate(&registry, &root(), |_| true).count(), 0);
    }

    #[test]
    fn test_unopenable_child_is_skipped() {
        let registry = MemoryRegistry::new();
        add(&registry, "a", "A");
        add(&registry, "b", "B");
        registry.deny(&root().child("a"));

        let names: Vec<String> = enumerate(&registry, &root(), |_| true)
            .map(|r| r.to_string())
            .collect();

        assert_eq!(names, vec!["B"]);
    }

    #[test]
    fn test_filter_is_applied() {
        let registry = MemoryRegistry::new();
        add(&registry, "a", "Keep");
        add(&registry, "b", "Drop");
        registry.create_key(&root().child("nameless"));

        let records: Vec<ProgramRecord> =
            enumerate(&registry, &root(), |r| r.display_name() == Some("Keep")).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].registry_path(), &root().child("a"));
    }

    #[test]
    fn test_at_most_two_handles_and_all_released() {
        let registry = MemoryRegistry::new();
        for i in 0..20 {
            add(&registry, &format!("app{}", i), &format!("App {}", i));
        }

        let all: Vec<ProgramRecord> = enumerate(&registry, &root(), |_| true).collect();

        assert_eq!(all.len(), 20);
        assert!(registry.max_open_handles() <= 2);
        assert_eq!(registry.open_handles(), 0);
    }

    #[test]
    fn test_each_call_restarts() {
        let registry = MemoryRegistry::new();
        add(&registry, "a", "A");

        let first = enumerate(&registry, &root(), |_| true).count();
        add(&registry, "b", "B");
        let second = enumerate(&registry, &root(), |_| true).count();

        assert_eq!((first, second), (1, 2));
    }
}
