use std::collections::HashMap;

use log::{debug, trace};
use uuid::Uuid;

use crate::keys::{Hive, KeyPath, KeyRead, RegistryRead};
use crate::program::ProgramRecord;

pub const INSTALLER_PRODUCTS: &str = r"Installer\Products";

pub fn installer_products_key() -> KeyPath {
    KeyPath::new(Hive::ClassesRoot, INSTALLER_PRODUCTS)
}

/// Product name to icon path, taken from the Windows Installer product table.
#[derive(Debug, Default, Clone)]
pub struct IconIndex {
    by_name: HashMap<String, String>,
}

impl IconIndex {
    /// Scans `HKEY_CLASSES_ROOT\Installer\Products`. A missing table gives an empty index.
    pub fn load<R: RegistryRead + ?Sized>(registry: &R) -> IconIndex {
        let root = installer_products_key();
        let products = match registry.open_key(&root) {
            Ok(key) => key,
            Err(e) => {
                debug!("No installer product index: {}", e);
                return IconIndex::default();
            }
        };
        let names = products.subkey_names().unwrap_or_default();

        let mut index = IconIndex::default();
        for name in names {
            let Ok(product) = products.open_subkey(&name) else {
                continue;
            };
            let (Some(product_name), Some(icon)) =
                (product.string_value("ProductName"), product.string_value("ProductIcon"))
            else {
                continue;
            };

            match unpack_product_code(&name) {
                Some(code) => trace!("Product {{{}}} {} -> {}", code, product_name, icon),
                None => trace!("Product {} ({}) -> {}", name, product_name, icon),
            }
            index.insert(product_name, icon);
        }

        debug!("Loaded {} product icons", index.len());
        index
    }

    /// Adds a mapping unless the name is already known.
    pub fn insert(&mut self, product_name: String, icon: String) {
        self.by_name.entry(product_name).or_insert(icon);
    }

    pub fn lookup(&self, product_name: &str) -> Option<&str> {
        self.by_name.get(product_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Fills the icon of every named record that has none. Records that
    /// already carry an icon, or have no name, come back unchanged.
    pub fn enrich(&self, records: Vec<ProgramRecord>) -> Vec<ProgramRecord> {
        records
            .into_iter()
            .map(|record| {
                if record.has_icon() {
                    return record;
                }
                match record.display_name().and_then(|name| self.lookup(name)) {
                    Some(icon) => {
                        let icon = icon.to_string();
                        record.with_icon_reference(icon)
                    }
                    None => record,
                }
            })
            .collect()
    }
}

impl FromIterator<(String, String)> for IconIndex {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut index = IconIndex::default();
        for (name, icon) in iter {
            index.insert(name, icon);
        }
        index
    }
}

/// Turns a packed product code (the `Installer\Products` subkey name) back
/// into the product GUID. The first three groups are stored reversed and
/// every byte of the last two has its nibbles swapped.
pub fn unpack_product_code(packed: &str) -> Option<Uuid> {
    if packed.len() != 32 || !packed.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let reversed = |s: &str| s.chars().rev().collect::<String>();
    let mut hex = String::with_capacity(32);
    hex.push_str(&reversed(&packed[0..8]));
    hex.push_str(&reversed(&packed[8..12]));
    hex.push_str(&reversed(&packed[12..16]));
    for pair in packed.as_bytes()[16..].chunks(2) {
        hex.push(pair[1] as char);
        hex.push(pair[0] as char);
    }

    Uuid::parse_str(&hex).ok()
}
