//! KDBX database metadata: naming, policies, icon and binary pools.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::binary::Binary;
use crate::security::Temporal;

/// A custom icon owned by the metadata icon pool. Groups and entries refer
/// to icons by UUID.
#[derive(Debug, Clone)]
pub struct Icon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

impl Icon {
    pub fn new(uuid: Uuid, data: Vec<u8>) -> Self {
        Self { uuid, data }
    }
}

impl PartialEq for Icon {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Icon {}

/// Which string fields the host application should keep encrypted in
/// process memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub title: bool,
    pub username: bool,
    pub password: bool,
    pub url: bool,
    pub notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            title: false,
            username: false,
            password: true,
            url: false,
            notes: false,
        }
    }
}

/// An arbitrary key/value item from the `CustomData` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDataItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub generator: String,
    pub database_name: Temporal<String>,
    pub database_desc: Temporal<String>,
    pub default_username: Temporal<String>,
    pub maintenance_hist_days: u32,
    pub database_color: String,
    pub master_key_changed: DateTime<Utc>,
    /// Days until a key change is recommended; preserved, never enforced.
    pub master_key_change_rec: i64,
    /// Days until a key change is forced; preserved, never enforced.
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub recycle_bin: Option<Uuid>,
    pub recycle_bin_changed: DateTime<Utc>,
    pub entry_templates: Option<Uuid>,
    pub entry_templates_changed: DateTime<Utc>,
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub last_selected_group: Option<Uuid>,
    pub last_visible_group: Option<Uuid>,
    /// Binary pool shared by entry attachments, referenced by index.
    pub binaries: Vec<Binary>,
    /// Custom icon pool, referenced by UUID.
    pub icons: Vec<Icon>,
    pub custom_data: Vec<CustomDataItem>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            generator: String::new(),
            database_name: Temporal::default(),
            database_desc: Temporal::default(),
            default_username: Temporal::default(),
            maintenance_hist_days: 365,
            database_color: String::new(),
            master_key_changed: DateTime::UNIX_EPOCH,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            recycle_bin: None,
            recycle_bin_changed: DateTime::UNIX_EPOCH,
            entry_templates: None,
            entry_templates_changed: DateTime::UNIX_EPOCH,
            history_max_items: -1,
            history_max_size: -1,
            last_selected_group: None,
            last_visible_group: None,
            binaries: Vec::new(),
            icons: Vec::new(),
            custom_data: Vec::new(),
        }
    }
}

impl Metadata {
    /// Adds a binary to the pool and returns its pool index.
    pub fn add_binary(&mut self, binary: Binary) -> usize {
        self.binaries.push(binary);
        self.binaries.len() - 1
    }

    pub fn add_icon(&mut self, icon: Icon) {
        self.icons.push(icon);
    }

    pub fn add_custom_data(&mut self, key: String, value: String) {
        self.custom_data.push(CustomDataItem { key, value });
    }

    /// Looks up a custom icon by UUID.
    pub fn icon(&self, uuid: Uuid) -> Option<&Icon> {
        self.icons.iter().find(|icon| icon.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_format_defaults() {
        let meta = Metadata::default();
        assert_eq!(meta.maintenance_hist_days, 365);
        assert_eq!(meta.master_key_change_rec, -1);
        assert_eq!(meta.master_key_change_force, -1);
        assert_eq!(meta.history_max_items, -1);
        assert_eq!(meta.history_max_size, -1);
        assert!(meta.memory_protection.password);
        assert!(!meta.memory_protection.title);
    }

    #[test]
    fn binary_pool_indices_are_sequential() {
        let mut meta = Metadata::default();
        assert_eq!(meta.add_binary(Binary::default()), 0);
        assert_eq!(meta.add_binary(Binary::default()), 1);
    }
}
