//! Password entries, their attachments and auto-type settings.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::binary::Binary;
use crate::random::generate_uuid;
use crate::security::Protected;

/// A window/keystroke-sequence pair for auto-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub window: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub sequence: String,
    pub associations: Vec<Association>,
}

impl AutoType {
    pub fn add_association(&mut self, window: String, sequence: String) {
        self.associations.push(Association { window, sequence });
    }
}

/// A named key with a possibly protected value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomField {
    pub key: String,
    pub value: Protected<String>,
}

/// How an attachment refers to its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryRef {
    /// Index into the metadata binary pool (KDBX).
    Pool(usize),
    /// Payload owned by the attachment itself (KDB, inline KDBX values).
    Inline(Binary),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub binary: BinaryRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon: u32,
    /// UUID of a custom icon in the metadata icon pool.
    pub custom_icon: Option<Uuid>,
    pub title: Protected<String>,
    pub url: Protected<String>,
    pub override_url: String,
    pub username: Protected<String>,
    pub password: Protected<String>,
    pub notes: Protected<String>,
    pub tags: String,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub move_time: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u32,
    pub bg_color: String,
    pub fg_color: String,
    pub auto_type: AutoType,
    pub attachments: Vec<Attachment>,
    /// Prior versions of this entry, oldest first.
    pub history: Vec<Entry>,
    pub custom_fields: Vec<CustomField>,
}

impl Entry {
    pub fn new() -> Self {
        Self {
            uuid: generate_uuid(),
            icon: 0,
            custom_icon: None,
            title: Protected::default(),
            url: Protected::default(),
            override_url: String::new(),
            username: Protected::default(),
            password: Protected::default(),
            notes: Protected::default(),
            tags: String::new(),
            creation_time: DateTime::UNIX_EPOCH,
            modification_time: DateTime::UNIX_EPOCH,
            access_time: DateTime::UNIX_EPOCH,
            expiry_time: DateTime::UNIX_EPOCH,
            move_time: DateTime::UNIX_EPOCH,
            expires: false,
            usage_count: 0,
            bg_color: String::new(),
            fg_color: String::new(),
            auto_type: AutoType::default(),
            attachments: Vec::new(),
            history: Vec::new(),
            custom_fields: Vec::new(),
        }
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub fn has_attachment(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn add_history_entry(&mut self, entry: Entry) {
        self.history.push(entry);
    }

    pub fn add_custom_field(&mut self, key: String, value: Protected<String>) {
        self.custom_fields.push(CustomField { key, value });
    }

    /// KeePass 1.x side-channel entries carrying application state. They are
    /// preserved in the model but hidden from user-visible renderings.
    pub fn is_meta_entry(&self) -> bool {
        let has_binstream_attachment = self
            .attachments
            .iter()
            .any(|attachment| attachment.name == "bin-stream");

        self.title.value() == "Meta-Info"
            && self.url.value() == "$"
            && self.username.value() == "SYSTEM"
            && !self.notes.value().is_empty()
            && has_binstream_attachment
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Protected;

    fn meta_entry() -> Entry {
        let mut entry = Entry::new();
        entry.title = Protected::new("Meta-Info".to_string(), false);
        entry.url = Protected::new("$".to_string(), false);
        entry.username = Protected::new("SYSTEM".to_string(), false);
        entry.notes = Protected::new("KPX_GROUP_TREE_STATE".to_string(), false);
        entry.add_attachment(Attachment {
            name: "bin-stream".to_string(),
            binary: BinaryRef::Inline(Binary::default()),
        });
        entry
    }

    #[test]
    fn meta_entry_is_detected() {
        assert!(meta_entry().is_meta_entry());
    }

    #[test]
    fn meta_entry_requires_all_markers() {
        let mut entry = meta_entry();
        entry.attachments[0].name = "other".to_string();
        assert!(!entry.is_meta_entry());

        let mut entry = meta_entry();
        entry.notes = Protected::default();
        assert!(!entry.is_meta_entry());

        let mut entry = meta_entry();
        entry.username = Protected::new("user".to_string(), false);
        assert!(!entry.is_meta_entry());
    }

    #[test]
    fn new_entries_get_distinct_uuids() {
        assert_ne!(Entry::new().uuid, Entry::new().uuid);
    }
}
