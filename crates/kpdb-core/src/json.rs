//! Compact JSON rendering of the group tree.
//!
//! This is a read-only view used to compare imported trees in tests; it is
//! not an interchange format. Meta-entries are hidden, unset times and empty
//! strings are omitted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::binary::Binary;
use crate::database::Database;
use crate::entry::{Attachment, BinaryRef, Entry};
use crate::group::Group;
use crate::metadata::Metadata;

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn insert_time(obj: &mut Map<String, Value>, key: &str, time: DateTime<Utc>) {
    if time.timestamp() != 0 {
        obj.insert(key.to_string(), json!(format_time(time)));
    }
}

fn resolve_binary<'a>(attachment: &'a Attachment, meta: Option<&'a Metadata>) -> Option<&'a Binary> {
    match &attachment.binary {
        BinaryRef::Inline(binary) => Some(binary),
        BinaryRef::Pool(index) => meta.and_then(|meta| meta.binaries.get(*index)),
    }
}

fn attachment_to_json(attachment: &Attachment, meta: Option<&Metadata>) -> Value {
    let mut obj = Map::new();
    if !attachment.name.is_empty() {
        obj.insert("name".to_string(), json!(attachment.name));
    }
    if let Some(binary) = resolve_binary(attachment, meta) {
        if !binary.is_empty() {
            obj.insert(
                "data".to_string(),
                json!(BASE64.encode(binary.data.value())),
            );
        }
    }
    Value::Object(obj)
}

pub fn entry_to_json(entry: &Entry, meta: Option<&Metadata>) -> Value {
    let mut obj = Map::new();
    obj.insert("icon".to_string(), json!(entry.icon));

    for (key, value) in [
        ("title", entry.title.value()),
        ("url", entry.url.value()),
        ("username", entry.username.value()),
        ("password", entry.password.value()),
        ("notes", entry.notes.value()),
    ] {
        if !value.is_empty() {
            obj.insert(key.to_string(), json!(value));
        }
    }

    insert_time(&mut obj, "creation_time", entry.creation_time);
    insert_time(&mut obj, "modification_time", entry.modification_time);
    insert_time(&mut obj, "access_time", entry.access_time);
    insert_time(&mut obj, "expiry_time", entry.expiry_time);

    if !entry.attachments.is_empty() {
        let attachments: Vec<Value> = entry
            .attachments
            .iter()
            .map(|attachment| attachment_to_json(attachment, meta))
            .collect();
        obj.insert("attachments".to_string(), Value::Array(attachments));
    }

    Value::Object(obj)
}

pub fn group_to_json(group: &Group, meta: Option<&Metadata>) -> Value {
    let mut obj = Map::new();
    obj.insert("icon".to_string(), json!(group.icon));
    if group.custom_icon.is_some() {
        obj.insert("custom_icon".to_string(), json!(true));
    }
    if !group.name.is_empty() {
        obj.insert("name".to_string(), json!(group.name));
    }
    if !group.notes.is_empty() {
        obj.insert("notes".to_string(), json!(group.notes));
    }

    insert_time(&mut obj, "creation_time", group.creation_time);
    insert_time(&mut obj, "modification_time", group.modification_time);
    insert_time(&mut obj, "access_time", group.access_time);
    insert_time(&mut obj, "expiry_time", group.expiry_time);
    insert_time(&mut obj, "move_time", group.move_time);

    if group.flags != 0 {
        obj.insert("flags".to_string(), json!(group.flags));
    }

    if !group.groups.is_empty() {
        let groups: Vec<Value> = group
            .groups
            .iter()
            .map(|child| group_to_json(child, meta))
            .collect();
        obj.insert("groups".to_string(), Value::Array(groups));
    }

    if group.has_non_meta_entries() {
        let entries: Vec<Value> = group
            .entries
            .iter()
            .filter(|entry| !entry.is_meta_entry())
            .map(|entry| entry_to_json(entry, meta))
            .collect();
        obj.insert("entries".to_string(), Value::Array(entries));
    }

    Value::Object(obj)
}

/// Renders the whole tree as one compact JSON value.
pub fn database_to_json(db: &Database) -> Value {
    group_to_json(&db.root, db.meta.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Attachment, BinaryRef};
    use crate::security::Protected;

    #[test]
    fn empty_fields_are_omitted() {
        let group = Group::new();
        let value = group_to_json(&group, None);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["icon"], json!(0));
    }

    #[test]
    fn meta_entries_are_hidden() {
        let mut group = Group::new();
        group.name = "General".to_string();

        let mut meta_entry = Entry::new();
        meta_entry.title = Protected::new("Meta-Info".to_string(), false);
        meta_entry.url = Protected::new("$".to_string(), false);
        meta_entry.username = Protected::new("SYSTEM".to_string(), false);
        meta_entry.notes = Protected::new("state".to_string(), false);
        meta_entry.add_attachment(Attachment {
            name: "bin-stream".to_string(),
            binary: BinaryRef::Inline(Binary::default()),
        });
        group.add_entry(meta_entry);

        let value = group_to_json(&group, None);
        assert!(value.get("entries").is_none());
    }

    #[test]
    fn pool_attachments_resolve_through_metadata() {
        let mut meta = Metadata::default();
        let index = meta.add_binary(Binary::new(Protected::new(b"abc".to_vec(), false)));

        let mut entry = Entry::new();
        entry.title = Protected::new("file".to_string(), false);
        entry.add_attachment(Attachment {
            name: "a.txt".to_string(),
            binary: BinaryRef::Pool(index),
        });

        let value = entry_to_json(&entry, Some(&meta));
        let attachment = &value["attachments"][0];
        assert_eq!(attachment["name"], json!("a.txt"));
        assert_eq!(attachment["data"], json!(BASE64.encode(b"abc")));
    }
}
