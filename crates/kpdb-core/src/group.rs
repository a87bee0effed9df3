//! Groups: the tree nodes of a database.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entry::Entry;
use crate::random::generate_uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon: u32,
    /// UUID of a custom icon in the metadata icon pool.
    pub custom_icon: Option<Uuid>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub move_time: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u32,
    /// KDB-only group flags, preserved verbatim.
    pub flags: u16,
    pub expanded: bool,
    pub default_autotype_sequence: String,
    pub autotype: bool,
    pub search: bool,
    /// UUID of the child entry shown on top in the UI.
    pub last_visible_entry: Option<Uuid>,
    pub groups: Vec<Group>,
    pub entries: Vec<Entry>,
}

impl Group {
    pub fn new() -> Self {
        Self {
            uuid: generate_uuid(),
            name: String::new(),
            notes: String::new(),
            icon: 0,
            custom_icon: None,
            creation_time: DateTime::UNIX_EPOCH,
            modification_time: DateTime::UNIX_EPOCH,
            access_time: DateTime::UNIX_EPOCH,
            expiry_time: DateTime::UNIX_EPOCH,
            move_time: DateTime::UNIX_EPOCH,
            expires: false,
            usage_count: 0,
            flags: 0,
            expanded: false,
            default_autotype_sequence: String::new(),
            autotype: false,
            search: false,
            last_visible_entry: None,
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn add_group(&mut self, group: Group) {
        self.groups.push(group);
    }

    pub fn add_entry(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn has_non_meta_entries(&self) -> bool {
        self.entries.iter().any(|entry| !entry.is_meta_entry())
    }

    /// Pre-order depth-first visit of all descendant groups. The receiver
    /// itself is not visited; its children are at depth 0.
    pub fn visit_groups<'a, F>(&'a self, visit: &mut F)
    where
        F: FnMut(&'a Group, usize),
    {
        fn walk<'a, F>(group: &'a Group, depth: usize, visit: &mut F)
        where
            F: FnMut(&'a Group, usize),
        {
            for child in &group.groups {
                visit(child, depth);
                walk(child, depth + 1, visit);
            }
        }
        walk(self, 0, visit);
    }

    /// Finds a descendant group (or the receiver) by UUID.
    pub fn find_group(&self, uuid: Uuid) -> Option<&Group> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.groups.iter().find_map(|child| child.find_group(uuid))
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_order_is_pre_order() {
        let mut root = Group::new();
        let mut a = Group::new();
        a.name = "a".to_string();
        let mut a1 = Group::new();
        a1.name = "a1".to_string();
        a.add_group(a1);
        let mut b = Group::new();
        b.name = "b".to_string();
        root.add_group(a);
        root.add_group(b);

        let mut visited = Vec::new();
        root.visit_groups(&mut |group, depth| visited.push((group.name.clone(), depth)));
        assert_eq!(
            visited,
            vec![
                ("a".to_string(), 0),
                ("a1".to_string(), 1),
                ("b".to_string(), 0),
            ]
        );
    }

    #[test]
    fn find_group_searches_recursively() {
        let mut root = Group::new();
        let mut child = Group::new();
        let grandchild = Group::new();
        let target = grandchild.uuid;
        child.add_group(grandchild);
        root.add_group(child);

        assert!(root.find_group(target).is_some());
        assert!(root.find_group(generate_uuid()).is_none());
    }
}
