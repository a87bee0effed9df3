//! Whole-file import/export round trips for both formats.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use kpdb_core::{
    database_to_json, kdb, kdbx, Attachment, Binary, BinaryRef, CipherAlgorithm, Database, Entry,
    Error, Group, Icon, Key, Metadata, Protected, Temporal,
};

fn date(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn scratch_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn simple_entry(title: &str, username: &str, password: &str) -> Entry {
    let mut entry = Entry::new();
    entry.title = Protected::new(title.to_string(), false);
    entry.username = Protected::new(username.to_string(), false);
    entry.password = Protected::new(password.to_string(), true);
    entry.creation_time = date(2014, 2, 1, 9, 0, 0);
    entry.modification_time = date(2014, 2, 2, 10, 30, 0);
    entry.access_time = date(2014, 2, 3, 11, 45, 15);
    entry
}

/// A database exercising every KDBX feature the format layer round-trips.
fn complex_database() -> Database {
    let mut db = Database::new();
    db.compress = true;

    let mut meta = Metadata::default();
    meta.generator = "kpdb-core".to_string();
    meta.database_name = Temporal::new("Complex".to_string(), date(2014, 5, 1, 12, 0, 0));
    meta.database_desc = Temporal::new("fixture database".to_string(), date(2014, 5, 1, 12, 0, 1));
    meta.default_username = Temporal::new("joe".to_string(), date(2014, 5, 1, 12, 0, 2));
    meta.database_color = "#ff0000".to_string();
    meta.master_key_changed = date(2014, 5, 2, 8, 0, 0);
    meta.history_max_items = 10;
    meta.history_max_size = 1024 * 1024;
    meta.add_custom_data("origin".to_string(), "fixture".to_string());

    let icon_uuid = kpdb_core::random::generate_uuid();
    meta.add_icon(Icon::new(icon_uuid, vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a]));

    let plain_pool = meta.add_binary(Binary::new(Protected::new(
        b"plain pool data".to_vec(),
        false,
    )));
    let mut compressed = Binary::new(Protected::new(vec![7u8; 4096], false));
    compressed.compress = true;
    let compressed_pool = meta.add_binary(compressed);
    let protected_pool = meta.add_binary(Binary::new(Protected::new(
        b"protected pool data".to_vec(),
        true,
    )));

    let mut general = Group::new();
    general.name = "General".to_string();
    general.notes = "top level".to_string();
    general.icon = 48;
    general.custom_icon = Some(icon_uuid);
    general.expanded = true;
    general.autotype = true;
    general.search = true;
    general.creation_time = date(2014, 1, 1, 0, 0, 1);
    general.modification_time = date(2014, 1, 1, 0, 0, 2);

    let mut entry = simple_entry("Sample Entry", "joe", "hunter2");
    entry.url = Protected::new("http://example.com/".to_string(), false);
    entry.notes = Protected::new("multi\nline\nnotes".to_string(), false);
    entry.tags = "web;personal".to_string();
    entry.override_url = "cmd://firefox".to_string();
    entry.fg_color = "#000000".to_string();
    entry.bg_color = "#ffffff".to_string();
    entry.icon = 1;
    entry.custom_icon = Some(icon_uuid);
    entry.expires = true;
    entry.expiry_time = date(2020, 12, 31, 23, 59, 59);
    entry.usage_count = 7;
    entry.auto_type.enabled = true;
    entry.auto_type.obfuscation = 1;
    entry.auto_type.sequence = "{USERNAME}{TAB}{PASSWORD}{ENTER}".to_string();
    entry
        .auto_type
        .add_association("Firefox*".to_string(), "{PASSWORD}{ENTER}".to_string());
    entry.add_custom_field(
        "Account Number".to_string(),
        Protected::new("1234567".to_string(), false),
    );
    entry.add_custom_field(
        "PIN".to_string(),
        Protected::new("9876".to_string(), true),
    );
    entry.add_attachment(Attachment {
        name: "plain.txt".to_string(),
        binary: BinaryRef::Pool(plain_pool),
    });
    entry.add_attachment(Attachment {
        name: "compressed.bin".to_string(),
        binary: BinaryRef::Pool(compressed_pool),
    });
    entry.add_attachment(Attachment {
        name: "protected.bin".to_string(),
        binary: BinaryRef::Pool(protected_pool),
    });
    entry.add_attachment(Attachment {
        name: "inline.txt".to_string(),
        binary: BinaryRef::Inline(Binary::new(Protected::new(
            b"inline attachment".to_vec(),
            false,
        ))),
    });

    let mut old_version = simple_entry("Sample Entry", "joe", "previous-password");
    old_version.uuid = entry.uuid;
    entry.add_history_entry(old_version);

    general.last_visible_entry = Some(entry.uuid);
    general.add_entry(entry);

    let mut subgroup = Group::new();
    subgroup.name = "eMail".to_string();
    subgroup.icon = 19;
    subgroup.add_entry(simple_entry("Mail Account", "joe@example.com", "s3cret"));
    general.add_group(subgroup);

    let mut recycle_bin = Group::new();
    recycle_bin.name = "Recycle Bin".to_string();
    recycle_bin.icon = 43;

    meta.recycle_bin = Some(recycle_bin.uuid);
    meta.recycle_bin_changed = date(2014, 5, 3, 9, 0, 0);
    meta.entry_templates = Some(general.uuid);
    meta.entry_templates_changed = date(2014, 5, 3, 9, 0, 1);
    meta.last_selected_group = Some(general.uuid);
    meta.last_visible_group = Some(general.uuid);

    let mut root = Group::new();
    root.name = "NewDatabase".to_string();
    root.add_group(general);
    root.add_group(recycle_bin);

    db.root = root;
    db.meta = Some(meta);
    db
}

#[test]
fn kdbx_empty_database_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "empty.kdbx");

    let mut db = Database::new();
    db.root.name = "General".to_string();
    db.meta = Some(Metadata::default());

    let key = Key::new("password");
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    assert_eq!(imported.root.name, "General");
    assert!(imported.root.groups.is_empty());
    assert!(imported.root.entries.is_empty());
    assert_eq!(database_to_json(&imported), database_to_json(&db));
}

#[test]
fn kdbx_wrong_password_fails() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "pw.kdbx");

    let mut db = Database::new();
    db.root.name = "General".to_string();
    db.meta = Some(Metadata::default());

    kdbx::export(&path, &db, &Key::new("password")).unwrap();

    let res = kdbx::import(&path, &Key::new("wrong_password"));
    assert!(matches!(res, Err(Error::Password)));
}

#[test]
fn kdbx_complex_round_trip_compressed() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "complex.kdbx");

    let db = complex_database();
    let key = Key::new("password");
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    assert_eq!(imported, db);
    assert_eq!(database_to_json(&imported), database_to_json(&db));

    // Exporting the imported tree again must reach a fixpoint.
    let path2 = scratch_path(&dir, "complex2.kdbx");
    kdbx::export(&path2, &imported, &key).unwrap();
    let imported2 = kdbx::import(&path2, &key).unwrap();
    assert_eq!(imported2, imported);
}

#[test]
fn kdbx_complex_round_trip_uncompressed() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "complex-raw.kdbx");

    let mut db = complex_database();
    db.compress = false;

    let key = Key::new("password");
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    assert!(!imported.compress);
    assert_eq!(imported, db);
}

#[test]
fn kdbx_keyfile_only() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "keyfile.kdbx");
    let keyfile_path = scratch_path(&dir, "keyfile.key");

    std::fs::File::create(&keyfile_path)
        .unwrap()
        .write_all("5a".repeat(32).as_bytes())
        .unwrap();

    let mut key = Key::default();
    key.set_keyfile(&keyfile_path).unwrap();

    let db = complex_database();
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    assert_eq!(imported, db);
}

#[test]
fn kdbx_password_plus_keyfile_requires_both() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "both.kdbx");
    let keyfile_path = scratch_path(&dir, "both.key");

    std::fs::File::create(&keyfile_path)
        .unwrap()
        .write_all("c3".repeat(32).as_bytes())
        .unwrap();

    let mut key = Key::new("password");
    key.set_keyfile(&keyfile_path).unwrap();

    let db = complex_database();
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    assert_eq!(imported, db);

    let password_only = Key::new("password");
    assert!(matches!(
        kdbx::import(&path, &password_only),
        Err(Error::Password)
    ));

    let mut keyfile_only = Key::default();
    keyfile_only.set_keyfile(&keyfile_path).unwrap();
    assert!(matches!(
        kdbx::import(&path, &keyfile_only),
        Err(Error::Password)
    ));
}

fn kdb_database(cipher: CipherAlgorithm) -> Database {
    let mut db = Database::new();
    db.cipher = cipher;
    db.master_seed = kpdb_core::random::random_vec(16);
    db.transform_rounds = 600;

    let mut internet = Group::new();
    internet.name = "Internet".to_string();
    internet.icon = 1;
    internet.flags = 2;
    internet.creation_time = date(2013, 10, 1, 8, 0, 0);
    internet.modification_time = date(2013, 10, 2, 8, 0, 0);
    internet.access_time = date(2013, 10, 3, 8, 0, 0);

    let mut entry = simple_entry("Homepage", "admin", "changeme");
    entry.url = Protected::new("http://localhost/".to_string(), false);
    entry.notes = Protected::new("first entry".to_string(), false);
    entry.icon = 27;
    entry.add_attachment(Attachment {
        name: "attachment.dat".to_string(),
        binary: BinaryRef::Inline(Binary::new(Protected::new(vec![0, 1, 2, 3, 255], false))),
    });
    internet.add_entry(entry);

    let mut deep = Group::new();
    deep.name = "Banking".to_string();
    deep.add_entry(simple_entry("Bank", "joe", "pin1234"));

    let mut deeper = Group::new();
    deeper.name = "Savings".to_string();
    deeper.add_entry(simple_entry("Savings Account", "joe", "pin5678"));
    deep.add_group(deeper);
    internet.add_group(deep);

    let mut backup = Group::new();
    backup.name = "Backup".to_string();

    // KeePass 1.x application-state entry: invisible in renderings but kept.
    let mut meta_entry = Entry::new();
    meta_entry.title = Protected::new("Meta-Info".to_string(), false);
    meta_entry.url = Protected::new("$".to_string(), false);
    meta_entry.username = Protected::new("SYSTEM".to_string(), false);
    meta_entry.notes = Protected::new("KPX_GROUP_TREE_STATE".to_string(), false);
    meta_entry.add_attachment(Attachment {
        name: "bin-stream".to_string(),
        binary: BinaryRef::Inline(Binary::new(Protected::new(vec![0, 0, 0, 0], false))),
    });
    backup.add_entry(meta_entry);

    db.root.groups = vec![internet, backup];
    db
}

#[test]
fn kdb_round_trip_aes() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "legacy.kdb");

    let db = kdb_database(CipherAlgorithm::Aes);
    let key = Key::new("password");
    kdb::export(&path, &db, &key).unwrap();

    let imported = kdb::import(&path, &key).unwrap();
    assert_eq!(imported.cipher, CipherAlgorithm::Aes);
    assert_eq!(database_to_json(&imported), database_to_json(&db));

    // Entry identity is stored on the wire; group identity is not.
    let original_entry = &db.root.groups[0].entries[0];
    let imported_entry = &imported.root.groups[0].entries[0];
    assert_eq!(imported_entry.uuid, original_entry.uuid);
    assert_eq!(imported_entry.creation_time, original_entry.creation_time);
    assert_eq!(imported_entry.attachments, original_entry.attachments);

    // The hidden application-state entry survives the round trip.
    assert!(imported.root.groups[1].entries[0].is_meta_entry());

    // Second cycle is a fixpoint.
    let path2 = scratch_path(&dir, "legacy2.kdb");
    kdb::export(&path2, &imported, &key).unwrap();
    let imported2 = kdb::import(&path2, &key).unwrap();
    assert_eq!(database_to_json(&imported2), database_to_json(&imported));
}

#[test]
fn kdb_round_trip_twofish() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "twofish.kdb");

    let db = kdb_database(CipherAlgorithm::Twofish);
    let key = Key::new("password");
    kdb::export(&path, &db, &key).unwrap();

    let imported = kdb::import(&path, &key).unwrap();
    assert_eq!(imported.cipher, CipherAlgorithm::Twofish);
    assert_eq!(database_to_json(&imported), database_to_json(&db));
}

#[test]
fn kdb_wrong_password_fails() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "badpw.kdb");

    let db = kdb_database(CipherAlgorithm::Aes);
    kdb::export(&path, &db, &Key::new("password")).unwrap();

    assert!(matches!(
        kdb::import(&path, &Key::new("wrong_password")),
        Err(Error::Password)
    ));
}

#[test]
fn kdb_rejects_entries_on_the_root() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "root-entry.kdb");

    let mut db = kdb_database(CipherAlgorithm::Aes);
    db.root.add_entry(simple_entry("lost", "x", "y"));

    assert!(matches!(
        kdb::export(&path, &db, &Key::new("password")),
        Err(Error::Format(_))
    ));
}

#[test]
fn import_detects_format_by_signature() {
    let dir = TempDir::new().unwrap();

    let kdbx_path = scratch_path(&dir, "auto.kdbx");
    let mut kdbx_db = Database::new();
    kdbx_db.root.name = "General".to_string();
    kdbx_db.meta = Some(Metadata::default());
    let key = Key::new("password");
    kdbx::export(&kdbx_path, &kdbx_db, &key).unwrap();

    let kdb_path = scratch_path(&dir, "auto.kdb");
    let kdb_db = kdb_database(CipherAlgorithm::Aes);
    kdb::export(&kdb_path, &kdb_db, &key).unwrap();

    assert!(kpdb_core::import(&kdbx_path, &key).unwrap().meta.is_some());
    assert!(kpdb_core::import(&kdb_path, &key).unwrap().meta.is_none());
}

#[test]
fn import_rejects_unknown_signature() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "garbage.bin");
    std::fs::write(&path, b"this is not a password database").unwrap();

    assert!(matches!(
        kpdb_core::import(&path, &Key::new("password")),
        Err(Error::Format(_))
    ));
}

#[test]
fn import_missing_file_is_reported() {
    let res = kpdb_core::import(
        std::path::Path::new("/nonexistent/database.kdbx"),
        &Key::new("password"),
    );
    assert!(matches!(res, Err(Error::FileNotFound)));
}

#[test]
fn kdbx_export_without_metadata_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "nometa.kdbx");

    let mut db = Database::new();
    db.root.name = "General".to_string();

    let key = Key::new("password");
    kdbx::export(&path, &db, &key).unwrap();

    let imported = kdbx::import(&path, &key).unwrap();
    let meta = imported.meta.unwrap();
    assert_eq!(meta.maintenance_hist_days, 365);
    assert!(meta.recycle_bin.is_none());
}

#[test]
fn kdbx_corrupted_payload_is_not_a_password_error() {
    let dir = TempDir::new().unwrap();
    let path = scratch_path(&dir, "corrupt.kdbx");

    let db = complex_database();
    let key = Key::new("password");
    kdbx::export(&path, &db, &key).unwrap();

    // Flip one bit near the end of the encrypted payload. CBC decryption
    // still succeeds for earlier blocks, so this surfaces as a stream
    // integrity failure rather than a credential failure.
    let mut data = std::fs::read(&path).unwrap();
    let index = data.len() - 200;
    data[index] ^= 0x01;
    std::fs::write(&path, &data).unwrap();

    assert!(matches!(kdbx::import(&path, &key), Err(Error::Io(_))));
}
