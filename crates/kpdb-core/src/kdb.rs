//! Legacy KDB (KeePass 1.x, version 3) import and export.
//!
//! The payload is a CBC-encrypted concatenation of TLV group records
//! followed by TLV entry records. Group nesting is encoded through a per
//! record `Level` field; entries refer to their group by numeric id.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read};
use std::path::Path;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::binary::Binary;
use crate::cipher::{decrypt_cbc, encrypt_cbc, AesCipher, BlockCipher16, TwofishCipher};
use crate::database::{CipherAlgorithm, Database};
use crate::entry::{Attachment, BinaryRef, Entry};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::key::{Key, SubKeyResolution};
use crate::metadata::Metadata;
use crate::security::Protected;

const KDB_SIGNATURE_0: u32 = 0x9aa2d903;
pub(crate) const KDB_SIGNATURE_1: u32 = 0xb54bfb65;

const KDB_FLAG_RIJNDAEL: u32 = 0x00000002;
const KDB_FLAG_TWOFISH: u32 = 0x00000008;

const KDB_VERSION: u32 = 0x00030000;
const KDB_VERSION_MASK: u32 = 0xffffff00;

const HEADER_SIZE: usize = 124;

// Group record field types.
const GROUP_FIELD_EMPTY: u16 = 0x0000;
const GROUP_FIELD_ID: u16 = 0x0001;
const GROUP_FIELD_NAME: u16 = 0x0002;
const GROUP_FIELD_CREATION_TIME: u16 = 0x0003;
const GROUP_FIELD_MODIFICATION_TIME: u16 = 0x0004;
const GROUP_FIELD_ACCESS_TIME: u16 = 0x0005;
const GROUP_FIELD_EXPIRY_TIME: u16 = 0x0006;
const GROUP_FIELD_ICON: u16 = 0x0007;
const GROUP_FIELD_LEVEL: u16 = 0x0008;
const GROUP_FIELD_FLAGS: u16 = 0x0009;
const FIELD_END: u16 = 0xffff;

// Entry record field types.
const ENTRY_FIELD_EMPTY: u16 = 0x0000;
const ENTRY_FIELD_UUID: u16 = 0x0001;
const ENTRY_FIELD_GROUP_ID: u16 = 0x0002;
const ENTRY_FIELD_ICON: u16 = 0x0003;
const ENTRY_FIELD_TITLE: u16 = 0x0004;
const ENTRY_FIELD_URL: u16 = 0x0005;
const ENTRY_FIELD_USERNAME: u16 = 0x0006;
const ENTRY_FIELD_PASSWORD: u16 = 0x0007;
const ENTRY_FIELD_NOTES: u16 = 0x0008;
const ENTRY_FIELD_CREATION_TIME: u16 = 0x0009;
const ENTRY_FIELD_MODIFICATION_TIME: u16 = 0x000a;
const ENTRY_FIELD_ACCESS_TIME: u16 = 0x000b;
const ENTRY_FIELD_EXPIRY_TIME: u16 = 0x000c;
const ENTRY_FIELD_ATTACHMENT_NAME: u16 = 0x000d;
const ENTRY_FIELD_ATTACHMENT_DATA: u16 = 0x000e;

/// The packed "never" timestamp: 00YYYYYY YYYYYYMM MMDDDDDH HHHHMMMM MMSSSSSS
/// with every component at its sentinel value.
const NEVER_TIME: [u8; 5] = [0x2e, 0xdf, 0x39, 0x7e, 0xfb];

/// Packs a UTC timestamp into the 5-byte KDB date format. The unset
/// sentinel (epoch zero) maps to the "never" constant.
fn pack_time(time: DateTime<Utc>) -> [u8; 5] {
    if time.timestamp() == 0 {
        return NEVER_TIME;
    }

    let year = time.year() as u32;
    let month = time.month();
    let day = time.day();
    let hour = time.hour();
    let minute = time.minute();
    let second = time.second();

    [
        (year >> 6) as u8,
        (((year & 0x3f) << 2) | (month >> 2)) as u8,
        (((month & 0x3) << 6) | (day << 1) | (hour >> 4)) as u8,
        (((hour & 0xf) << 4) | (minute >> 2)) as u8,
        (((minute & 0x3) << 6) | second) as u8,
    ]
}

fn unpack_time(packed: &[u8; 5]) -> DateTime<Utc> {
    if *packed == NEVER_TIME {
        return DateTime::UNIX_EPOCH;
    }

    let b = packed.map(u32::from);
    let year = (b[0] << 6) | (b[1] >> 2);
    let month = ((b[1] & 0x03) << 2) | (b[2] >> 6);
    let day = (b[2] >> 1) & 0x1f;
    let hour = ((b[2] & 0x01) << 4) | (b[3] >> 4);
    let minute = ((b[3] & 0x0f) << 2) | (b[4] >> 6);
    let second = b[4] & 0x3f;

    match Utc
        .with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()
    {
        Some(time) => time,
        None => {
            debug!("unrepresentable KDB timestamp, treating as unset");
            DateTime::UNIX_EPOCH
        }
    }
}

fn short_field() -> Error {
    Error::Io("read error".to_string())
}

fn field_u16(field: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = field
        .get(..2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(short_field)?;
    Ok(u16::from_le_bytes(bytes))
}

fn field_u32(field: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = field
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(short_field)?;
    Ok(u32::from_le_bytes(bytes))
}

fn field_time(field: &[u8]) -> Result<DateTime<Utc>> {
    let bytes: [u8; 5] = field
        .get(..5)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(short_field)?;
    Ok(unpack_time(&bytes))
}

fn field_uuid(field: &[u8]) -> Result<Uuid> {
    let bytes: [u8; 16] = field
        .get(..16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(short_field)?;
    Ok(Uuid::from_bytes(bytes))
}

/// Strings are NUL-terminated UTF-8; the terminator is mandatory on the
/// wire, so a zero-size field is malformed.
fn field_string(field: &[u8]) -> Result<String> {
    if field.is_empty() {
        return Err(Error::Format("zero-size string field in KDB".to_string()));
    }
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| Error::Format("invalid UTF-8 in KDB string".to_string()))
}

fn protected_string(field: &[u8]) -> Result<Protected<String>> {
    Ok(Protected::new(field_string(field)?, false))
}

/// Reads one TLV field header plus its complete payload. Consuming the
/// whole payload up front guards against parsing past the field.
fn read_field<R: Read>(src: &mut R) -> Result<(u16, Vec<u8>)> {
    let mut header = [0u8; 6];
    src.read_exact(&mut header)?;
    let field_type = u16::from_le_bytes([header[0], header[1]]);
    let field_size = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;

    let mut field = vec![0u8; field_size];
    src.read_exact(&mut field)?;
    Ok((field_type, field))
}

fn read_group<R: Read>(src: &mut R) -> Result<(Group, u32, u16)> {
    let mut group = Group::new();
    let mut id = 0u32;
    let mut level = 0u16;

    loop {
        let (field_type, field) = read_field(src)?;
        match field_type {
            GROUP_FIELD_EMPTY => {}
            GROUP_FIELD_ID => id = field_u32(&field)?,
            GROUP_FIELD_NAME => group.name = field_string(&field)?,
            GROUP_FIELD_CREATION_TIME => group.creation_time = field_time(&field)?,
            GROUP_FIELD_MODIFICATION_TIME => group.modification_time = field_time(&field)?,
            GROUP_FIELD_ACCESS_TIME => group.access_time = field_time(&field)?,
            GROUP_FIELD_EXPIRY_TIME => group.expiry_time = field_time(&field)?,
            GROUP_FIELD_ICON => group.icon = field_u32(&field)?,
            GROUP_FIELD_LEVEL => level = field_u16(&field)?,
            GROUP_FIELD_FLAGS => group.flags = field_u16(&field)?,
            FIELD_END => return Ok((group, id, level)),
            _ => return Err(Error::Format("illegal group field in KDB".to_string())),
        }
    }
}

fn read_entry<R: Read>(src: &mut R) -> Result<(Entry, u32)> {
    let mut entry = Entry::new();
    let mut group_id = 0u32;
    let mut attachment_name: Option<String> = None;
    let mut attachment_data: Option<Binary> = None;

    loop {
        let (field_type, field) = read_field(src)?;
        match field_type {
            ENTRY_FIELD_EMPTY => {}
            ENTRY_FIELD_UUID => entry.uuid = field_uuid(&field)?,
            ENTRY_FIELD_GROUP_ID => group_id = field_u32(&field)?,
            ENTRY_FIELD_ICON => entry.icon = field_u32(&field)?,
            ENTRY_FIELD_TITLE => entry.title = protected_string(&field)?,
            ENTRY_FIELD_URL => entry.url = protected_string(&field)?,
            ENTRY_FIELD_USERNAME => entry.username = protected_string(&field)?,
            ENTRY_FIELD_PASSWORD => entry.password = protected_string(&field)?,
            ENTRY_FIELD_NOTES => entry.notes = protected_string(&field)?,
            ENTRY_FIELD_CREATION_TIME => entry.creation_time = field_time(&field)?,
            ENTRY_FIELD_MODIFICATION_TIME => entry.modification_time = field_time(&field)?,
            ENTRY_FIELD_ACCESS_TIME => entry.access_time = field_time(&field)?,
            ENTRY_FIELD_EXPIRY_TIME => entry.expiry_time = field_time(&field)?,
            ENTRY_FIELD_ATTACHMENT_NAME => {
                // KeePass 1.x writes a lone NUL for unused attachment names.
                let name = field_string(&field)?;
                if !name.is_empty() {
                    attachment_name = Some(name);
                }
            }
            ENTRY_FIELD_ATTACHMENT_DATA => {
                if !field.is_empty() {
                    attachment_data = Some(Binary::new(Protected::new(field, false)));
                }
            }
            FIELD_END => {
                if attachment_name.is_some() || attachment_data.is_some() {
                    entry.add_attachment(Attachment {
                        name: attachment_name.unwrap_or_default(),
                        binary: BinaryRef::Inline(attachment_data.unwrap_or_default()),
                    });
                }
                return Ok((entry, group_id));
            }
            _ => return Err(Error::Format("illegal entry field in KDB".to_string())),
        }
    }
}

/// Rebuilds the group tree from flat records using each record's level.
///
/// Levels follow pre-order: a record may go at most one level deeper than
/// its predecessor; anything steeper is malformed.
fn build_tree(records: Vec<(Group, u16)>) -> Result<Group> {
    let mut parents: Vec<Option<usize>> = Vec::with_capacity(records.len());
    let mut path: Vec<usize> = Vec::new();

    for (index, (_, level)) in records.iter().enumerate() {
        let depth = *level as usize;
        if depth > path.len() {
            return Err(Error::Format("malformed group tree in KDB".to_string()));
        }
        path.truncate(depth);
        parents.push(path.last().copied());
        path.push(index);
    }

    // Children always follow their parent, so walking back to front moves
    // each group into a parent whose own subtree is already complete.
    let mut slots: Vec<Option<Group>> = records.into_iter().map(|(g, _)| Some(g)).collect();
    let mut root = Group::new();

    for index in (0..slots.len()).rev() {
        let mut group = slots[index].take().expect("group slot consumed once");
        group.groups.reverse();
        match parents[index] {
            Some(parent) => slots[parent]
                .as_mut()
                .expect("parent outlives its children")
                .groups
                .push(group),
            None => root.groups.push(group),
        }
    }
    root.groups.reverse();

    Ok(root)
}

struct KdbHeader {
    flags: u32,
    version: u32,
    master_seed: [u8; 16],
    init_vector: [u8; 16],
    num_groups: u32,
    num_entries: u32,
    content_hash: [u8; 32],
    transform_seed: [u8; 32],
    transform_rounds: u32,
}

fn parse_header(bytes: &[u8; HEADER_SIZE]) -> Result<KdbHeader> {
    let u32_at = |off: usize| {
        u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
    };
    let array_at = |off: usize, len: usize| bytes[off..off + len].to_vec();

    let signature0 = u32_at(0);
    let signature1 = u32_at(4);
    if signature0 != KDB_SIGNATURE_0 || signature1 != KDB_SIGNATURE_1 {
        return Err(Error::Format("not a KDB database".to_string()));
    }

    let mut master_seed = [0u8; 16];
    master_seed.copy_from_slice(&array_at(16, 16));
    let mut init_vector = [0u8; 16];
    init_vector.copy_from_slice(&array_at(32, 16));
    let mut content_hash = [0u8; 32];
    content_hash.copy_from_slice(&array_at(56, 32));
    let mut transform_seed = [0u8; 32];
    transform_seed.copy_from_slice(&array_at(88, 32));

    Ok(KdbHeader {
        flags: u32_at(8),
        version: u32_at(12),
        master_seed,
        init_vector,
        num_groups: u32_at(48),
        num_entries: u32_at(52),
        content_hash,
        transform_seed,
        transform_rounds: u32_at(120),
    })
}

fn derive_final_key(
    master_seed: &[u8],
    transform_seed: &[u8; 32],
    transform_rounds: u64,
    key: &Key,
) -> zeroize::Zeroizing<[u8; 32]> {
    let transformed = key.transform(
        transform_seed,
        transform_rounds,
        SubKeyResolution::HashSubKeysOnlyIfCompositeKey,
    );

    let mut hasher = Sha256::new();
    hasher.update(master_seed);
    hasher.update(transformed.as_ref());
    zeroize::Zeroizing::new(hasher.finalize().into())
}

/// Imports a KDB version 3 database.
pub fn import(path: &Path, key: &Key) -> Result<Database> {
    let mut src = File::open(path)?;

    let mut header_bytes = [0u8; HEADER_SIZE];
    src.read_exact(&mut header_bytes)
        .map_err(|_| Error::Format("not a KDB database".to_string()))?;
    let header = parse_header(&header_bytes)?;

    match header.version & KDB_VERSION_MASK {
        0x00010000 => return Err(Error::Format("KDB version 1 is not supported".to_string())),
        0x00020000 => return Err(Error::Format("KDB version 2 is not supported".to_string())),
        KDB_VERSION => {}
        _ => {
            return Err(Error::Format(format!(
                "unknown KDB version {:#x}",
                header.version
            )))
        }
    }

    let mut db = Database::new();
    db.master_seed = header.master_seed.to_vec();
    db.init_vector = header.init_vector;
    db.transform_seed = header.transform_seed;
    db.transform_rounds = header.transform_rounds as u64;

    let final_key = derive_final_key(
        &header.master_seed,
        &header.transform_seed,
        header.transform_rounds as u64,
        key,
    );

    let cipher: Box<dyn BlockCipher16> = if header.flags & KDB_FLAG_RIJNDAEL != 0 {
        db.cipher = CipherAlgorithm::Aes;
        Box::new(AesCipher::new(&final_key))
    } else if header.flags & KDB_FLAG_TWOFISH != 0 {
        db.cipher = CipherAlgorithm::Twofish;
        Box::new(TwofishCipher::new(&final_key))
    } else {
        return Err(Error::Format("unknown cipher in KDB".to_string()));
    };

    // A padding failure here almost always means wrong credentials.
    let mut content = Vec::new();
    decrypt_cbc(&mut src, &mut content, cipher.as_ref(), &header.init_vector)
        .map_err(|_| Error::Password)?;

    let content_hash: [u8; 32] = Sha256::digest(&content).into();
    if content_hash != header.content_hash {
        return Err(Error::Password);
    }
    debug!(
        "KDB payload decrypted: {} groups, {} entries",
        header.num_groups, header.num_entries
    );

    let mut cursor = Cursor::new(content);

    let mut records = Vec::with_capacity(header.num_groups as usize);
    let mut group_index_by_id = HashMap::new();
    for _ in 0..header.num_groups {
        let (group, id, level) = read_group(&mut cursor)?;
        group_index_by_id.insert(id, records.len());
        records.push((group, level));
    }

    for _ in 0..header.num_entries {
        let (entry, group_id) = read_entry(&mut cursor)?;
        let index = group_index_by_id
            .get(&group_id)
            .ok_or_else(|| Error::Format("database contains an orphaned entry".to_string()))?;
        records[*index].0.entries.push(entry);
    }

    db.root = build_tree(records)?;
    db.meta = None;
    Ok(db)
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_field(out: &mut Vec<u8>, field_type: u16, data: &[u8]) {
    put_u16(out, field_type);
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

fn put_string_field(out: &mut Vec<u8>, field_type: u16, value: &str) {
    put_u16(out, field_type);
    put_u32(out, value.len() as u32 + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn write_group(out: &mut Vec<u8>, group: &Group, group_id: u32, level: u16) {
    put_field(out, GROUP_FIELD_ID, &group_id.to_le_bytes());
    put_string_field(out, GROUP_FIELD_NAME, &group.name);
    put_field(out, GROUP_FIELD_CREATION_TIME, &pack_time(group.creation_time));
    put_field(
        out,
        GROUP_FIELD_MODIFICATION_TIME,
        &pack_time(group.modification_time),
    );
    put_field(out, GROUP_FIELD_ACCESS_TIME, &pack_time(group.access_time));
    put_field(out, GROUP_FIELD_EXPIRY_TIME, &pack_time(group.expiry_time));
    put_field(out, GROUP_FIELD_ICON, &group.icon.to_le_bytes());
    put_field(out, GROUP_FIELD_LEVEL, &level.to_le_bytes());
    put_field(out, GROUP_FIELD_FLAGS, &group.flags.to_le_bytes());
    put_field(out, FIELD_END, &[]);
}

fn write_entry(out: &mut Vec<u8>, entry: &Entry, group_id: u32, meta: Option<&Metadata>) {
    put_field(out, ENTRY_FIELD_UUID, entry.uuid.as_bytes());
    put_field(out, ENTRY_FIELD_GROUP_ID, &group_id.to_le_bytes());
    put_field(out, ENTRY_FIELD_ICON, &entry.icon.to_le_bytes());
    put_string_field(out, ENTRY_FIELD_TITLE, entry.title.value());
    put_string_field(out, ENTRY_FIELD_URL, entry.url.value());
    put_string_field(out, ENTRY_FIELD_USERNAME, entry.username.value());
    put_string_field(out, ENTRY_FIELD_PASSWORD, entry.password.value());
    put_string_field(out, ENTRY_FIELD_NOTES, entry.notes.value());
    put_field(out, ENTRY_FIELD_CREATION_TIME, &pack_time(entry.creation_time));
    put_field(
        out,
        ENTRY_FIELD_MODIFICATION_TIME,
        &pack_time(entry.modification_time),
    );
    put_field(out, ENTRY_FIELD_ACCESS_TIME, &pack_time(entry.access_time));
    put_field(out, ENTRY_FIELD_EXPIRY_TIME, &pack_time(entry.expiry_time));

    if let Some(attachment) = entry.attachments.first() {
        if entry.attachments.len() > 1 {
            warn!("KDB supports a single attachment per entry; extra attachments dropped");
        }

        if !attachment.name.is_empty() {
            put_string_field(out, ENTRY_FIELD_ATTACHMENT_NAME, &attachment.name);
        }

        let binary = match &attachment.binary {
            BinaryRef::Inline(binary) => Some(binary),
            BinaryRef::Pool(index) => meta.and_then(|meta| meta.binaries.get(*index)),
        };
        if let Some(binary) = binary {
            if !binary.is_empty() {
                put_field(out, ENTRY_FIELD_ATTACHMENT_DATA, binary.data.value());
            }
        }
    }

    put_field(out, FIELD_END, &[]);
}

/// Exports `db` as a KDB version 3 database.
///
/// Groups are written in pre-order with sequential ids; entries are written
/// in a second pass referring to their group's visit index. Entries placed
/// directly on the synthetic root cannot be represented and are rejected.
pub fn export(path: &Path, db: &Database, key: &Key) -> Result<()> {
    let master_seed: [u8; 16] = db
        .master_seed
        .as_slice()
        .try_into()
        .map_err(|_| Error::Internal("KDB master seed must be 16 bytes".to_string()))?;

    if !db.root.entries.is_empty() {
        return Err(Error::Format(
            "KDB cannot store entries outside a group".to_string(),
        ));
    }

    let mut dst = BufWriter::new(File::create(path).map_err(|e| Error::Io(e.to_string()))?);

    let final_key = derive_final_key(&master_seed, &db.transform_seed, db.transform_rounds, key);

    let (cipher, flags): (Box<dyn BlockCipher16>, u32) = match db.cipher {
        CipherAlgorithm::Aes => (Box::new(AesCipher::new(&final_key)), KDB_FLAG_RIJNDAEL),
        CipherAlgorithm::Twofish => (Box::new(TwofishCipher::new(&final_key)), KDB_FLAG_TWOFISH),
    };

    let mut flat: Vec<&Group> = Vec::new();
    let mut depths: Vec<usize> = Vec::new();
    db.root.visit_groups(&mut |group, depth| {
        flat.push(group);
        depths.push(depth);
    });

    if flat.len() > u32::MAX as usize {
        return Err(Error::Internal("group count exceeds KDB maximum".to_string()));
    }
    if depths.iter().any(|&depth| depth > u16::MAX as usize) {
        return Err(Error::Internal(
            "group hierarchy exceeds KDB maximum".to_string(),
        ));
    }

    let mut content = Vec::new();
    for (index, group) in flat.iter().enumerate() {
        write_group(&mut content, group, index as u32, depths[index] as u16);
    }

    let mut num_entries = 0u64;
    for (index, group) in flat.iter().enumerate() {
        for entry in &group.entries {
            write_entry(&mut content, entry, index as u32, db.meta.as_ref());
            num_entries += 1;
        }
    }
    if num_entries > u32::MAX as u64 {
        return Err(Error::Internal("entry count exceeds KDB maximum".to_string()));
    }

    let content_hash: [u8; 32] = Sha256::digest(&content).into();

    let mut header = Vec::with_capacity(HEADER_SIZE);
    put_u32(&mut header, KDB_SIGNATURE_0);
    put_u32(&mut header, KDB_SIGNATURE_1);
    put_u32(&mut header, flags);
    put_u32(&mut header, KDB_VERSION);
    header.extend_from_slice(&master_seed);
    header.extend_from_slice(&db.init_vector);
    put_u32(&mut header, flat.len() as u32);
    put_u32(&mut header, num_entries as u32);
    header.extend_from_slice(&content_hash);
    header.extend_from_slice(&db.transform_seed);
    put_u32(&mut header, db.transform_rounds as u32);

    use std::io::Write as _;
    dst.write_all(&header)?;

    encrypt_cbc(
        &mut Cursor::new(content),
        &mut dst,
        cipher.as_ref(),
        &db.init_vector,
    )?;
    dst.flush()?;
    Ok(())
}
