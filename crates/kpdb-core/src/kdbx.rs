//! KDBX (KeePass 2.x, format version 3) import and export.
//!
//! A KDBX file is a small binary header followed by a CBC-encrypted body.
//! The decrypted body starts with a 32-byte sentinel, then a hashed block
//! stream whose payload is (optionally gzipped) XML. Protected values inside
//! the XML are XORed with a Salsa20 keystream that reader and writer must
//! consume in document order.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

use crate::binary::Binary;
use crate::cipher::{decrypt_cbc, encrypt_cbc, AesCipher};
use crate::database::{CipherAlgorithm, Database};
use crate::entry::{Attachment, AutoType, BinaryRef, Entry};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::key::{Key, SubKeyResolution};
use crate::metadata::{Icon, Metadata};
use crate::obfuscator::RandomObfuscator;
use crate::random::random_array;
use crate::security::{Protected, Temporal};
use crate::stream::{HashedBlockReader, HashedBlockWriter};

const KDBX_SIGNATURE_0: u32 = 0x9aa2d903;
pub(crate) const KDBX_SIGNATURE_1: u32 = 0xb54bfb67;

const KDBX_VERSION_CRITICAL_MASK: u32 = 0xffff0000;
const KDBX_VERSION: u32 = 0x00030001;

const KDBX_CIPHER_AES: [u8; 16] = [
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a,
    0xff,
];

/// Nonce of the Salsa20 inner random stream.
const INNER_RANDOM_STREAM_IV: [u8; 8] = [0xe8, 0x30, 0x09, 0x4b, 0x97, 0x20, 0x5d, 0x2a];

const COMPRESSION_NONE: u32 = 0;
const COMPRESSION_GZIP: u32 = 1;

const RANDOM_STREAM_SALSA20: u32 = 2;

// Header field ids.
const FIELD_END_OF_HEADER: u8 = 0;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION_FLAGS: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_TRANSFORM_SEED: u8 = 5;
const FIELD_TRANSFORM_ROUNDS: u8 = 6;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_INNER_RANDOM_STREAM_KEY: u8 = 8;
const FIELD_CONTENT_STREAM_START_BYTES: u8 = 9;
const FIELD_INNER_RANDOM_STREAM_ID: u8 = 10;

const NEVER_DATE: &str = "2999-12-28T22:59:59Z";

/// Parses an ISO-8601 UTC date. The KeePass "never" literal and an absent
/// value both map to the unset sentinel.
fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() || text == NEVER_DATE {
        return Ok(DateTime::UNIX_EPOCH);
    }

    let naive = NaiveDateTime::parse_from_str(text.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| Error::Format(format!("malformed date in KDBX: {text:?}")))?;
    Ok(naive.and_utc())
}

fn write_date(time: DateTime<Utc>) -> String {
    if time.timestamp() == 0 {
        return NEVER_DATE.to_string();
    }
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Truthiness of XML booleans: leading `1`, `t`, `T`, `y` or `Y`. An empty
/// value yields the caller's default, mirroring how absent elements behave.
fn parse_bool(text: &str, default: bool) -> bool {
    match text.trim().chars().next() {
        None => default,
        Some(c) => matches!(c, '1' | 't' | 'T' | 'y' | 'Y'),
    }
}

fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn parse_u32(text: &str, default: u32) -> u32 {
    text.trim().parse().unwrap_or(default)
}

fn attr<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn attr_bool(attributes: &[OwnedAttribute], name: &str) -> bool {
    attr(attributes, name).is_some_and(|value| parse_bool(value, false))
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|_| Error::Format("malformed base64 in KDBX".to_string()))
}

fn decode_uuid(text: &str) -> Result<Option<Uuid>> {
    let decoded = decode_base64(text)?;
    if decoded.is_empty() {
        return Ok(None);
    }
    let bytes: [u8; 16] = decoded
        .try_into()
        .map_err(|_| Error::Format("malformed UUID in KDBX".to_string()))?;
    Ok(Some(Uuid::from_bytes(bytes)))
}

fn encode_uuid(uuid: Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn map_reader_error(err: xml::reader::Error) -> Error {
    match err.kind() {
        xml::reader::ErrorKind::Io(io_err) => Error::Io(io_err.to_string()),
        _ => Error::Format(format!("malformed XML in KDBX: {err}")),
    }
}

fn map_writer_error(err: xml::writer::Error) -> Error {
    match err {
        xml::writer::Error::Io(io_err) => Error::Io(io_err.to_string()),
        other => Error::Internal(format!("XML emitter error: {other}")),
    }
}

/// Pull-style reader over the decrypted XML document.
struct XmlReader<R: Read> {
    inner: EventReader<R>,
}

impl<R: Read> XmlReader<R> {
    fn new(src: R) -> Self {
        let config = ParserConfig::new()
            .trim_whitespace(true)
            .cdata_to_characters(true)
            .ignore_comments(true);
        Self {
            inner: EventReader::new_with_config(src, config),
        }
    }

    fn next(&mut self) -> Result<XmlEvent> {
        self.inner.next().map_err(map_reader_error)
    }

    /// Consumes everything up to the end of the current element and returns
    /// its concatenated character data. Nested elements are skipped.
    fn read_text(&mut self) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next()? {
                XmlEvent::Characters(chunk) => text.push_str(&chunk),
                XmlEvent::StartElement { .. } => self.skip_element()?,
                XmlEvent::EndElement { .. } => return Ok(text),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    /// Consumes the remainder of the current element, including children.
    fn skip_element(&mut self) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.next()? {
                XmlEvent::StartElement { .. } => depth += 1,
                XmlEvent::EndElement { .. } => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }
}

/// Per-invocation parsing state.
#[derive(Default)]
struct KdbxCodec {
    /// Pool id attribute value to index into the metadata binary pool.
    binary_ids: HashMap<String, usize>,
    /// Header hash found in `Meta/HeaderHash`, compared after the parse.
    expected_header_hash: Option<[u8; 32]>,
    /// Raw group references from Meta, resolved once the tree is known.
    last_selected_group: String,
    last_visible_group: String,
}

impl KdbxCodec {
    fn parse_protected_value(
        &self,
        attributes: &[OwnedAttribute],
        text: String,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<Protected<String>> {
        let protected = attr_bool(attributes, "Protected");
        if protected {
            let decoded = decode_base64(&text)?;
            if !decoded.is_empty() {
                let plain = obfuscator.process(&decoded);
                let value = String::from_utf8(plain).map_err(|_| {
                    Error::Format("invalid UTF-8 in protected value".to_string())
                })?;
                return Ok(Protected::new(value, true));
            }
        }

        let in_memory = attr_bool(attributes, "ProtectedInMemory");
        Ok(Protected::new(text, protected || in_memory))
    }

    /// Decodes a pool or inline binary value from its attributes and text.
    fn parse_binary_value(
        &self,
        attributes: &[OwnedAttribute],
        text: String,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<Binary> {
        if attr_bool(attributes, "Protected") {
            let plain = obfuscator.process(&decode_base64(&text)?);
            return Ok(Binary::new(Protected::new(plain, true)));
        }

        let in_memory = attr_bool(attributes, "ProtectedInMemory");
        if attr_bool(attributes, "Compressed") {
            let data = gzip_decompress(&decode_base64(&text)?)?;
            let mut binary = Binary::new(Protected::new(data, in_memory));
            binary.compress = true;
            return Ok(binary);
        }

        Ok(Binary::new(Protected::new(decode_base64(&text)?, in_memory)))
    }

    fn parse_memory_protection<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &mut Metadata,
    ) -> Result<()> {
        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => {
                    let text = xml.read_text()?;
                    let mp = &mut meta.memory_protection;
                    match name.local_name.as_str() {
                        "ProtectTitle" => mp.title = parse_bool(&text, false),
                        "ProtectUserName" => mp.username = parse_bool(&text, false),
                        "ProtectPassword" => mp.password = parse_bool(&text, true),
                        "ProtectURL" => mp.url = parse_bool(&text, false),
                        "ProtectNotes" => mp.notes = parse_bool(&text, false),
                        _ => {}
                    }
                }
                XmlEvent::EndElement { .. } => return Ok(()),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_custom_icons<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &mut Metadata,
    ) -> Result<()> {
        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => {
                    if name.local_name != "Icon" {
                        xml.skip_element()?;
                        continue;
                    }

                    let mut uuid = None;
                    let mut data = Vec::new();
                    loop {
                        match xml.next()? {
                            XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                                "UUID" => uuid = decode_uuid(&xml.read_text()?)?,
                                "Data" => data = decode_base64(&xml.read_text()?)?,
                                _ => xml.skip_element()?,
                            },
                            XmlEvent::EndElement { .. } => break,
                            XmlEvent::EndDocument => {
                                return Err(Error::Format("truncated XML in KDBX".to_string()))
                            }
                            _ => {}
                        }
                    }

                    // Icons without image data are useless; drop them.
                    if data.is_empty() {
                        continue;
                    }
                    if let Some(uuid) = uuid {
                        meta.add_icon(Icon::new(uuid, data));
                    }
                }
                XmlEvent::EndElement { .. } => return Ok(()),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_binaries<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &mut Metadata,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<()> {
        loop {
            match xml.next()? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    if name.local_name != "Binary" {
                        xml.skip_element()?;
                        continue;
                    }

                    let id = attr(&attributes, "ID").unwrap_or_default().to_string();
                    let text = xml.read_text()?;
                    let binary = self.parse_binary_value(&attributes, text, obfuscator)?;
                    let index = meta.add_binary(binary);
                    self.binary_ids.insert(id, index);
                }
                XmlEvent::EndElement { .. } => return Ok(()),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_custom_data<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &mut Metadata,
    ) -> Result<()> {
        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => {
                    if name.local_name != "Item" {
                        xml.skip_element()?;
                        continue;
                    }

                    let mut key = String::new();
                    let mut value = String::new();
                    loop {
                        match xml.next()? {
                            XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                                "Key" => key = xml.read_text()?,
                                "Value" => value = xml.read_text()?,
                                _ => xml.skip_element()?,
                            },
                            XmlEvent::EndElement { .. } => break,
                            XmlEvent::EndDocument => {
                                return Err(Error::Format("truncated XML in KDBX".to_string()))
                            }
                            _ => {}
                        }
                    }

                    if key.is_empty() {
                        warn!("dropping CustomData item with empty key");
                        continue;
                    }
                    meta.add_custom_data(key, value);
                }
                XmlEvent::EndElement { .. } => return Ok(()),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_meta<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<Metadata> {
        let mut meta = Metadata::default();

        let mut database_name = String::new();
        let mut database_name_changed = DateTime::UNIX_EPOCH;
        let mut database_desc = String::new();
        let mut database_desc_changed = DateTime::UNIX_EPOCH;
        let mut default_username = String::new();
        let mut default_username_changed = DateTime::UNIX_EPOCH;
        let mut recycle_bin_enabled = true;
        let mut recycle_bin_uuid = String::new();

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                    "HeaderHash" => {
                        let decoded = decode_base64(&xml.read_text()?)?;
                        if !decoded.is_empty() {
                            let hash: [u8; 32] = decoded.try_into().map_err(|_| {
                                Error::Format("malformed header hash in KDBX".to_string())
                            })?;
                            self.expected_header_hash = Some(hash);
                        }
                    }
                    "Generator" => meta.generator = xml.read_text()?,
                    "DatabaseName" => database_name = xml.read_text()?,
                    "DatabaseNameChanged" => database_name_changed = parse_date(&xml.read_text()?)?,
                    "DatabaseDescription" => database_desc = xml.read_text()?,
                    "DatabaseDescriptionChanged" => {
                        database_desc_changed = parse_date(&xml.read_text()?)?
                    }
                    "DefaultUserName" => default_username = xml.read_text()?,
                    "DefaultUserNameChanged" => {
                        default_username_changed = parse_date(&xml.read_text()?)?
                    }
                    "MaintenanceHistoryDays" => {
                        meta.maintenance_hist_days = parse_u32(&xml.read_text()?, 365)
                    }
                    "Color" => meta.database_color = xml.read_text()?,
                    "MasterKeyChanged" => meta.master_key_changed = parse_date(&xml.read_text()?)?,
                    "MasterKeyChangeRec" => {
                        meta.master_key_change_rec = xml.read_text()?.trim().parse().unwrap_or(-1)
                    }
                    "MasterKeyChangeForce" => {
                        meta.master_key_change_force = xml.read_text()?.trim().parse().unwrap_or(-1)
                    }
                    "MemoryProtection" => self.parse_memory_protection(xml, &mut meta)?,
                    "RecycleBinEnabled" => {
                        recycle_bin_enabled = parse_bool(&xml.read_text()?, true)
                    }
                    "RecycleBinUUID" => recycle_bin_uuid = xml.read_text()?,
                    "RecycleBinChanged" => {
                        meta.recycle_bin_changed = parse_date(&xml.read_text()?)?
                    }
                    "EntryTemplatesGroup" => {
                        meta.entry_templates = decode_uuid(&xml.read_text()?)?
                    }
                    "EntryTemplatesGroupChanged" => {
                        meta.entry_templates_changed = parse_date(&xml.read_text()?)?
                    }
                    "HistoryMaxItems" => {
                        meta.history_max_items = xml.read_text()?.trim().parse().unwrap_or(-1)
                    }
                    "HistoryMaxSize" => {
                        meta.history_max_size = xml.read_text()?.trim().parse().unwrap_or(-1)
                    }
                    "LastSelectedGroup" => self.last_selected_group = xml.read_text()?,
                    "LastTopVisibleGroup" => self.last_visible_group = xml.read_text()?,
                    "CustomIcons" => self.parse_custom_icons(xml, &mut meta)?,
                    "Binaries" => self.parse_binaries(xml, &mut meta, obfuscator)?,
                    "CustomData" => self.parse_custom_data(xml, &mut meta)?,
                    _ => xml.skip_element()?,
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }

        meta.database_name = Temporal::new(database_name, database_name_changed);
        meta.database_desc = Temporal::new(database_desc, database_desc_changed);
        meta.default_username = Temporal::new(default_username, default_username_changed);
        meta.recycle_bin = if recycle_bin_enabled {
            decode_uuid(&recycle_bin_uuid)?
        } else {
            None
        };

        Ok(meta)
    }

    fn parse_times<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
    ) -> Result<(
        DateTime<Utc>,
        DateTime<Utc>,
        DateTime<Utc>,
        DateTime<Utc>,
        DateTime<Utc>,
        bool,
        u32,
    )> {
        let mut creation = DateTime::UNIX_EPOCH;
        let mut modification = DateTime::UNIX_EPOCH;
        let mut access = DateTime::UNIX_EPOCH;
        let mut expiry = DateTime::UNIX_EPOCH;
        let mut moved = DateTime::UNIX_EPOCH;
        let mut expires = false;
        let mut usage_count = 0u32;

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => {
                    let text = xml.read_text()?;
                    match name.local_name.as_str() {
                        "CreationTime" => creation = parse_date(&text)?,
                        "LastModificationTime" => modification = parse_date(&text)?,
                        "LastAccessTime" => access = parse_date(&text)?,
                        "ExpiryTime" => expiry = parse_date(&text)?,
                        "LocationChanged" => moved = parse_date(&text)?,
                        "Expires" => expires = parse_bool(&text, false),
                        "UsageCount" => usage_count = parse_u32(&text, 0),
                        _ => {}
                    }
                }
                XmlEvent::EndElement { .. } => {
                    return Ok((creation, modification, access, expiry, moved, expires, usage_count))
                }
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_auto_type<R: Read>(&mut self, xml: &mut XmlReader<R>) -> Result<AutoType> {
        let mut auto_type = AutoType::default();

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                    "Enabled" => auto_type.enabled = parse_bool(&xml.read_text()?, false),
                    "DataTransferObfuscation" => {
                        auto_type.obfuscation = parse_u32(&xml.read_text()?, 0)
                    }
                    "DefaultSequence" => auto_type.sequence = xml.read_text()?,
                    "Association" => {
                        let mut window = String::new();
                        let mut sequence = String::new();
                        loop {
                            match xml.next()? {
                                XmlEvent::StartElement { name, .. } => {
                                    match name.local_name.as_str() {
                                        "Window" => window = xml.read_text()?,
                                        "KeystrokeSequence" => sequence = xml.read_text()?,
                                        _ => xml.skip_element()?,
                                    }
                                }
                                XmlEvent::EndElement { .. } => break,
                                XmlEvent::EndDocument => {
                                    return Err(Error::Format(
                                        "truncated XML in KDBX".to_string(),
                                    ))
                                }
                                _ => {}
                            }
                        }
                        auto_type.add_association(window, sequence);
                    }
                    _ => xml.skip_element()?,
                },
                XmlEvent::EndElement { .. } => return Ok(auto_type),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_entry<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &Metadata,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<Entry> {
        let mut entry = Entry::new();

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                    "UUID" => {
                        if let Some(uuid) = decode_uuid(&xml.read_text()?)? {
                            entry.uuid = uuid;
                        }
                    }
                    "IconID" => entry.icon = parse_u32(&xml.read_text()?, 0),
                    "ForegroundColor" => entry.fg_color = xml.read_text()?,
                    "BackgroundColor" => entry.bg_color = xml.read_text()?,
                    "OverrideURL" => entry.override_url = xml.read_text()?,
                    "Tags" => entry.tags = xml.read_text()?,
                    "CustomIconUUID" => {
                        if let Some(uuid) = decode_uuid(&xml.read_text()?)? {
                            if meta.icon(uuid).is_some() {
                                entry.custom_icon = Some(uuid);
                            } else {
                                warn!("entry refers to unknown custom icon {uuid}");
                            }
                        }
                    }
                    "Times" => {
                        let (creation, modification, access, expiry, moved, expires, usage) =
                            self.parse_times(xml)?;
                        entry.creation_time = creation;
                        entry.modification_time = modification;
                        entry.access_time = access;
                        entry.expiry_time = expiry;
                        entry.move_time = moved;
                        entry.expires = expires;
                        entry.usage_count = usage;
                    }
                    "AutoType" => entry.auto_type = self.parse_auto_type(xml)?,
                    "String" => {
                        let mut key = String::new();
                        let mut value = Protected::default();
                        loop {
                            match xml.next()? {
                                XmlEvent::StartElement {
                                    name, attributes, ..
                                } => match name.local_name.as_str() {
                                    "Key" => key = xml.read_text()?,
                                    "Value" => {
                                        let text = xml.read_text()?;
                                        value = self.parse_protected_value(
                                            &attributes,
                                            text,
                                            obfuscator,
                                        )?;
                                    }
                                    _ => xml.skip_element()?,
                                },
                                XmlEvent::EndElement { .. } => break,
                                XmlEvent::EndDocument => {
                                    return Err(Error::Format(
                                        "truncated XML in KDBX".to_string(),
                                    ))
                                }
                                _ => {}
                            }
                        }

                        match key.as_str() {
                            "Title" => entry.title = value,
                            "URL" => entry.url = value,
                            "UserName" => entry.username = value,
                            "Password" => entry.password = value,
                            "Notes" => entry.notes = value,
                            _ => entry.add_custom_field(key, value),
                        }
                    }
                    "Binary" => {
                        let mut key = String::new();
                        let mut binary_ref = None;
                        loop {
                            match xml.next()? {
                                XmlEvent::StartElement {
                                    name, attributes, ..
                                } => match name.local_name.as_str() {
                                    "Key" => key = xml.read_text()?,
                                    "Value" => {
                                        if let Some(reference) = attr(&attributes, "Ref") {
                                            let index = self
                                                .binary_ids
                                                .get(reference)
                                                .copied()
                                                .ok_or_else(|| {
                                                    Error::Format(
                                                        "entry attachment refers to \
                                                         non-existing binary data"
                                                            .to_string(),
                                                    )
                                                })?;
                                            binary_ref = Some(BinaryRef::Pool(index));
                                            xml.skip_element()?;
                                        } else {
                                            let text = xml.read_text()?;
                                            binary_ref =
                                                Some(BinaryRef::Inline(self.parse_binary_value(
                                                    &attributes,
                                                    text,
                                                    obfuscator,
                                                )?));
                                        }
                                    }
                                    _ => xml.skip_element()?,
                                },
                                XmlEvent::EndElement { .. } => break,
                                XmlEvent::EndDocument => {
                                    return Err(Error::Format(
                                        "truncated XML in KDBX".to_string(),
                                    ))
                                }
                                _ => {}
                            }
                        }

                        entry.add_attachment(Attachment {
                            name: key,
                            binary: binary_ref.unwrap_or(BinaryRef::Inline(Binary::default())),
                        });
                    }
                    "History" => loop {
                        match xml.next()? {
                            XmlEvent::StartElement { name, .. } => {
                                if name.local_name == "Entry" {
                                    let history_entry = self.parse_entry(xml, meta, obfuscator)?;
                                    entry.add_history_entry(history_entry);
                                } else {
                                    xml.skip_element()?;
                                }
                            }
                            XmlEvent::EndElement { .. } => break,
                            XmlEvent::EndDocument => {
                                return Err(Error::Format("truncated XML in KDBX".to_string()))
                            }
                            _ => {}
                        }
                    },
                    _ => xml.skip_element()?,
                },
                XmlEvent::EndElement { .. } => return Ok(entry),
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }
    }

    fn parse_group<R: Read>(
        &mut self,
        xml: &mut XmlReader<R>,
        meta: &Metadata,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<Group> {
        let mut group = Group::new();
        let mut last_visible_entry = None;

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => match name.local_name.as_str() {
                    "UUID" => {
                        if let Some(uuid) = decode_uuid(&xml.read_text()?)? {
                            group.uuid = uuid;
                        }
                    }
                    "Name" => group.name = xml.read_text()?,
                    "Notes" => group.notes = xml.read_text()?,
                    "IconID" => group.icon = parse_u32(&xml.read_text()?, 0),
                    "CustomIconUUID" => {
                        if let Some(uuid) = decode_uuid(&xml.read_text()?)? {
                            if meta.icon(uuid).is_some() {
                                group.custom_icon = Some(uuid);
                            } else {
                                warn!("group refers to unknown custom icon {uuid}");
                            }
                        }
                    }
                    "Times" => {
                        let (creation, modification, access, expiry, moved, expires, usage) =
                            self.parse_times(xml)?;
                        group.creation_time = creation;
                        group.modification_time = modification;
                        group.access_time = access;
                        group.expiry_time = expiry;
                        group.move_time = moved;
                        group.expires = expires;
                        group.usage_count = usage;
                    }
                    "IsExpanded" => group.expanded = parse_bool(&xml.read_text()?, false),
                    "DefaultAutoTypeSequence" => {
                        group.default_autotype_sequence = xml.read_text()?
                    }
                    "EnableAutoType" => group.autotype = parse_bool(&xml.read_text()?, false),
                    "EnableSearching" => group.search = parse_bool(&xml.read_text()?, false),
                    "LastTopVisibleEntry" => {
                        last_visible_entry = decode_uuid(&xml.read_text()?)?
                    }
                    "Entry" => {
                        let entry = self.parse_entry(xml, meta, obfuscator)?;
                        group.add_entry(entry);
                    }
                    "Group" => {
                        let child = self.parse_group(xml, meta, obfuscator)?;
                        group.add_group(child);
                    }
                    _ => xml.skip_element()?,
                },
                XmlEvent::EndElement { .. } => break,
                XmlEvent::EndDocument => {
                    return Err(Error::Format("truncated XML in KDBX".to_string()))
                }
                _ => {}
            }
        }

        // Only meaningful when it names one of this group's own entries.
        if let Some(uuid) = last_visible_entry {
            if group.entries.iter().any(|entry| entry.uuid == uuid) {
                group.last_visible_entry = Some(uuid);
            }
        }

        Ok(group)
    }

    /// Parses the whole document; returns the metadata and root group.
    fn parse_xml<R: Read>(
        &mut self,
        src: R,
        obfuscator: &mut RandomObfuscator,
    ) -> Result<(Metadata, Group)> {
        let mut xml = XmlReader::new(src);

        let mut meta = None;
        let mut root = None;

        loop {
            match xml.next()? {
                XmlEvent::StartElement { name, .. } => {
                    if name.local_name != "KeePassFile" {
                        return Err(Error::Format(
                            "no KeePassFile element in KDBX XML".to_string(),
                        ));
                    }

                    loop {
                        match xml.next()? {
                            XmlEvent::StartElement { name, .. } => {
                                match name.local_name.as_str() {
                                    "Meta" => {
                                        meta = Some(self.parse_meta(&mut xml, obfuscator)?)
                                    }
                                    "Root" => loop {
                                        match xml.next()? {
                                            XmlEvent::StartElement { name, .. } => {
                                                if name.local_name == "Group" {
                                                    let meta_ref =
                                                        meta.as_ref().ok_or_else(|| {
                                                            Error::Format(
                                                                "no Meta element in KDBX XML"
                                                                    .to_string(),
                                                            )
                                                        })?;
                                                    root = Some(self.parse_group(
                                                        &mut xml, meta_ref, obfuscator,
                                                    )?);
                                                } else {
                                                    xml.skip_element()?;
                                                }
                                            }
                                            XmlEvent::EndElement { .. } => break,
                                            XmlEvent::EndDocument => {
                                                return Err(Error::Format(
                                                    "truncated XML in KDBX".to_string(),
                                                ))
                                            }
                                            _ => {}
                                        }
                                    },
                                    _ => xml.skip_element()?,
                                }
                            }
                            XmlEvent::EndElement { .. } => break,
                            XmlEvent::EndDocument => {
                                return Err(Error::Format("truncated XML in KDBX".to_string()))
                            }
                            _ => {}
                        }
                    }
                }
                XmlEvent::EndDocument => break,
                _ => {}
            }
        }

        let mut meta =
            meta.ok_or_else(|| Error::Format("no Meta element in KDBX XML".to_string()))?;
        let root = root
            .ok_or_else(|| Error::Format("no Root or Group element in KDBX XML".to_string()))?;

        // Group references in Meta can only be resolved once the tree is
        // complete.
        meta.last_selected_group = self.resolve_group_ref(&self.last_selected_group, &root)?;
        meta.last_visible_group = self.resolve_group_ref(&self.last_visible_group, &root)?;

        Ok((meta, root))
    }

    fn resolve_group_ref(&self, text: &str, root: &Group) -> Result<Option<Uuid>> {
        match decode_uuid(text)? {
            Some(uuid) if root.find_group(uuid).is_some() => Ok(Some(uuid)),
            Some(uuid) => {
                debug!("group reference {uuid} does not name a parsed group");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Serialization half of the codec.
struct XmlWriter<W: Write> {
    inner: EventWriter<W>,
}

impl<W: Write> XmlWriter<W> {
    fn new(dst: W) -> Self {
        let config = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(true);
        Self {
            inner: EventWriter::new_with_config(dst, config),
        }
    }

    fn start(&mut self, name: &str) -> Result<()> {
        self.inner
            .write(WriterEvent::start_element(name))
            .map_err(map_writer_error)
    }

    fn start_with_attr(&mut self, name: &str, attr_name: &str, attr_value: &str) -> Result<()> {
        self.inner
            .write(WriterEvent::start_element(name).attr(attr_name, attr_value))
            .map_err(map_writer_error)
    }

    fn end(&mut self) -> Result<()> {
        self.inner
            .write(WriterEvent::end_element())
            .map_err(map_writer_error)
    }

    fn text(&mut self, text: &str) -> Result<()> {
        self.inner
            .write(WriterEvent::characters(text))
            .map_err(map_writer_error)
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name)?;
        if !text.is_empty() {
            self.text(text)?;
        }
        self.end()
    }

    fn bool_element(&mut self, name: &str, value: bool) -> Result<()> {
        self.text_element(name, format_bool(value))
    }

    fn date_element(&mut self, name: &str, time: DateTime<Utc>) -> Result<()> {
        self.text_element(name, &write_date(time))
    }

    fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

fn write_protected_string<W: Write>(
    xml: &mut XmlWriter<W>,
    value: &Protected<String>,
    obfuscator: &mut RandomObfuscator,
) -> Result<()> {
    if value.is_protected() {
        xml.start_with_attr("Value", "Protected", "True")?;
        let obfuscated = obfuscator.process_str(value.value());
        let encoded = BASE64.encode(obfuscated);
        if !encoded.is_empty() {
            xml.text(&encoded)?;
        }
        xml.end()
    } else {
        xml.text_element("Value", value.value())
    }
}

fn write_string_field<W: Write>(
    xml: &mut XmlWriter<W>,
    key: &str,
    value: &Protected<String>,
    obfuscator: &mut RandomObfuscator,
) -> Result<()> {
    xml.start("String")?;
    xml.text_element("Key", key)?;
    write_protected_string(xml, value, obfuscator)?;
    xml.end()
}

fn write_times<W: Write>(
    xml: &mut XmlWriter<W>,
    creation: DateTime<Utc>,
    modification: DateTime<Utc>,
    access: DateTime<Utc>,
    expiry: DateTime<Utc>,
    moved: DateTime<Utc>,
    expires: bool,
    usage_count: u32,
) -> Result<()> {
    xml.start("Times")?;
    xml.date_element("CreationTime", creation)?;
    xml.date_element("LastModificationTime", modification)?;
    xml.date_element("LastAccessTime", access)?;
    xml.date_element("ExpiryTime", expiry)?;
    xml.date_element("LocationChanged", moved)?;
    xml.bool_element("Expires", expires)?;
    xml.text_element("UsageCount", &usage_count.to_string())?;
    xml.end()
}

fn write_meta<W: Write>(
    xml: &mut XmlWriter<W>,
    meta: &Metadata,
    header_hash: &[u8; 32],
    obfuscator: &mut RandomObfuscator,
) -> Result<()> {
    xml.start("Meta")?;
    xml.text_element("HeaderHash", &BASE64.encode(header_hash))?;
    xml.text_element("Generator", &meta.generator)?;
    xml.text_element("DatabaseName", meta.database_name.value())?;
    xml.date_element("DatabaseNameChanged", meta.database_name.time())?;
    xml.text_element("DatabaseDescription", meta.database_desc.value())?;
    xml.date_element("DatabaseDescriptionChanged", meta.database_desc.time())?;
    xml.text_element("DefaultUserName", meta.default_username.value())?;
    xml.date_element("DefaultUserNameChanged", meta.default_username.time())?;
    xml.text_element(
        "MaintenanceHistoryDays",
        &meta.maintenance_hist_days.to_string(),
    )?;
    xml.text_element("Color", &meta.database_color)?;
    xml.date_element("MasterKeyChanged", meta.master_key_changed)?;
    xml.text_element("MasterKeyChangeRec", &meta.master_key_change_rec.to_string())?;
    xml.text_element(
        "MasterKeyChangeForce",
        &meta.master_key_change_force.to_string(),
    )?;

    xml.start("MemoryProtection")?;
    xml.bool_element("ProtectTitle", meta.memory_protection.title)?;
    xml.bool_element("ProtectUserName", meta.memory_protection.username)?;
    xml.bool_element("ProtectPassword", meta.memory_protection.password)?;
    xml.bool_element("ProtectURL", meta.memory_protection.url)?;
    xml.bool_element("ProtectNotes", meta.memory_protection.notes)?;
    xml.end()?;

    match meta.recycle_bin {
        Some(uuid) => {
            xml.bool_element("RecycleBinEnabled", true)?;
            xml.text_element("RecycleBinUUID", &encode_uuid(uuid))?;
        }
        None => xml.bool_element("RecycleBinEnabled", false)?,
    }
    xml.date_element("RecycleBinChanged", meta.recycle_bin_changed)?;

    if let Some(uuid) = meta.entry_templates {
        xml.text_element("EntryTemplatesGroup", &encode_uuid(uuid))?;
    }
    xml.date_element("EntryTemplatesGroupChanged", meta.entry_templates_changed)?;

    xml.text_element("HistoryMaxItems", &meta.history_max_items.to_string())?;
    xml.text_element("HistoryMaxSize", &meta.history_max_size.to_string())?;

    if let Some(uuid) = meta.last_selected_group {
        xml.text_element("LastSelectedGroup", &encode_uuid(uuid))?;
    }
    if let Some(uuid) = meta.last_visible_group {
        xml.text_element("LastTopVisibleGroup", &encode_uuid(uuid))?;
    }

    xml.start("CustomIcons")?;
    for icon in &meta.icons {
        xml.start("Icon")?;
        xml.text_element("UUID", &encode_uuid(icon.uuid))?;
        xml.text_element("Data", &BASE64.encode(&icon.data))?;
        xml.end()?;
    }
    xml.end()?;

    xml.start("Binaries")?;
    for (index, binary) in meta.binaries.iter().enumerate() {
        let id = index.to_string();
        if binary.data.is_protected() {
            xml.inner
                .write(
                    WriterEvent::start_element("Binary")
                        .attr("ID", &id)
                        .attr("Protected", "True"),
                )
                .map_err(map_writer_error)?;
            let obfuscated = obfuscator.process(binary.data.value());
            xml.text(&BASE64.encode(obfuscated))?;
            xml.end()?;
        } else if binary.compress {
            xml.inner
                .write(
                    WriterEvent::start_element("Binary")
                        .attr("ID", &id)
                        .attr("Compressed", "True"),
                )
                .map_err(map_writer_error)?;
            xml.text(&BASE64.encode(gzip_compress(binary.data.value())?))?;
            xml.end()?;
        } else {
            xml.start_with_attr("Binary", "ID", &id)?;
            let encoded = BASE64.encode(binary.data.value());
            if !encoded.is_empty() {
                xml.text(&encoded)?;
            }
            xml.end()?;
        }
    }
    xml.end()?;

    xml.start("CustomData")?;
    for item in &meta.custom_data {
        xml.start("Item")?;
        xml.text_element("Key", &item.key)?;
        xml.text_element("Value", &item.value)?;
        xml.end()?;
    }
    xml.end()?;

    xml.end()
}

fn write_entry<W: Write>(
    xml: &mut XmlWriter<W>,
    entry: &Entry,
    meta: &Metadata,
    obfuscator: &mut RandomObfuscator,
) -> Result<()> {
    xml.text_element("UUID", &encode_uuid(entry.uuid))?;
    xml.text_element("IconID", &entry.icon.to_string())?;
    xml.text_element("ForegroundColor", &entry.fg_color)?;
    xml.text_element("BackgroundColor", &entry.bg_color)?;
    xml.text_element("OverrideURL", &entry.override_url)?;
    xml.text_element("Tags", &entry.tags)?;

    if let Some(uuid) = entry.custom_icon {
        xml.text_element("CustomIconUUID", &encode_uuid(uuid))?;
    }

    write_times(
        xml,
        entry.creation_time,
        entry.modification_time,
        entry.access_time,
        entry.expiry_time,
        entry.move_time,
        entry.expires,
        entry.usage_count,
    )?;

    xml.start("AutoType")?;
    xml.bool_element("Enabled", entry.auto_type.enabled)?;
    xml.text_element(
        "DataTransferObfuscation",
        &entry.auto_type.obfuscation.to_string(),
    )?;
    xml.text_element("DefaultSequence", &entry.auto_type.sequence)?;
    for association in &entry.auto_type.associations {
        xml.start("Association")?;
        xml.text_element("Window", &association.window)?;
        xml.text_element("KeystrokeSequence", &association.sequence)?;
        xml.end()?;
    }
    xml.end()?;

    write_string_field(xml, "Title", &entry.title, obfuscator)?;
    write_string_field(xml, "URL", &entry.url, obfuscator)?;
    write_string_field(xml, "UserName", &entry.username, obfuscator)?;
    write_string_field(xml, "Password", &entry.password, obfuscator)?;
    write_string_field(xml, "Notes", &entry.notes, obfuscator)?;
    for field in &entry.custom_fields {
        write_string_field(xml, &field.key, &field.value, obfuscator)?;
    }

    for attachment in &entry.attachments {
        xml.start("Binary")?;
        xml.text_element("Key", &attachment.name)?;
        match &attachment.binary {
            BinaryRef::Pool(index) => {
                xml.start_with_attr("Value", "Ref", &index.to_string())?;
                xml.end()?;
            }
            BinaryRef::Inline(binary) => {
                let encoded = BASE64.encode(binary.data.value());
                xml.text_element("Value", &encoded)?;
            }
        }
        xml.end()?;
    }

    xml.start("History")?;
    for history_entry in &entry.history {
        xml.start("Entry")?;
        write_entry(xml, history_entry, meta, obfuscator)?;
        xml.end()?;
    }
    xml.end()
}

fn write_group<W: Write>(
    xml: &mut XmlWriter<W>,
    group: &Group,
    meta: &Metadata,
    obfuscator: &mut RandomObfuscator,
) -> Result<()> {
    xml.text_element("UUID", &encode_uuid(group.uuid))?;
    xml.text_element("Name", &group.name)?;
    xml.text_element("Notes", &group.notes)?;
    xml.text_element("IconID", &group.icon.to_string())?;

    if let Some(uuid) = group.custom_icon {
        xml.text_element("CustomIconUUID", &encode_uuid(uuid))?;
    }

    write_times(
        xml,
        group.creation_time,
        group.modification_time,
        group.access_time,
        group.expiry_time,
        group.move_time,
        group.expires,
        group.usage_count,
    )?;

    xml.bool_element("IsExpanded", group.expanded)?;
    xml.text_element("DefaultAutoTypeSequence", &group.default_autotype_sequence)?;
    xml.bool_element("EnableAutoType", group.autotype)?;
    xml.bool_element("EnableSearching", group.search)?;

    if let Some(uuid) = group.last_visible_entry {
        xml.text_element("LastTopVisibleEntry", &encode_uuid(uuid))?;
    }

    for entry in &group.entries {
        xml.start("Entry")?;
        write_entry(xml, entry, meta, obfuscator)?;
        xml.end()?;
    }

    for child in &group.groups {
        xml.start("Group")?;
        write_group(xml, child, meta, obfuscator)?;
        xml.end()?;
    }

    Ok(())
}

fn write_xml<W: Write>(
    dst: W,
    db: &Database,
    meta: &Metadata,
    header_hash: &[u8; 32],
    obfuscator: &mut RandomObfuscator,
) -> Result<W> {
    let mut xml = XmlWriter::new(dst);
    xml.start("KeePassFile")?;
    write_meta(&mut xml, meta, header_hash, obfuscator)?;
    xml.start("Root")?;
    xml.start("Group")?;
    write_group(&mut xml, &db.root, meta, obfuscator)?;
    xml.end()?;
    xml.end()?;
    xml.end()?;
    Ok(xml.into_inner())
}

fn derive_final_key(db: &Database, key: &Key) -> zeroize::Zeroizing<[u8; 32]> {
    let transformed = key.transform(
        &db.transform_seed,
        db.transform_rounds,
        SubKeyResolution::HashSubKeys,
    );

    let mut hasher = Sha256::new();
    hasher.update(&db.master_seed);
    hasher.update(transformed.as_ref());
    zeroize::Zeroizing::new(hasher.finalize().into())
}

fn make_obfuscator(inner_random_stream_key: &[u8; 32]) -> RandomObfuscator {
    let final_key: [u8; 32] = Sha256::digest(inner_random_stream_key).into();
    RandomObfuscator::new(&final_key, &INNER_RANDOM_STREAM_IV)
}

/// Imports a KDBX version 3 database.
pub fn import(path: &Path, key: &Key) -> Result<Database> {
    let data = fs::read(path)?;

    if data.len() < 12 {
        return Err(Error::Format("not a KDBX database".to_string()));
    }

    let u32_at = |off: usize| {
        u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
    };

    if u32_at(0) != KDBX_SIGNATURE_0 || u32_at(4) != KDBX_SIGNATURE_1 {
        return Err(Error::Format("not a KDBX database".to_string()));
    }

    let version = u32_at(8);
    if (version & KDBX_VERSION_CRITICAL_MASK) > (KDBX_VERSION & KDBX_VERSION_CRITICAL_MASK) {
        return Err(Error::Format(format!(
            "KDBX version {version:#x} is not supported"
        )));
    }

    let mut db = Database::new();
    db.cipher = CipherAlgorithm::Aes;
    db.compress = false;
    let mut content_start_bytes = [0u8; 32];

    let mut pos = 12usize;
    loop {
        if pos + 3 > data.len() {
            return Err(Error::Io("read error".to_string()));
        }
        let field_id = data[pos];
        let field_size = u16::from_le_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + field_size > data.len() {
            return Err(Error::Io("read error".to_string()));
        }
        let field = &data[pos..pos + field_size];
        pos += field_size;

        match field_id {
            FIELD_END_OF_HEADER => break,
            FIELD_CIPHER_ID => {
                if field != KDBX_CIPHER_AES {
                    return Err(Error::Format("unknown cipher in KDBX".to_string()));
                }
                db.cipher = CipherAlgorithm::Aes;
            }
            FIELD_COMPRESSION_FLAGS => {
                let flags = u32::from_le_bytes(
                    field
                        .try_into()
                        .map_err(|_| Error::Format("illegal compression field".to_string()))?,
                );
                match flags {
                    COMPRESSION_NONE => db.compress = false,
                    COMPRESSION_GZIP => db.compress = true,
                    _ => {
                        return Err(Error::Format(
                            "unknown compression method in KDBX".to_string(),
                        ))
                    }
                }
            }
            FIELD_MASTER_SEED => db.master_seed = field.to_vec(),
            FIELD_TRANSFORM_SEED => {
                db.transform_seed = field.try_into().map_err(|_| {
                    Error::Format("illegal transform seed size in KDBX".to_string())
                })?
            }
            FIELD_TRANSFORM_ROUNDS => {
                db.transform_rounds = u64::from_le_bytes(field.try_into().map_err(|_| {
                    Error::Format("illegal transform rounds size in KDBX".to_string())
                })?)
            }
            FIELD_ENCRYPTION_IV => {
                db.init_vector = field.try_into().map_err(|_| {
                    Error::Format("illegal initialization vector size in KDBX".to_string())
                })?
            }
            FIELD_INNER_RANDOM_STREAM_KEY => {
                db.inner_random_stream_key = field.try_into().map_err(|_| {
                    Error::Format("illegal protected stream key size in KDBX".to_string())
                })?
            }
            FIELD_CONTENT_STREAM_START_BYTES => {
                content_start_bytes = field.try_into().map_err(|_| {
                    Error::Format("illegal stream start sequence size in KDBX".to_string())
                })?
            }
            FIELD_INNER_RANDOM_STREAM_ID => {
                let id = u32::from_le_bytes(field.try_into().map_err(|_| {
                    Error::Format("illegal random stream field in KDBX".to_string())
                })?);
                if id != RANDOM_STREAM_SALSA20 {
                    return Err(Error::Format("unknown random stream in KDBX".to_string()));
                }
            }
            _ => return Err(Error::Format("illegal header field in KDBX".to_string())),
        }
    }

    let header_hash: [u8; 32] = Sha256::digest(&data[..pos]).into();
    debug!("KDBX header parsed, {} header bytes", pos);

    let final_key = derive_final_key(&db, key);
    let cipher = AesCipher::new(&final_key);

    let mut content = Vec::new();
    decrypt_cbc(
        &mut Cursor::new(&data[pos..]),
        &mut content,
        &cipher,
        &db.init_vector,
    )
    .map_err(|_| Error::Password)?;

    if content.len() < 32 || content[..32] != content_start_bytes {
        return Err(Error::Password);
    }
    debug!("KDBX payload decrypted ({} bytes)", content.len());

    let mut obfuscator = make_obfuscator(&db.inner_random_stream_key);
    let mut codec = KdbxCodec::default();

    let hashed = HashedBlockReader::new(Cursor::new(&content[32..]));
    let (meta, root) = if db.compress {
        codec.parse_xml(GzDecoder::new(hashed), &mut obfuscator)?
    } else {
        codec.parse_xml(hashed, &mut obfuscator)?
    };

    if codec.expected_header_hash.unwrap_or_default() != header_hash {
        return Err(Error::Format("header checksum error in KDBX".to_string()));
    }

    db.meta = Some(meta);
    db.root = root;
    Ok(db)
}

fn put_header_field(out: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(Error::Internal(
            "header field exceeds KDBX maximum".to_string(),
        ));
    }
    out.push(id);
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Exports `db` as a KDBX version 3 database.
///
/// The header is assembled first so its hash can be embedded into
/// `Meta/HeaderHash` before the encrypted payload is produced.
pub fn export(path: &Path, db: &Database, key: &Key) -> Result<()> {
    if db.cipher != CipherAlgorithm::Aes {
        return Err(Error::Format(
            "KDBX export supports only the AES cipher".to_string(),
        ));
    }

    let default_meta;
    let meta = match &db.meta {
        Some(meta) => meta,
        None => {
            default_meta = Metadata::default();
            &default_meta
        }
    };

    let final_key = derive_final_key(db, key);
    let cipher = AesCipher::new(&final_key);

    let content_start_bytes = random_array::<32>();

    let mut header = Vec::new();
    header.extend_from_slice(&KDBX_SIGNATURE_0.to_le_bytes());
    header.extend_from_slice(&KDBX_SIGNATURE_1.to_le_bytes());
    header.extend_from_slice(&KDBX_VERSION.to_le_bytes());
    put_header_field(&mut header, FIELD_CIPHER_ID, &KDBX_CIPHER_AES)?;
    let compression = if db.compress {
        COMPRESSION_GZIP
    } else {
        COMPRESSION_NONE
    };
    put_header_field(
        &mut header,
        FIELD_COMPRESSION_FLAGS,
        &compression.to_le_bytes(),
    )?;
    put_header_field(&mut header, FIELD_MASTER_SEED, &db.master_seed)?;
    put_header_field(&mut header, FIELD_TRANSFORM_SEED, &db.transform_seed)?;
    put_header_field(
        &mut header,
        FIELD_TRANSFORM_ROUNDS,
        &db.transform_rounds.to_le_bytes(),
    )?;
    put_header_field(&mut header, FIELD_ENCRYPTION_IV, &db.init_vector)?;
    put_header_field(
        &mut header,
        FIELD_INNER_RANDOM_STREAM_KEY,
        &db.inner_random_stream_key,
    )?;
    put_header_field(
        &mut header,
        FIELD_CONTENT_STREAM_START_BYTES,
        &content_start_bytes,
    )?;
    put_header_field(
        &mut header,
        FIELD_INNER_RANDOM_STREAM_ID,
        &RANDOM_STREAM_SALSA20.to_le_bytes(),
    )?;
    put_header_field(&mut header, FIELD_END_OF_HEADER, &[])?;

    let header_hash: [u8; 32] = Sha256::digest(&header).into();

    let mut dst = BufWriter::new(File::create(path).map_err(|e| Error::Io(e.to_string()))?);
    dst.write_all(&header)?;

    let mut obfuscator = make_obfuscator(&db.inner_random_stream_key);

    let mut content = Vec::new();
    content.extend_from_slice(&content_start_bytes);

    let hashed = HashedBlockWriter::new(content);
    let content = if db.compress {
        let gz = GzEncoder::new(hashed, Compression::default());
        let gz = write_xml(gz, db, meta, &header_hash, &mut obfuscator)?;
        gz.finish()?.finish()?
    } else {
        let hashed = write_xml(hashed, db, meta, &header_hash, &mut obfuscator)?;
        hashed.finish()?
    };

    encrypt_cbc(
        &mut Cursor::new(content),
        &mut dst,
        &cipher,
        &db.init_vector,
    )?;
    dst.flush()?;
    Ok(())
}
