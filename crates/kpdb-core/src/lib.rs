//! kpdb-core - KeePass database format library
//!
//! This crate reads and writes KeePass password databases in the legacy KDB
//! (1.x, version 3) and modern KDBX (2.x, version 3) on-disk formats. An
//! encrypted file is deserialized into a [`Database`] tree of groups and
//! entries; the same tree serializes back to a file that re-imports to an
//! equal tree under the same credentials.

mod binary;
mod database;
mod entry;
mod error;
mod group;
mod json;
mod metadata;
mod security;

pub mod cipher;
pub mod kdb;
pub mod kdbx;
pub mod key;
pub mod obfuscator;
pub mod random;
pub mod stream;

use std::fs::File;
use std::io::Read;
use std::path::Path;

pub use binary::Binary;
pub use database::{CipherAlgorithm, Database};
pub use entry::{Association, Attachment, AutoType, BinaryRef, CustomField, Entry};
pub use error::{Error, Result};
pub use group::Group;
pub use json::{database_to_json, entry_to_json, group_to_json};
pub use key::{Key, SubKeyResolution};
pub use metadata::{CustomDataItem, Icon, MemoryProtection, Metadata};
pub use security::{Protected, Temporal};

// Re-export the identifier type used throughout the model.
pub use uuid::Uuid;

/// Imports a database, identifying KDB or KDBX by the file signature.
pub fn import(path: &Path, key: &Key) -> Result<Database> {
    let mut signature = [0u8; 8];
    File::open(path)?
        .read_exact(&mut signature)
        .map_err(|_| Error::Format("not a KeePass database".to_string()))?;

    let signature1 = u32::from_le_bytes([signature[4], signature[5], signature[6], signature[7]]);
    match signature1 {
        kdb::KDB_SIGNATURE_1 => kdb::import(path, key),
        kdbx::KDBX_SIGNATURE_1 => kdbx::import(path, key),
        _ => Err(Error::Format("not a KeePass database".to_string())),
    }
}
