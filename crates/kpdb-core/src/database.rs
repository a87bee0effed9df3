//! The in-memory database root object.

use crate::group::Group;
use crate::metadata::Metadata;
use crate::random::{random_array, random_vec};

/// The payload block cipher recorded on a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes,
    Twofish,
}

/// A decrypted KeePass database: the group tree plus the cryptographic
/// parameters needed to serialize it again.
#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    pub root: Group,
    pub cipher: CipherAlgorithm,
    /// 16 bytes in KDB files, typically 32 in KDBX.
    pub master_seed: Vec<u8>,
    pub init_vector: [u8; 16],
    pub transform_seed: [u8; 32],
    /// KDBX only; seeds the Salsa20 obfuscation stream.
    pub inner_random_stream_key: [u8; 32],
    pub transform_rounds: u64,
    pub compress: bool,
    /// Present on KDBX databases.
    pub meta: Option<Metadata>,
}

impl Database {
    /// Creates an empty database with fresh random cryptographic material.
    pub fn new() -> Self {
        Self {
            root: Group::new(),
            cipher: CipherAlgorithm::Aes,
            master_seed: random_vec(32),
            init_vector: random_array::<16>(),
            transform_seed: random_array::<32>(),
            inner_random_stream_key: random_array::<32>(),
            transform_rounds: 8192,
            compress: false,
            meta: None,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_database_has_fresh_material() {
        let a = Database::new();
        let b = Database::new();
        assert_ne!(a.master_seed, b.master_seed);
        assert_ne!(a.transform_seed, b.transform_seed);
        assert_eq!(a.transform_rounds, 8192);
        assert!(a.meta.is_none());
    }
}
