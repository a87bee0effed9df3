//! Composite credential handling and key derivation.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use zeroize::Zeroizing;

use crate::cipher::{encrypt_ecb, AesCipher};
use crate::error::{Error, Result};

/// How the present sub-keys are combined into the pre-transform key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKeyResolution {
    /// Hash the concatenation of all present sub-keys (KDBX).
    HashSubKeys,
    /// Hash only when both sub-keys are present; otherwise use the present
    /// one directly (KDB).
    HashSubKeysOnlyIfCompositeKey,
}

/// A composite credential built from an optional password and an optional
/// key file.
#[derive(Default)]
pub struct Key {
    password_key: Option<Zeroizing<[u8; 32]>>,
    keyfile_key: Option<Zeroizing<[u8; 32]>>,
}

impl Key {
    pub fn new(password: &str) -> Self {
        let mut key = Self::default();
        key.set_password(password);
        key
    }

    pub fn set_password(&mut self, password: &str) {
        let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        self.password_key = Some(Zeroizing::new(digest));
    }

    /// Loads the key-file sub-key from `path`.
    ///
    /// An XML document with `KeyFile/Key/Data` carrying base64 of exactly 32
    /// bytes is tried first; anything that is not well-formed XML is retried
    /// as 64 hex characters.
    pub fn set_keyfile(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;

        if let Some(sub_key) = parse_xml_keyfile(&data)? {
            self.keyfile_key = Some(Zeroizing::new(sub_key));
            return Ok(());
        }

        self.keyfile_key = Some(Zeroizing::new(parse_hex_keyfile(&data)?));
        Ok(())
    }

    fn resolve(&self, resolution: SubKeyResolution) -> Zeroizing<[u8; 32]> {
        let hash_present = || {
            let mut hasher = Sha256::new();
            if let Some(password) = &self.password_key {
                hasher.update(password.as_ref());
            }
            if let Some(keyfile) = &self.keyfile_key {
                hasher.update(keyfile.as_ref());
            }
            Zeroizing::new(hasher.finalize().into())
        };

        match resolution {
            SubKeyResolution::HashSubKeys => hash_present(),
            SubKeyResolution::HashSubKeysOnlyIfCompositeKey => {
                match (&self.password_key, &self.keyfile_key) {
                    (Some(_), Some(_)) => hash_present(),
                    (Some(password), None) => password.clone(),
                    (None, Some(keyfile)) => keyfile.clone(),
                    (None, None) => Zeroizing::new([0u8; 32]),
                }
            }
        }
    }

    /// Derives the 32-byte key handed to the payload cipher.
    ///
    /// The resolved key is AES-ECB-encrypted under `seed` for `rounds`
    /// rounds (both halves through the same cipher instance, no allocation
    /// in the loop) and hashed once at the end. Pure function of its
    /// arguments; the `Key` itself is never modified.
    pub fn transform(
        &self,
        seed: &[u8; 32],
        rounds: u64,
        resolution: SubKeyResolution,
    ) -> Zeroizing<[u8; 32]> {
        let cipher = AesCipher::new(seed);

        let mut key = self.resolve(resolution);
        for _ in 0..rounds {
            encrypt_ecb(&mut key, &cipher);
        }

        Zeroizing::new(Sha256::digest(key.as_ref()).into())
    }
}

/// Returns `Ok(None)` when `data` is not well-formed XML. A well-formed
/// document that is not a valid key file is a format error.
fn parse_xml_keyfile(data: &[u8]) -> Result<Option<[u8; 32]>> {
    let config = ParserConfig::new()
        .trim_whitespace(true)
        .cdata_to_characters(true)
        .ignore_comments(true);
    let mut reader = EventReader::new_with_config(data, config);

    let mut path: Vec<String> = Vec::new();
    let mut key_data = String::new();

    loop {
        match reader.next() {
            Ok(XmlEvent::StartElement { name, .. }) => path.push(name.local_name),
            Ok(XmlEvent::EndElement { .. }) => {
                path.pop();
            }
            Ok(XmlEvent::Characters(text)) => {
                if path == ["KeyFile", "Key", "Data"] {
                    key_data.push_str(&text);
                }
            }
            Ok(XmlEvent::EndDocument) => break,
            Ok(_) => {}
            // Not an XML key file; the caller falls back to hex.
            Err(_) => return Ok(None),
        }
    }

    let decoded = BASE64
        .decode(key_data.trim())
        .map_err(|_| Error::Format("invalid key data in key file".to_string()))?;
    let sub_key: [u8; 32] = decoded
        .try_into()
        .map_err(|_| Error::Format("invalid key size in key file".to_string()))?;

    Ok(Some(sub_key))
}

fn parse_hex_keyfile(data: &[u8]) -> Result<[u8; 32]> {
    if data.len() != 64 {
        return Err(Error::Format("unknown key file format".to_string()));
    }

    let mut sub_key = [0u8; 32];
    for (i, byte) in sub_key.iter_mut().enumerate() {
        let pair = std::str::from_utf8(&data[2 * i..2 * i + 2])
            .map_err(|_| Error::Format("unknown key file format".to_string()))?;
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| Error::Format("unknown key file format".to_string()))?;
    }

    Ok(sub_key)
}
