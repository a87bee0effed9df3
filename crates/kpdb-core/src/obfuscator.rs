//! Salsa20 keystream obfuscation for protected values.
//!
//! Reader and writer must consume the keystream in the same order: protected
//! fields are processed in document order, each consuming exactly as many
//! keystream bytes as the field is long.

use crate::cipher::Salsa20Cipher;

pub struct RandomObfuscator {
    cipher: Salsa20Cipher,
    buffer: [u8; 64],
    buffer_pos: usize,
}

impl RandomObfuscator {
    pub fn new(key: &[u8; 32], init_vec: &[u8; 8]) -> Self {
        Self {
            cipher: Salsa20Cipher::new(key, init_vec),
            buffer: [0u8; 64],
            buffer_pos: 64,
        }
    }

    fn fill_buffer(&mut self) {
        const ZERO_BLOCK: [u8; 64] = [0u8; 64];
        self.buffer = self.cipher.process(&ZERO_BLOCK);
        self.buffer_pos = 0;
    }

    /// XORs the next `data.len()` keystream bytes into `data`.
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut obfuscated = Vec::with_capacity(data.len());
        for &byte in data {
            if self.buffer_pos == self.buffer.len() {
                self.fill_buffer();
            }
            obfuscated.push(byte ^ self.buffer[self.buffer_pos]);
            self.buffer_pos += 1;
        }
        obfuscated
    }

    /// Convenience for UTF-8 string fields; the result is raw bytes.
    pub fn process_str(&mut self, data: &str) -> Vec<u8> {
        self.process(data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{random_array, random_vec};

    #[test]
    fn obfuscation_is_symmetric() {
        let key = random_array::<32>();
        let iv = random_array::<8>();

        let mut writer = RandomObfuscator::new(&key, &iv);
        let mut reader = RandomObfuscator::new(&key, &iv);

        let data = random_vec(200);
        let obfuscated = writer.process(&data);
        assert_ne!(obfuscated, data);
        assert_eq!(reader.process(&obfuscated), data);
    }

    #[test]
    fn chunked_consumption_matches_whole() {
        let key = random_array::<32>();
        let iv = random_array::<8>();

        let data = random_vec(150);

        let mut whole = RandomObfuscator::new(&key, &iv);
        let expected = whole.process(&data);

        // Splitting the same bytes across several fields must consume the
        // keystream identically.
        let mut chunked = RandomObfuscator::new(&key, &iv);
        let mut actual = Vec::new();
        actual.extend(chunked.process(&data[..7]));
        actual.extend(chunked.process(&data[7..70]));
        actual.extend(chunked.process(&data[70..]));

        assert_eq!(actual, expected);
    }

    #[test]
    fn empty_fields_consume_no_keystream() {
        let key = random_array::<32>();
        let iv = random_array::<8>();

        let data = random_vec(80);

        let mut a = RandomObfuscator::new(&key, &iv);
        let expected = a.process(&data);

        let mut b = RandomObfuscator::new(&key, &iv);
        assert!(b.process(&[]).is_empty());
        assert_eq!(b.process(&data), expected);
    }
}
