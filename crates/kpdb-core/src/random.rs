//! Entropy draws for identifiers and cryptographic seeds

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

/// Generates a fresh random UUID from the OS entropy source.
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Fills a fixed-size array with OS-provided random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Returns `len` OS-provided random bytes.
pub fn random_vec(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn consecutive_uuids_are_distinct() {
        let uuids: HashSet<Uuid> = (0..100).map(|_| generate_uuid()).collect();
        assert_eq!(uuids.len(), 100);
    }

    #[test]
    fn random_arrays_differ() {
        let a = random_array::<32>();
        let b = random_array::<32>();
        assert_ne!(a, b);
    }
}
