//! Wrapper types for sensitive and change-tracked values

use chrono::{DateTime, Utc};
use zeroize::Zeroize;

/// A value together with its on-wire protection flag.
///
/// Protected values travel through the inner random stream when serialized
/// to KDBX. The contained value is zeroed when the wrapper is dropped.
pub struct Protected<T: Zeroize> {
    value: T,
    protected: bool,
}

impl<T: Zeroize> Protected<T> {
    pub fn new(value: T, protected: bool) -> Self {
        Self { value, protected }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn set_value(&mut self, value: T) {
        self.value.zeroize();
        self.value = value;
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn set_protected(&mut self, protected: bool) {
        self.protected = protected;
    }
}

impl<T: Zeroize> Drop for Protected<T> {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Protected<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            protected: self.protected,
        }
    }
}

impl<T: Zeroize + Default> Default for Protected<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            protected: false,
        }
    }
}

// The protection flag is part of the identity: two fields holding the same
// text but different wire representations are not equal.
impl<T: Zeroize + PartialEq> PartialEq for Protected<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.protected == other.protected
    }
}

impl<T: Zeroize + Eq> Eq for Protected<T> {}

impl<T: Zeroize> std::fmt::Debug for Protected<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.protected {
            write!(f, "Protected(***)")
        } else {
            write!(f, "Protected(..)")
        }
    }
}

impl From<&str> for Protected<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_string(), false)
    }
}

/// A value together with the time it last changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Temporal<T> {
    value: T,
    time: DateTime<Utc>,
}

impl<T> Temporal<T> {
    pub fn new(value: T, time: DateTime<Utc>) -> Self {
        Self { value, time }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

impl<T: Default> Default for Temporal<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            time: DateTime::UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_flag_is_part_of_equality() {
        let plain = Protected::new("secret".to_string(), false);
        let wired = Protected::new("secret".to_string(), true);
        assert_ne!(plain, wired);
        assert_eq!(plain, Protected::new("secret".to_string(), false));
    }

    #[test]
    fn debug_does_not_leak_protected_value() {
        let p = Protected::new("hunter2".to_string(), true);
        let rendered = format!("{:?}", p);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn temporal_defaults_to_epoch() {
        let t: Temporal<String> = Temporal::default();
        assert_eq!(t.time().timestamp(), 0);
        assert!(t.value().is_empty());
    }
}
