// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Annotation types attached to processes and modules.

use std::borrow::Cow;

use minidump_common::format::MINIDUMP_ANNOTATION;
use tracing::warn;

/// The declared type of a typed annotation object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationType {
    /// An invalid annotation. Reserved for internal use.
    Invalid,
    /// A string, stored as raw bytes without a terminator.
    String,
    /// Clients may declare their own custom types.
    UserDefined(u16),
    /// An unsupported annotation type from a future client version.
    Unsupported(u16),
}

impl AnnotationType {
    pub fn from_raw(ty: u16) -> AnnotationType {
        match ty {
            MINIDUMP_ANNOTATION::TYPE_INVALID => AnnotationType::Invalid,
            MINIDUMP_ANNOTATION::TYPE_STRING => AnnotationType::String,
            _ if ty >= MINIDUMP_ANNOTATION::TYPE_USER_DEFINED => AnnotationType::UserDefined(ty),
            _ => AnnotationType::Unsupported(ty),
        }
    }

    pub fn raw(&self) -> u16 {
        match *self {
            AnnotationType::Invalid => MINIDUMP_ANNOTATION::TYPE_INVALID,
            AnnotationType::String => MINIDUMP_ANNOTATION::TYPE_STRING,
            AnnotationType::UserDefined(ty) | AnnotationType::Unsupported(ty) => ty,
        }
    }
}

/// A typed annotation object as captured from a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationSnapshot {
    pub name: String,
    /// The raw type tag, see [`AnnotationType::from_raw`].
    pub ty: u16,
    pub value: Vec<u8>,
}

impl AnnotationSnapshot {
    pub fn new(name: &str, ty: AnnotationType, value: impl Into<Vec<u8>>) -> AnnotationSnapshot {
        AnnotationSnapshot {
            name: name.to_owned(),
            ty: ty.raw(),
            value: value.into(),
        }
    }

    /// A string annotation.
    pub fn string(name: &str, value: &str) -> AnnotationSnapshot {
        AnnotationSnapshot::new(name, AnnotationType::String, value.as_bytes())
    }

    pub fn annotation_type(&self) -> AnnotationType {
        AnnotationType::from_raw(self.ty)
    }

    /// The value decoded as text, if this is a string annotation.
    ///
    /// Invalid UTF-8 sequences are replaced rather than rejected.
    pub fn string_value(&self) -> Option<Cow<'_, str>> {
        match self.annotation_type() {
            AnnotationType::String => Some(String::from_utf8_lossy(&self.value)),
            _ => None,
        }
    }
}

/// An insertion-ordered dictionary of string annotations with unique keys.
///
/// This mirrors the fixed-size dictionary a client process exposes: at most
/// [`MAX_ENTRIES`][Self::MAX_ENTRIES] entries, and keys and values longer than
/// [`MAX_KEY_LEN`][Self::MAX_KEY_LEN] / [`MAX_VALUE_LEN`][Self::MAX_VALUE_LEN] bytes are truncated.
/// Replacing the value of an existing key keeps its position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimpleStringDictionary {
    entries: Vec<(String, String)>,
}

impl SimpleStringDictionary {
    pub const MAX_ENTRIES: usize = 64;
    pub const MAX_KEY_LEN: usize = 255;
    pub const MAX_VALUE_LEN: usize = 255;

    pub fn new() -> SimpleStringDictionary {
        Default::default()
    }

    /// Set `key` to `value`, replacing any existing value in place.
    ///
    /// If the dictionary is full and `key` is new, the entry is dropped with a warning.
    pub fn set_key_value(&mut self, key: &str, value: &str) {
        let key = truncate(key, Self::MAX_KEY_LEN);
        let value = truncate(value, Self::MAX_VALUE_LEN);
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_owned();
            return;
        }
        if self.entries.len() >= Self::MAX_ENTRIES {
            warn!("annotation dictionary full, dropping key {}", key);
            return;
        }
        self.entries.push((key.to_owned(), value.to_owned()));
    }

    pub fn get_value_for_key(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for SimpleStringDictionary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dictionary = SimpleStringDictionary::new();
        for (key, value) in iter {
            dictionary.set_key_value(key.as_ref(), value.as_ref());
        }
        dictionary
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
