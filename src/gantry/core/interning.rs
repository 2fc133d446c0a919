use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::RwLock;

use lazy_static::lazy_static;
use serde::{Serialize, Serializer};

lazy_static! {
    static ref STRING_CACHE: RwLock<HashSet<&'static str>> = RwLock::new(HashSet::new());
}

/// A cheap-to-copy interned string, used for module names, library names
/// and build-context names, all of which are compared and hashed far more
/// often than they are created.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternedString {
    inner: &'static str,
}

impl InternedString {
    pub fn new(s: &str) -> InternedString {
        {
            let cache = STRING_CACHE.read().unwrap();
            if let Some(&interned) = cache.get(s) {
                return InternedString { inner: interned };
            }
        }
        let mut cache = STRING_CACHE.write().unwrap();
        if let Some(&interned) = cache.get(s) {
            return InternedString { inner: interned };
        }
        let leaked: &'static str = Box::leak(s.to_string().into_boxed_str());
        cache.insert(leaked);
        InternedString { inner: leaked }
    }

    pub fn as_str(&self) -> &'static str {
        self.inner
    }
}

impl Deref for InternedString {
    type Target = str;

    fn deref(&self) -> &str {
        self.inner
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner, f)
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner, f)
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &InternedString) -> Ordering {
        self.inner.cmp(other.inner)
    }
}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &InternedString) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<str> for InternedString {
    fn eq(&self, other: &str) -> bool {
        self.inner == other
    }
}

impl From<&str> for InternedString {
    fn from(s: &str) -> InternedString {
        InternedString::new(s)
    }
}

impl Serialize for InternedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_intern_to_the_same_pointer() {
        let a = InternedString::new("ocamlfind");
        let b = InternedString::new("ocamlfind");
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
    }

    #[test]
    fn ordering_is_string_ordering() {
        assert!(InternedString::new("a") < InternedString::new("b"));
    }
}
