use indexmap::IndexMap;
use std::fmt;

/// An ordered, case-insensitive header map.
///
/// Keys fold to a canonical (lowercase) form on insert. A duplicate insert
/// keeps the *first* key's position in iteration order but replaces the
/// value and the original-case spelling used when the header is re-emitted
/// on the wire -- i.e. "last write wins" for the value, "first write wins"
/// for position.
#[derive(Clone, Default)]
pub struct Headers {
    entries: IndexMap<String, Entry>,
}

#[derive(Clone, Debug)]
struct Entry {
    /// The case the header was most recently set with; used for emission.
    original_key: String,
    value: String,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    fn canonical(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    /// Inserts or overwrites a header. Case-insensitive on the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let canonical = Self::canonical(&key);
        self.entries.insert(
            canonical,
            Entry {
                original_key: key,
                value: value.into(),
            },
        );
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&Self::canonical(key)).map(|e| e.value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::canonical(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(&Self::canonical(key)).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers in insertion order, yielding the original-case key
    /// (as most recently set) and its value -- the shape a transport should
    /// use to emit headers on the wire.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|e| (e.original_key.as_str(), e.value.as_str()))
    }

    /// A by-value snapshot usable where a handler needs its own copy.
    pub fn to_owned_map(&self) -> IndexMap<String, String> {
        self.entries
            .iter()
            .map(|(_, e)| (e.original_key.clone(), e.value.clone()))
            .collect()
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn duplicate_insert_keeps_first_position_latest_value_and_case() {
        let mut h = Headers::new();
        h.insert("X-Foo", "1");
        h.insert("x-bar", "2");
        h.insert("X-FOO", "3");

        let emitted: Vec<_> = h.iter().collect();
        assert_eq!(emitted, vec![("X-FOO", "3"), ("x-bar", "2")]);
    }

    #[test]
    fn owned_map_is_independent_copy() {
        let mut h = Headers::new();
        h.insert("a", "1");
        let copy = h.to_owned_map();
        h.insert("a", "2");
        assert_eq!(copy.get("a").map(String::as_str), Some("1"));
    }
}
