//! Ordered multi-map of string pairs.
//!
//! This is the in-memory shape of every ABI header/trailer/metadata map.
//! Entry order is preserved because the wire encoding is order-sensitive and
//! guests legitimately send repeated keys (`set-cookie`, gRPC metadata).
//! Lookup is exact-match on the key; normalizing case is the adaptor's
//! business, not this type's.

use std::fmt;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProxyMap {
    entries: Vec<(String, String)>,
}

impl ProxyMap {
    pub fn new() -> ProxyMap {
        ProxyMap {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> ProxyMap {
        ProxyMap {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Builds a map from alternating key/value pairs, mostly for tests and
    /// fixtures: `ProxyMap::of(&[(":method", "GET"), (":path", "/")])`.
    pub fn of(pairs: &[(&str, &str)]) -> ProxyMap {
        let mut map = ProxyMap::with_capacity(pairs.len());
        for (key, value) in pairs {
            map.add(key, value);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry, keeping any existing entries for the same key.
    pub fn add(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// Replaces every entry for `key` with a single entry appended at the end.
    pub fn put(&mut self, key: &str, value: &str) {
        self.remove(key);
        self.entries.push((key.to_string(), value.to_string()));
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Removes every entry for `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All keys in entry order, cloned; used where the map is mutated while
    /// iterating (pseudo-header stripping).
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for ProxyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl FromIterator<(String, String)> for ProxyMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> ProxyMap {
        ProxyMap {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ProxyMap {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_duplicates_put_replaces() {
        let mut map = ProxyMap::new();
        map.add("set-cookie", "a=1");
        map.add("set-cookie", "b=2");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("set-cookie"), Some("a=1"));

        map.put("set-cookie", "c=3");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("set-cookie"), Some("c=3"));
    }

    #[test]
    fn lookup_is_exact_match() {
        let map = ProxyMap::of(&[("Host", "example.com")]);
        assert_eq!(map.get("Host"), Some("example.com"));
        assert_eq!(map.get("host"), None);
    }

    #[test]
    fn remove_drops_all_entries_for_key() {
        let mut map = ProxyMap::of(&[("a", "1"), ("b", "2"), ("a", "3")]);
        map.remove("a");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("b"), Some("2"));
    }

    #[test]
    fn order_is_preserved() {
        let map = ProxyMap::of(&[("z", "1"), ("a", "2"), ("m", "3")]);
        let keys: Vec<_> = map.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
