use std::slice::{Iter, IterMut};

use smol_str::SmolStr;

/// Represents a single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Collection of SIP headers preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header collection from the given vector without additional cloning.
    pub fn from_vec(headers: Vec<Header>) -> Self {
        Self(headers)
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: SmolStr, value: SmolStr) {
        self.0.push(Header { name, value });
    }

    /// Inserts a header at the very top of the collection.
    pub fn prepend(&mut self, name: SmolStr, value: SmolStr) {
        self.0.insert(0, Header { name, value });
    }

    /// Inserts a header at `index`, clamped to the end of the collection.
    pub fn insert(&mut self, index: usize, name: SmolStr, value: SmolStr) {
        let index = index.min(self.0.len());
        self.0.insert(index, Header { name, value });
    }

    /// Replaces the first header named `name`, appending it when absent.
    pub fn set(&mut self, name: SmolStr, value: SmolStr) {
        match self.position(&name) {
            Some(idx) => self.0[idx].value = value,
            None => self.push(name, value),
        }
    }

    /// Removes the header at `index`.
    pub fn remove_at(&mut self, index: usize) -> Option<Header> {
        (index < self.0.len()).then(|| self.0.remove(index))
    }

    /// Removes every header named `name`, returning how many were dropped.
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Index of the first header whose name matches ignoring ASCII case.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Returns the header at `index` mutably.
    pub fn get_at_mut(&mut self, index: usize) -> Option<&mut Header> {
        self.0.get_mut(index)
    }

    /// Returns an iterator over the stored headers.
    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns a mutable iterator over the stored headers.
    pub fn iter_mut(&mut self) -> IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// Returns the number of headers present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the collection does not contain any headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the first header whose name matches ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Returns all headers with the given name, preserving original order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Consumes the collection returning the underlying vector.
    pub fn into_inner(self) -> Vec<Header> {
        self.0
    }
}

/// Splits a comma separated header value, ignoring commas inside quotes and `<...>`.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                out.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    out.push(value[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepend_and_set() {
        let mut headers = Headers::new();
        headers.push("From".into(), "<sip:a@x>".into());
        headers.prepend("Via".into(), "SIP/2.0/UDP h".into());
        headers.set("from".into(), "<sip:b@x>".into());
        headers.set("Server".into(), "siphon".into());

        let names: Vec<_> = headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Via", "From", "Server"]);
        assert_eq!(headers.get("FROM").map(|v| v.as_str()), Some("<sip:b@x>"));
    }

    #[test]
    fn remove_all_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.push("Via".into(), "a".into());
        headers.push("v".into(), "b".into());
        headers.push("VIA".into(), "c".into());
        assert_eq!(headers.remove_all("via"), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn split_list_respects_quotes_and_brackets() {
        let parts = split_list("\"a,b\" <sip:x;a=1,2>, <sip:y>,");
        assert_eq!(parts, vec!["\"a,b\" <sip:x;a=1,2>", "<sip:y>"]);
    }
}
