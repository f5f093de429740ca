use std::fmt;

use smol_str::SmolStr;

/// Ordered `;name[=value]` parameter list used by URIs and Via entries.
///
/// Names compare case-insensitively; insertion order is preserved so that a
/// rewritten header serializes the same way it was received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<(SmolStr, Option<SmolStr>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `a=b;c;d=e` (no leading separator). Empty segments are skipped.
    pub fn parse(input: &str) -> Self {
        let mut params = Self::new();
        for part in input.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => params.0.push((
                    SmolStr::new(name.trim()),
                    Some(SmolStr::new(value.trim())),
                )),
                None => params.0.push((SmolStr::new(part), None)),
            }
        }
        params
    }

    /// Looks up a parameter. The outer `Option` is presence, the inner one the value.
    pub fn get(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns the value of a parameter that carries one.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the value in place, or appends the parameter when absent.
    pub fn set(&mut self, name: &str, value: Option<SmolStr>) {
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            self.0.push((SmolStr::new(name), value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<SmolStr>> {
        let idx = self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Option<SmolStr>)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
