/// Captured path arguments of a matched rule.
///
/// Named capture groups land here by name; unnamed groups by position.
/// Iteration yields captures in their order of appearance in the pattern.
#[derive(Debug, Default, Clone)]
pub struct Params {
    entries: Vec<(Option<String>, String)>,
}

impl Params {
    pub(crate) fn push(&mut self, name: Option<&str>, value: &str) {
        self.entries.push((name.map(str::to_string), value.to_string()));
    }

    /// value of a named capture group.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_deref() == Some(name))
            .map(|(_, v)| v.as_str())
    }

    /// value of the `i`-th capture group, named or not.
    pub fn positional(&self, i: usize) -> Option<&str> {
        self.entries.get(i).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> ParamsIter<'_> {
        ParamsIter {
            inner: self.entries.iter(),
        }
    }
}

pub struct ParamsIter<'a> {
    inner: std::slice::Iter<'a, (Option<String>, String)>,
}

impl<'a> Iterator for ParamsIter<'a> {
    type Item = (Option<&'a str>, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(n, v)| (n.as_deref(), v.as_str()))
    }
}
