use super::discovery::names_equal;

/// Output variables read back after a script ran.
///
/// Names compare case-insensitively and keep the order they were requested
/// in. Every requested name has an entry; `None` means the script never set it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputVariables {
    entries: Vec<(String, Option<String>)>,
}

impl OutputVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// One unresolved entry per distinct name.
    pub fn requested<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vars = Self::new();
        for name in names {
            vars.insert(name, None);
        }
        vars
    }

    /// Insert or replace; a later insert for the same name wins.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| names_equal(n, &name)) {
            Some(entry) => *entry = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| names_equal(n, name))
    }

    /// The resolved value; `None` both for unresolved and unknown names.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| names_equal(n, name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_names_start_unresolved() {
        let vars = OutputVariables::requested(["Result", "count"]);
        assert_eq!(vars.len(), 2);
        assert!(vars.contains("result"));
        assert_eq!(vars.get("RESULT"), None);
        assert_eq!(vars.unresolved().collect::<Vec<_>>(), vec!["Result", "count"]);
    }

    #[test]
    fn duplicate_requests_collapse() {
        let vars = OutputVariables::requested(["x", "X"]);
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn insert_replaces_case_insensitively() {
        let mut vars = OutputVariables::requested(["Result"]);
        vars.insert("result", Some("ok".to_string()));
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.get("Result"), Some("ok"));
        assert_eq!(vars.unresolved().count(), 0);
    }
}
