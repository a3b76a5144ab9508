use std::collections::{HashMap, HashSet};

pub const DEFAULT_PRIORITY: i32 = 0;

/// Paths that are never deduplicated (token administration).
pub const UNCOORDINATED_PREFIXES: [&str; 2] = ["/staff-auth", "/staff-tokens"];

/// Static path → priority lookup supplied by the host. Higher is more urgent.
#[derive(Clone, Debug)]
pub struct PriorityTable {
    levels: HashMap<String, i32>,
    legacy_last_one_wins: HashSet<String>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::new([
            ("/shutdown", 200),
            ("/open-book", 100),
            ("/open-random-book", 100),
            ("/close-book", 90),
            ("/navigate", 50),
            ("/state", 40),
            ("/books", 30),
            ("/books-stream", 30),
            ("/auth", 20),
            ("/screenshot", 10),
        ])
    }
}

impl PriorityTable {
    pub fn new<I, P>(levels: I) -> Self
    where
        I: IntoIterator<Item = (P, i32)>,
        P: Into<String>,
    {
        Self {
            levels: levels
                .into_iter()
                .map(|(path, level)| (path.into(), level))
                .collect(),
            legacy_last_one_wins: HashSet::new(),
        }
    }

    /// Paths that always cancel the previous same-path request, kept for
    /// clients that predate per-path last-one-wins detection.
    pub fn with_legacy_last_one_wins<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.legacy_last_one_wins = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(&self, path: &str) -> i32 {
        self.levels.get(path).copied().unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn is_legacy_last_one_wins(&self, path: &str) -> bool {
        self.legacy_last_one_wins.contains(path)
    }
}

/// Only GET/POST outside the token administration paths are coordinated.
pub fn is_coordinated(method: &str, path: &str) -> bool {
    if !matches!(method, "GET" | "POST") {
        return false;
    }
    !UNCOORDINATED_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_paths_default_to_zero() {
        let table = PriorityTable::default();
        assert_eq!(table.priority("/open-book"), 100);
        assert_eq!(table.priority("/shutdown"), 200);
        assert_eq!(table.priority("/unknown"), DEFAULT_PRIORITY);
    }

    #[test]
    fn legacy_set_is_empty_by_default() {
        let table = PriorityTable::default();
        assert!(!table.is_legacy_last_one_wins("/open-random-book"));
        let table = table.with_legacy_last_one_wins(["/open-random-book"]);
        assert!(table.is_legacy_last_one_wins("/open-random-book"));
    }

    #[test]
    fn side_effecting_methods_and_token_paths_are_not_coordinated() {
        assert!(is_coordinated("GET", "/books"));
        assert!(is_coordinated("POST", "/close-book"));
        assert!(!is_coordinated("DELETE", "/books"));
        assert!(!is_coordinated("PUT", "/books"));
        assert!(!is_coordinated("GET", "/staff-tokens/list"));
        assert!(!is_coordinated("POST", "/staff-auth"));
    }
}
