use std::collections::HashMap;

/// Rule flags carried by trie nodes. `INCLUDE` overrides an ancestor `IGNORE`.
pub const IGNORE: u8 = 1 << 0;
pub const INCLUDE: u8 = 1 << 1;

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    flags: u8,
}

impl TrieNode {
    fn subtree_has(&self, flag: u8) -> bool {
        if self.flags & flag != 0 {
            return true;
        }
        self.children.values().any(|c| c.subtree_has(flag))
    }
}

/// Prefix trie over `/`-separated path segments, classifying paths against
/// ignore and include rules in O(path length).
///
/// Classification carries the flags of the deepest rule node seen on the
/// walk; falling off the trie means the last rule encountered applies, which
/// gives gitignore-style inheritance (an ignored directory ignores its
/// children unless a deeper include rule re-admits them).
pub struct PathFilter {
    root: TrieNode,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

impl PathFilter {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
        }
    }

    /// Build a filter from project config rule lists.
    pub fn from_rules(ignored: &[String], included: &[String]) -> Self {
        let mut filter = Self::new();
        for rule in ignored {
            filter.insert(rule, IGNORE);
        }
        for rule in included {
            filter.insert(rule, INCLUDE);
        }
        filter
    }

    /// Insert a rule; ORs the flag into the leaf, so repeated insertion of
    /// the same rule is idempotent.
    pub fn insert(&mut self, path: &str, flag: u8) {
        let mut current = &mut self.root;
        for segment in segments(path) {
            current = current.children.entry(segment.to_string()).or_default();
        }
        current.flags |= flag;
    }

    /// Flags of the deepest matching rule along `path`.
    pub fn classify(&self, path: &str) -> u8 {
        let mut current = &self.root;
        let mut accumulated = 0u8;

        for segment in segments(path) {
            match current.children.get(segment) {
                Some(child) => {
                    current = child;
                    if current.flags != 0 {
                        accumulated = current.flags;
                    }
                }
                None => break,
            }
        }

        accumulated
    }

    /// Whether an include rule exists at or below `path`. Directories on the
    /// way to an include rule must be descended even when ignored.
    pub fn has_include_beneath(&self, path: &str) -> bool {
        let mut current = &self.root;
        for segment in segments(path) {
            match current.children.get(segment) {
                Some(child) => current = child,
                None => return false,
            }
        }
        current.subtree_has(INCLUDE)
    }

    /// Directory descent decision: not ignored, an include match itself, or
    /// a bridge toward a deeper include rule.
    pub fn should_descend(&self, rel_dir: &str) -> bool {
        let flags = self.classify(rel_dir);
        if flags & INCLUDE != 0 {
            return true;
        }
        if flags & IGNORE != 0 {
            return self.has_include_beneath(rel_dir);
        }
        true
    }

    /// File decision: `INCLUDE ∨ (¬IGNORE ∧ extension_allowed)`.
    pub fn should_index_file(&self, rel_file: &str, extension_allowed: bool) -> bool {
        let flags = self.classify(rel_file);
        if flags & INCLUDE != 0 {
            return true;
        }
        flags & IGNORE == 0 && extension_allowed
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(ignored: &[&str], included: &[&str]) -> PathFilter {
        PathFilter::from_rules(
            &ignored.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &included.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    /// Reference implementation: linear scan over rules, deepest match wins.
    fn classify_linear(ignored: &[&str], included: &[&str], path: &str) -> u8 {
        let path_segs: Vec<&str> = segments(path).collect();
        let mut best_depth = 0usize;
        let mut flags = 0u8;

        let mut consider = |rule: &str, flag: u8| {
            let rule_segs: Vec<&str> = segments(rule).collect();
            if rule_segs.len() <= path_segs.len()
                && rule_segs
                    .iter()
                    .zip(path_segs.iter())
                    .all(|(a, b)| a == b)
            {
                match rule_segs.len().cmp(&best_depth) {
                    std::cmp::Ordering::Greater => {
                        best_depth = rule_segs.len();
                        flags = flag;
                    }
                    std::cmp::Ordering::Equal if best_depth > 0 => flags |= flag,
                    _ => {}
                }
            }
        };

        for rule in ignored {
            consider(rule, IGNORE);
        }
        for rule in included {
            consider(rule, INCLUDE);
        }
        flags
    }

    #[test]
    fn ignore_applies_to_descendants() {
        let f = filter(&["node_modules"], &[]);
        assert_eq!(f.classify("node_modules"), IGNORE);
        assert_eq!(f.classify("node_modules/react/index.js"), IGNORE);
        assert_eq!(f.classify("src/app.ts"), 0);
    }

    #[test]
    fn include_overrides_ancestor_ignore() {
        let f = filter(&["node_modules"], &["node_modules/zod"]);
        assert_eq!(f.classify("node_modules/react"), IGNORE);
        assert_eq!(f.classify("node_modules/zod"), INCLUDE);
        assert_eq!(f.classify("node_modules/zod/lib/index.ts"), INCLUDE);
    }

    #[test]
    fn insertion_is_idempotent() {
        let mut f = PathFilter::new();
        f.insert("vendor", IGNORE);
        f.insert("vendor", IGNORE);
        assert_eq!(f.classify("vendor/lib.c"), IGNORE);
    }

    #[test]
    fn bridge_directories_are_descended() {
        let f = filter(&["node_modules"], &["node_modules/zod"]);
        // Ignored, but an ancestor of the include rule.
        assert!(f.should_descend("node_modules"));
        // Ignored with no exception beneath.
        let f2 = filter(&["node_modules"], &[]);
        assert!(!f2.should_descend("node_modules"));
        // Plain directories descend.
        assert!(f2.should_descend("src"));
    }

    #[test]
    fn file_decision_honors_extension_gate() {
        let f = filter(&["dist"], &["dist/keep.min.js"]);
        assert!(f.should_index_file("src/app.ts", true));
        assert!(!f.should_index_file("src/app.ts", false));
        assert!(!f.should_index_file("dist/bundle.js", true));
        // Include wins over both ignore and extension gate.
        assert!(f.should_index_file("dist/keep.min.js", false));
    }

    #[test]
    fn matches_linear_scan_reference() {
        let ignored = ["node_modules", "build/out", "vendor"];
        let included = ["node_modules/zod", "build/out/keep"];
        let f = filter(&ignored, &included);

        let paths = [
            "node_modules",
            "node_modules/zod",
            "node_modules/zod/src/index.ts",
            "node_modules/react/index.js",
            "build",
            "build/out",
            "build/out/keep",
            "build/out/keep/a.ts",
            "build/out/drop/b.ts",
            "vendor/lib.c",
            "src/main.rs",
            "./src/main.rs",
        ];
        for path in paths {
            assert_eq!(
                f.classify(path),
                classify_linear(&ignored, &included, path),
                "divergence at {path}"
            );
        }
    }

    #[test]
    fn dot_segments_are_skipped() {
        let f = filter(&["target"], &[]);
        assert_eq!(f.classify("./target/debug"), IGNORE);
    }
}
