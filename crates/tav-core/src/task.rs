//! Task types and declared test definitions

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Candidate versions per package, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionSet(BTreeMap<String, Vec<String>>);

impl VersionSet {
    /// Create an empty version set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the candidate versions for a package
    pub fn with_package<I, S>(mut self, name: impl Into<String>, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(name.into(), versions.into_iter().map(Into::into).collect());
        self
    }

    /// Candidate versions for a package
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for VersionSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Required packages, given either as a list of names or as a
/// `name → marker` mapping
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RequiredPackages {
    List(Vec<String>),
    Markers(BTreeMap<String, serde_json::Value>),
}

impl From<RequiredPackages> for BTreeSet<String> {
    fn from(value: RequiredPackages) -> Self {
        match value {
            RequiredPackages::List(names) => names.into_iter().collect(),
            RequiredPackages::Markers(map) => map.into_keys().collect(),
        }
    }
}

fn deserialize_packages<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    RequiredPackages::deserialize(deserializer).map(Into::into)
}

/// A declared test: files plus the packages they are sensitive to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredTest {
    /// Test files, relative to the suite directory
    pub files: Vec<String>,

    /// Packages whose versions this test is exercised against
    #[serde(
        default,
        alias = "packages-required",
        deserialize_with = "deserialize_packages"
    )]
    pub packages: BTreeSet<String>,

    /// Per-test sample bound, overriding the global one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<usize>,
}

impl DeclaredTest {
    /// Create a declared test for the given files
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            packages: BTreeSet::new(),
            samples: None,
        }
    }

    /// Add a required package
    pub fn with_package(mut self, name: impl Into<String>) -> Self {
        self.packages.insert(name.into());
        self
    }

    /// Set the per-test sample bound
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = Some(samples);
        self
    }

    /// Short label used in logs and errors
    pub fn label(&self) -> String {
        self.files.join(",")
    }

    /// Keep only files containing one of `patterns`. Returns `None` when no
    /// file survives. An empty pattern list keeps everything.
    pub fn filtered(&self, patterns: &[String]) -> Option<Self> {
        if patterns.is_empty() {
            return Some(self.clone());
        }

        let files: Vec<String> = self
            .files
            .iter()
            .filter(|f| patterns.iter().any(|p| f.contains(p.as_str())))
            .cloned()
            .collect();

        if files.is_empty() {
            None
        } else {
            Some(Self {
                files,
                ..self.clone()
            })
        }
    }
}

/// Apply a pattern filter to a list of declared tests, dropping tests that
/// end up with no files
pub fn filter_tests(tests: &[DeclaredTest], patterns: &[String]) -> Vec<DeclaredTest> {
    tests.iter().filter_map(|t| t.filtered(patterns)).collect()
}

/// One unit of work: a test file and a concrete version per package
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    /// Test file (relative from the matrix, absolute once dispatched)
    pub test: PathBuf,
    /// Package name → version
    pub packages: BTreeMap<String, String>,
}

impl Task {
    pub fn new(test: impl Into<PathBuf>, packages: BTreeMap<String, String>) -> Self {
        Self {
            test: test.into(),
            packages,
        }
    }

    /// Rebase the test file onto `dir`
    pub fn resolved(mut self, dir: &Path) -> Self {
        self.test = dir.join(&self.test);
        self
    }

    /// `name@version` for every package of this task
    pub fn install_specs(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|(name, version)| package_spec(name, version))
            .collect()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .test
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| self.test.to_string_lossy());
        if self.packages.is_empty() {
            write!(f, "{}", name)
        } else {
            write!(f, "{} ({})", name, self.install_specs().join(" "))
        }
    }
}

/// Format an install argument
pub fn package_spec(name: &str, version: &str) -> String {
    format!("{}@{}", name, version)
}

/// Packages of `next` that `previous` does not already provide at the same
/// version, as `name@version`. Packages only present in `previous` are left
/// alone: installs accumulate in the suite directory.
pub fn package_diff(previous: Option<&Task>, next: &Task) -> Vec<String> {
    next.packages
        .iter()
        .filter(|(name, version)| {
            previous
                .and_then(|p| p.packages.get(*name))
                .map_or(true, |installed| installed != *version)
        })
        .map(|(name, version)| package_spec(name, version))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task(test: &str, packages: &[(&str, &str)]) -> Task {
        Task::new(
            test,
            packages
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_install_specs() {
        let t = task("a.test.js", &[("redis", "2"), ("ioredis", "4.1.0")]);
        assert_eq!(t.install_specs(), vec!["ioredis@4.1.0", "redis@2"]);
    }

    #[test]
    fn test_diff_without_previous_installs_everything() {
        let t = task("a.test.js", &[("redis", "1")]);
        assert_eq!(package_diff(None, &t), vec!["redis@1"]);
    }

    #[test]
    fn test_diff_only_changed_versions() {
        let a = task("a.test.js", &[("redis", "1"), ("pg", "8")]);
        let b = task("a.test.js", &[("redis", "2"), ("pg", "8")]);
        assert_eq!(package_diff(Some(&a), &b), vec!["redis@2"]);
    }

    #[test]
    fn test_diff_is_additive() {
        let a = task("a.test.js", &[("redis", "1"), ("pg", "8")]);
        let b = task("b.test.js", &[("mysql", "2")]);
        assert_eq!(package_diff(Some(&a), &b), vec!["mysql@2"]);

        let c = task("c.test.js", &[]);
        assert!(package_diff(Some(&a), &c).is_empty());
    }

    #[test]
    fn test_filter_by_pattern() {
        let both = DeclaredTest::new(["foo.test.js", "bar.test.js"]);
        let bar = DeclaredTest::new(["bar.test.js"]);
        let patterns = vec!["foo".to_string()];

        let filtered = filter_tests(&[both, bar], &patterns);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].files, vec!["foo.test.js"]);
    }

    #[test]
    fn test_filter_without_patterns_keeps_all() {
        let t = DeclaredTest::new(["a.test.js"]);
        assert_eq!(t.filtered(&[]), Some(t.clone()));
    }

    #[test]
    fn test_declared_test_packages_as_markers() {
        let json = r#"{"files": ["redis.test.js"], "packages-required": {"redis": true, "ioredis": "*"}}"#;
        let t: DeclaredTest = serde_json::from_str(json).unwrap();
        assert_eq!(
            t.packages.into_iter().collect::<Vec<_>>(),
            vec!["ioredis", "redis"]
        );
    }

    #[test]
    fn test_declared_test_packages_as_list() {
        let yaml = "files: [pg.test.js]\npackages: [pg]\nsamples: 3\n";
        let t: DeclaredTest = serde_yaml::from_str(yaml).unwrap();
        assert!(t.packages.contains("pg"));
        assert_eq!(t.samples, Some(3));
    }

    #[test]
    fn test_task_display() {
        let t = task("/suite/redis.test.js", &[("redis", "2")]);
        assert_eq!(t.to_string(), "redis.test.js (redis@2)");
    }

    fn packages_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map("[a-e]", "[0-3]", 0..5)
    }

    proptest! {
        #[test]
        fn prop_diff_empty_iff_all_versions_match(a in packages_strategy(), b in packages_strategy()) {
            let ta = Task::new("a", a.clone());
            let tb = Task::new("b", b.clone());
            let diff = package_diff(Some(&ta), &tb);
            let all_match = b.iter().all(|(k, v)| a.get(k) == Some(v));
            prop_assert_eq!(diff.is_empty(), all_match);
        }

        #[test]
        fn prop_diff_only_contains_next_keys(a in packages_strategy(), b in packages_strategy()) {
            let ta = Task::new("a", a);
            let tb = Task::new("b", b.clone());
            for spec in package_diff(Some(&ta), &tb) {
                let (name, version) = spec.split_once('@').unwrap();
                prop_assert_eq!(b.get(name).map(String::as_str), Some(version));
            }
        }
    }
}
