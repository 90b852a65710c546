//! Version matrix - deterministic enumeration of (test file, versions) tasks
//!
//! Every declared test contributes one axis per required package. Axes longer
//! than the sample bound are thinned to evenly spaced versions, always keeping
//! the oldest and the newest. Combinations are walked in reflected Gray-code
//! order so two consecutive combinations of a test differ in exactly one
//! package, and every file of the test runs against a combination before the
//! next combination is installed.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument};

use crate::error::MatrixError;
use crate::task::{DeclaredTest, Task, VersionSet};

/// One dependency axis after sampling
#[derive(Debug, Clone)]
struct Axis {
    package: String,
    versions: Vec<String>,
}

/// The combinations of one declared test
#[derive(Debug, Clone)]
struct MatrixEntry {
    files: Vec<String>,
    axes: Vec<Axis>,
    combinations: usize,
    len: usize,
}

impl MatrixEntry {
    fn len(&self) -> usize {
        self.len
    }

    fn task_at(&self, step: usize) -> Task {
        let combination = step / self.files.len();
        let file = &self.files[step % self.files.len()];
        Task::new(file, self.combination(combination))
    }

    /// Decode combination `index` as a reflected mixed-radix Gray code,
    /// last axis varying fastest.
    fn combination(&self, index: usize) -> BTreeMap<String, String> {
        let mut packages = BTreeMap::new();
        let mut block = self.combinations;

        for axis in &self.axes {
            let radix = axis.versions.len();
            block /= radix;
            let q = index / block;
            let raw = q % radix;
            let digit = if (q / radix) % 2 == 1 {
                radix - 1 - raw
            } else {
                raw
            };
            packages.insert(axis.package.clone(), axis.versions[digit].clone());
        }

        packages
    }
}

/// Pick at most `bound` versions, evenly spaced and in order. The first and
/// last versions are kept whenever `bound >= 2`; a bound of one keeps only
/// the newest. `None` or zero means unbounded.
pub fn sample_versions(versions: &[String], bound: Option<usize>) -> Vec<String> {
    let n = versions.len();
    let k = match bound {
        Some(k) if k > 0 && k < n => k,
        _ => return versions.to_vec(),
    };

    if k == 1 {
        return vec![versions[n - 1].clone()];
    }

    (0..k)
        .map(|i| {
            let index = (i * (n - 1) + (k - 1) / 2) / (k - 1);
            versions[index].clone()
        })
        .collect()
}

/// Deterministic, resumable sequence of tasks over declared tests
#[derive(Debug, Clone)]
pub struct VersionMatrix {
    entries: Vec<MatrixEntry>,
    total: usize,
    position: usize,
}

impl VersionMatrix {
    /// Build the matrix. `tests` are taken in declaration order; tests
    /// without files contribute nothing.
    #[instrument(skip_all, fields(tests = tests.len(), packages = versions.len()))]
    pub fn new(
        tests: &[DeclaredTest],
        versions: &VersionSet,
        global_samples: Option<usize>,
    ) -> Result<Self, MatrixError> {
        let mut entries = Vec::new();
        let mut total = 0usize;

        for test in tests {
            if test.files.is_empty() {
                continue;
            }

            let bound = test.samples.or(global_samples);
            let mut axes = Vec::with_capacity(test.packages.len());

            for package in &test.packages {
                let candidates =
                    versions
                        .get(package)
                        .ok_or_else(|| MatrixError::UnknownPackage {
                            test: test.label(),
                            package: package.clone(),
                        })?;
                if candidates.is_empty() {
                    return Err(MatrixError::NoVersions(package.clone()));
                }

                let sampled = sample_versions(candidates, bound);
                debug!(
                    package = %package,
                    candidates = candidates.len(),
                    sampled = sampled.len(),
                    "axis sampled"
                );
                axes.push(Axis {
                    package: package.clone(),
                    versions: sampled,
                });
            }

            let too_many = || MatrixError::TooManyCombinations { test: test.label() };
            let combinations = axes
                .iter()
                .try_fold(1usize, |acc, a| acc.checked_mul(a.versions.len()))
                .ok_or_else(too_many)?;
            let len = combinations
                .checked_mul(test.files.len())
                .ok_or_else(too_many)?;
            total = total.checked_add(len).ok_or_else(too_many)?;

            entries.push(MatrixEntry {
                files: test.files.clone(),
                axes,
                combinations,
                len,
            });
        }

        info!(entries = entries.len(), tasks = total, "version matrix built");

        Ok(Self {
            entries,
            total,
            position: 0,
        })
    }

    /// The next task without advancing
    pub fn peek(&self) -> Option<Task> {
        self.task_at(self.position)
    }

    /// Total number of tasks
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of tasks already produced
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of tasks left
    pub fn remaining(&self) -> usize {
        self.total - self.position
    }

    /// Move to an absolute position, clamped to the end
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.total);
    }

    fn task_at(&self, position: usize) -> Option<Task> {
        let mut offset = position;
        for entry in &self.entries {
            let len = entry.len();
            if offset < len {
                return Some(entry.task_at(offset));
            }
            offset -= len;
        }
        None
    }
}

impl Iterator for VersionMatrix {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        let task = self.peek()?;
        self.position += 1;
        Some(task)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::package_diff;
    use proptest::prelude::*;

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|v| v.to_string()).collect()
    }

    fn packages(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_single_package_sequence() {
        let set = VersionSet::new().with_package("redis", ["1", "2"]);
        let tests = vec![DeclaredTest::new(["redis.test.js"]).with_package("redis")];
        let mut matrix = VersionMatrix::new(&tests, &set, None).unwrap();

        let first = matrix.next().unwrap();
        let second = matrix.next().unwrap();
        assert_eq!(first.packages, packages(&[("redis", "1")]));
        assert_eq!(second.packages, packages(&[("redis", "2")]));
        assert_eq!(package_diff(Some(&first), &second), vec!["redis@2"]);
        assert!(matrix.next().is_none());
        assert!(matrix.next().is_none());
    }

    #[test]
    fn test_no_packages_yields_one_task_per_file() {
        let tests = vec![DeclaredTest::new(["a.test.js", "b.test.js"])];
        let tasks: Vec<Task> = VersionMatrix::new(&tests, &VersionSet::new(), Some(2))
            .unwrap()
            .collect();

        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.packages.is_empty()));
        assert_eq!(tasks[0].test.to_str(), Some("a.test.js"));
        assert_eq!(tasks[1].test.to_str(), Some("b.test.js"));
    }

    #[test]
    fn test_files_share_each_combination() {
        let set = VersionSet::new().with_package("pg", ["7", "8"]);
        let tests = vec![DeclaredTest::new(["a.test.js", "b.test.js"]).with_package("pg")];
        let tasks: Vec<Task> = VersionMatrix::new(&tests, &set, None).unwrap().collect();

        let order: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.test.display().to_string(), t.packages["pg"].clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.test.js".to_string(), "7".to_string()),
                ("b.test.js".to_string(), "7".to_string()),
                ("a.test.js".to_string(), "8".to_string()),
                ("b.test.js".to_string(), "8".to_string()),
            ]
        );
    }

    #[test]
    fn test_gray_code_order() {
        let set = VersionSet::new()
            .with_package("a", ["1", "2"])
            .with_package("b", ["x", "y", "z"]);
        let tests = vec![DeclaredTest::new(["t.test.js"])
            .with_package("a")
            .with_package("b")];
        let tasks: Vec<Task> = VersionMatrix::new(&tests, &set, None).unwrap().collect();

        let combos: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.packages["a"].clone(), t.packages["b"].clone()))
            .collect();
        let expected = [
            ("1", "x"),
            ("1", "y"),
            ("1", "z"),
            ("2", "z"),
            ("2", "y"),
            ("2", "x"),
        ];
        assert_eq!(combos.len(), expected.len());
        for (got, want) in combos.iter().zip(expected.iter()) {
            assert_eq!((got.0.as_str(), got.1.as_str()), *want);
        }
    }

    #[test]
    fn test_tests_concatenate_in_declaration_order() {
        let set = VersionSet::new()
            .with_package("redis", ["1"])
            .with_package("pg", ["8"]);
        let tests = vec![
            DeclaredTest::new(["z.test.js"]).with_package("redis"),
            DeclaredTest::new(["a.test.js"]).with_package("pg"),
        ];
        let tasks: Vec<Task> = VersionMatrix::new(&tests, &set, None).unwrap().collect();
        assert_eq!(tasks[0].test.to_str(), Some("z.test.js"));
        assert_eq!(tasks[1].test.to_str(), Some("a.test.js"));
    }

    #[test]
    fn test_unknown_package_fails() {
        let tests = vec![DeclaredTest::new(["a.test.js"]).with_package("missing")];
        let err = VersionMatrix::new(&tests, &VersionSet::new(), None).unwrap_err();
        assert!(matches!(err, MatrixError::UnknownPackage { .. }));
    }

    #[test]
    fn test_empty_version_list_fails() {
        let set = VersionSet::new().with_package("redis", Vec::<String>::new());
        let tests = vec![DeclaredTest::new(["a.test.js"]).with_package("redis")];
        let err = VersionMatrix::new(&tests, &set, None).unwrap_err();
        assert!(matches!(err, MatrixError::NoVersions(p) if p == "redis"));
    }

    #[test]
    fn test_combination_overflow_fails() {
        let ten: Vec<String> = (1..=10).map(|v| v.to_string()).collect();
        let mut set = VersionSet::new();
        let mut test = DeclaredTest::new(["huge.test.js"]);
        for i in 0..20 {
            let name = format!("pkg{:02}", i);
            set = set.with_package(name.clone(), ten.clone());
            test = test.with_package(name);
        }

        let err = VersionMatrix::new(&[test.clone()], &set, None).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::TooManyCombinations { test } if test == "huge.test.js"
        ));

        let bounded = VersionMatrix::new(&[test.with_samples(2)], &set, None).unwrap();
        assert_eq!(bounded.len(), 1 << 20);
    }

    #[test]
    fn test_empty_files_contribute_nothing() {
        let tests = vec![DeclaredTest::new(Vec::<String>::new())];
        let matrix = VersionMatrix::new(&tests, &VersionSet::new(), None).unwrap();
        assert!(matrix.is_empty());
        assert!(matrix.peek().is_none());
    }

    #[test]
    fn test_sample_keeps_extremes() {
        let all = versions(&["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]);
        assert_eq!(sample_versions(&all, Some(3)), versions(&["1", "6", "10"]));
        assert_eq!(sample_versions(&all, Some(2)), versions(&["1", "10"]));
        assert_eq!(sample_versions(&all, Some(1)), versions(&["10"]));
        assert_eq!(sample_versions(&all, Some(0)), all);
        assert_eq!(sample_versions(&all, None), all);
        assert_eq!(sample_versions(&all, Some(20)), all);
    }

    #[test]
    fn test_per_test_samples_override_global() {
        let set = VersionSet::new().with_package("redis", ["1", "2", "3", "4"]);
        let tests = vec![DeclaredTest::new(["a.test.js"])
            .with_package("redis")
            .with_samples(2)];
        let matrix = VersionMatrix::new(&tests, &set, Some(4)).unwrap();
        assert_eq!(matrix.len(), 2);
    }

    #[test]
    fn test_seek_resumes_sequence() {
        let set = VersionSet::new().with_package("redis", ["1", "2", "3"]);
        let tests = vec![DeclaredTest::new(["a.test.js"]).with_package("redis")];

        let full: Vec<Task> = VersionMatrix::new(&tests, &set, None).unwrap().collect();
        let mut resumed = VersionMatrix::new(&tests, &set, None).unwrap();
        resumed.seek(1);
        assert_eq!(resumed.position(), 1);
        assert_eq!(resumed.remaining(), 2);
        assert_eq!(resumed.collect::<Vec<_>>(), full[1..].to_vec());

        let mut past_end = VersionMatrix::new(&tests, &set, None).unwrap();
        past_end.seek(99);
        assert_eq!(past_end.position(), 3);
        assert!(past_end.next().is_none());
    }

    fn matrix_input() -> impl Strategy<Value = (VersionSet, Vec<DeclaredTest>, Option<usize>)> {
        let set = prop::collection::btree_map("[a-d]", 1usize..8, 1..4);
        (set, prop::option::of(0usize..5), 1usize..4).prop_map(|(sizes, samples, files)| {
            let version_set: VersionSet = sizes
                .iter()
                .map(|(name, n)| (name.clone(), (0..*n).map(|v| v.to_string()).collect()))
                .collect();
            let names: Vec<String> = sizes.keys().cloned().collect();
            let mut tests = Vec::new();
            for (i, _) in names.iter().enumerate() {
                let mut test = DeclaredTest::new((0..files).map(|f| format!("t{}_{}.test.js", i, f)));
                for name in &names[..=i] {
                    test = test.with_package(name.clone());
                }
                tests.push(test);
            }
            (version_set, tests, samples)
        })
    }

    proptest! {
        #[test]
        fn prop_combinations_bounded((set, tests, samples) in matrix_input()) {
            let matrix = VersionMatrix::new(&tests, &set, samples).unwrap();
            let mut expected_max = 0usize;
            for test in &tests {
                let per_axis: usize = test
                    .packages
                    .iter()
                    .map(|p| {
                        let n = set.get(p).unwrap().len();
                        match samples {
                            Some(k) if k > 0 => n.min(k),
                            _ => n,
                        }
                    })
                    .product();
                if let Some(k) = samples.filter(|k| *k > 0) {
                    prop_assert!(per_axis <= k.pow(test.packages.len() as u32));
                }
                expected_max += per_axis * test.files.len();
            }
            prop_assert_eq!(matrix.len(), expected_max);
        }

        #[test]
        fn prop_peek_is_idempotent((set, tests, samples) in matrix_input(), steps in 0usize..10, peeks in 1usize..5) {
            let mut matrix = VersionMatrix::new(&tests, &set, samples).unwrap();
            for _ in 0..steps {
                matrix.next();
            }
            let position = matrix.position();
            let first = matrix.peek();
            for _ in 0..peeks {
                prop_assert_eq!(matrix.peek(), first.clone());
            }
            prop_assert_eq!(matrix.position(), position);
            prop_assert_eq!(matrix.next(), first.clone());
            if first.is_some() {
                prop_assert_eq!(matrix.position(), position + 1);
            }
        }

        #[test]
        fn prop_consecutive_combinations_differ_by_one((set, tests, samples) in matrix_input()) {
            let matrix = VersionMatrix::new(&tests[tests.len() - 1..], &set, samples).unwrap();
            let tasks: Vec<Task> = matrix.collect();
            for pair in tasks.windows(2) {
                let changed = pair[1]
                    .packages
                    .iter()
                    .filter(|(k, v)| pair[0].packages.get(*k) != Some(*v))
                    .count();
                prop_assert!(changed <= 1);
            }
        }

        #[test]
        fn prop_delta_never_reinstalls_unchanged((set, tests, samples) in matrix_input()) {
            let tasks: Vec<Task> = VersionMatrix::new(&tests, &set, samples).unwrap().collect();
            let mut previous: Option<&Task> = None;
            for task in &tasks {
                for spec in package_diff(previous, task) {
                    let (name, version) = spec.split_once('@').unwrap();
                    if let Some(prev) = previous {
                        prop_assert_ne!(prev.packages.get(name).map(String::as_str), Some(version));
                    }
                }
                previous = Some(task);
            }
        }
    }
}
