//! Test file discovery - find test files on disk that no declared test covers

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::task::DeclaredTest;

/// File name patterns that mark a test file, relative to the suite directory
pub const TEST_FILE_PATTERNS: &[&str] = &["*.test.js", "*.test.mjs", "*.test.cjs", "*.test.ts"];

/// Test files directly inside `dir`, sorted by name
pub fn test_files_on_disk(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let base = glob::Pattern::escape(&dir.to_string_lossy());

    for pattern in TEST_FILE_PATTERNS {
        let full = Path::new(&base).join(pattern).to_string_lossy().to_string();
        match glob::glob(&full) {
            Ok(paths) => {
                for path in paths.flatten() {
                    if !path.is_file() {
                        continue;
                    }
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        files.push(name.to_string());
                    }
                }
            }
            Err(e) => warn!(pattern = %full, error = %e, "invalid test file pattern"),
        }
    }

    files.sort();
    files.dedup();
    files
}

/// Test files present in `dir` that none of `tests` reference
pub fn untracked_test_files(dir: &Path, tests: &[DeclaredTest]) -> Vec<String> {
    let declared: HashSet<&str> = tests
        .iter()
        .flat_map(|t| t.files.iter().map(String::as_str))
        .collect();

    let untracked: Vec<String> = test_files_on_disk(dir)
        .into_iter()
        .filter(|f| !declared.contains(f.as_str()))
        .collect();

    debug!(
        dir = %dir.display(),
        untracked = untracked.len(),
        "scanned for untracked test files"
    );
    untracked
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_untracked_files() {
        let temp = TempDir::new().unwrap();
        for name in ["a.test.js", "b.test.mjs", "helper.js", "c.test.js"] {
            std::fs::write(temp.path().join(name), "").unwrap();
        }
        std::fs::create_dir(temp.path().join("d.test.js")).unwrap();

        let tests = vec![DeclaredTest::new(["a.test.js"])];
        let untracked = untracked_test_files(temp.path(), &tests);
        assert_eq!(untracked, vec!["b.test.mjs", "c.test.js"]);
    }

    #[test]
    fn test_missing_dir_has_no_files() {
        assert!(test_files_on_disk(Path::new("/tmp/nonexistent/tav-suite")).is_empty());
    }
}
