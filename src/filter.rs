use std::path::{Path, PathBuf};
use ignore::WalkBuilder;

/// Lists the subdirectories a recursive install should descend into.
///
/// Symbolic links are never followed. With `honor_ignore_files` set,
/// directories excluded by .gitignore / .ignore rules are left out so they
/// cost no low-level watches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryFilter {
    honor_ignore_files: bool,
}

impl DirectoryFilter {
    pub fn new(honor_ignore_files: bool) -> Self {
        Self { honor_ignore_files }
    }

    pub fn honors_ignore_files(&self) -> bool {
        self.honor_ignore_files
    }

    /// Immediate subdirectories of `dir`. Entries that vanish while listing
    /// are skipped.
    pub fn subdirectories<P: AsRef<Path>>(&self, dir: P) -> Vec<PathBuf> {
        let dir = dir.as_ref();
        let honor = self.honor_ignore_files;

        let walker = WalkBuilder::new(dir)
            .max_depth(Some(1))
            .follow_links(false)
            .standard_filters(false)
            .git_ignore(honor)
            .git_exclude(honor)
            .ignore(honor)
            .parents(honor)
            .require_git(false)
            .build();

        let mut dirs = Vec::new();
        for result in walker {
            match result {
                Ok(entry) => {
                    if entry.depth() == 0 {
                        continue;
                    }
                    if entry.file_type().map_or(false, |t| t.is_dir()) {
                        dirs.push(entry.into_path());
                    }
                }
                Err(err) => {
                    tracing::debug!("Skipping entry under {}: {}", dir.display(), err);
                }
            }
        }
        dirs.sort();
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_only_immediate_directories() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/nested")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("file.txt"), "x").unwrap();

        let dirs = DirectoryFilter::new(false).subdirectories(root);

        assert_eq!(dirs, vec![root.join("a"), root.join("b")]);
    }

    #[test]
    fn test_hidden_directories_are_listed() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join(".cache")).unwrap();

        let dirs = DirectoryFilter::default().subdirectories(temp_dir.path());

        assert_eq!(dirs, vec![temp_dir.path().join(".cache")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_skipped() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let dirs = DirectoryFilter::default().subdirectories(root);

        assert_eq!(dirs, vec![root.join("real")]);
    }

    #[test]
    fn test_ignore_files_are_honored() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir(root.join("target")).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::write(root.join(".ignore"), "target/\n").unwrap();

        assert_eq!(DirectoryFilter::new(true).subdirectories(root), vec![root.join("src")]);
        assert_eq!(DirectoryFilter::new(false).subdirectories(root).len(), 2);
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let dirs = DirectoryFilter::default().subdirectories(temp_dir.path().join("gone"));

        assert!(dirs.is_empty());
    }
}
