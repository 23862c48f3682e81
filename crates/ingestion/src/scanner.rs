//! Source-tree scanner
//!
//! Walks a documentation root and yields the text files the chunker
//! should see, in a deterministic order so ingestion runs are
//! reproducible.

use docpilot_common::errors::{AppError, Result};
use std::path::Path;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// One readable source file, path relative to the scanned root
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// `/`-separated path relative to the root; doubles as the chunk
    /// id namespace component, so it must be stable across runs
    pub relative_path: String,
    pub text: String,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// Walk `root` and collect files whose extension matches `extensions`
/// (case-insensitive). Hidden files and directories are skipped, as are
/// files that cannot be read as UTF-8. Results are sorted by relative
/// path.
pub fn scan_source_tree(root: &Path, extensions: &[String]) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(AppError::Validation {
            message: format!("source root {} is not a directory", root.display()),
            field: Some("source_root".to_string()),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| extensions.iter().any(|allowed| *allowed == ext));
        if !matches {
            continue;
        }

        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        match std::fs::read_to_string(path) {
            Ok(text) => files.push(SourceFile {
                relative_path,
                text,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable source file");
            }
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn md_extensions() -> Vec<String> {
        vec!["md".to_string(), "txt".to_string()]
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("guides")).unwrap();
        fs::write(dir.path().join("zed.md"), "z content").unwrap();
        fs::write(dir.path().join("guides/alpha.md"), "a content").unwrap();
        fs::write(dir.path().join("notes.TXT"), "t content").unwrap();
        fs::write(dir.path().join("image.png"), [0u8, 159, 146, 150]).unwrap();

        let files = scan_source_tree(dir.path(), &md_extensions()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["guides/alpha.md", "notes.TXT", "zed.md"]);
    }

    #[test]
    fn test_scan_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config.md"), "not docs").unwrap();
        fs::write(dir.path().join(".draft.md"), "hidden file").unwrap();
        fs::write(dir.path().join("visible.md"), "docs").unwrap();

        let files = scan_source_tree(dir.path(), &md_extensions()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "visible.md");
    }

    #[test]
    fn test_scan_skips_non_utf8_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("binary.md"), [0xff, 0xfe, 0x00, 0x01]).unwrap();
        fs::write(dir.path().join("plain.md"), "readable").unwrap();

        let files = scan_source_tree(dir.path(), &md_extensions()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "plain.md");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let result = scan_source_tree(Path::new("/nonexistent/docs"), &md_extensions());
        assert!(result.is_err());
    }
}
