//! Recursive listing of a stream's local directory.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use tracing::debug;

/// Every file under `root`, as `/`-separated paths relative to `root`.
///
/// A missing root lists as empty. Unreadable subdirectories are skipped.
pub fn walk_listing(root: &Path) -> io::Result<HashSet<String>> {
    let mut listing = HashSet::new();
    match std::fs::read_dir(root) {
        Ok(_) => collect_files_recursive(root, "", &mut listing),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(listing)
}

fn collect_files_recursive(dir: &Path, prefix: &str, listing: &mut HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Failed to read directory during listing");
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let relative = format!("{}{}", prefix, name.to_string_lossy());
        let path = entry.path();
        if path.is_dir() {
            collect_files_recursive(&path, &format!("{}/", relative), listing);
        } else {
            listing.insert(relative);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lists_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("train/a")).unwrap();
        std::fs::write(dir.path().join("index.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("train/a/shard.00000.mds"), b"x").unwrap();

        let listing = walk_listing(dir.path()).unwrap();
        let expected: HashSet<String> = ["index.json", "train/a/shard.00000.mds"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(listing, expected);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(walk_listing(&dir.path().join("absent")).unwrap().is_empty());
    }
}
