use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use common::{
    storage::types::file_reference::{FileEvent, FileReference},
    utils::config::DirectoryConfig,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Walks a configured directory once and queues every accepted file as `Created`.
pub async fn collect_events(directory: &DirectoryConfig) -> Result<Vec<FileEvent>> {
    let config = directory.clone();
    let paths = tokio::task::spawn_blocking(move || scan_directory(&config)).await??;

    let mut events = Vec::with_capacity(paths.len());
    for path in paths {
        match FileReference::from_path(&path, directory.id.clone()).await {
            Ok(reference) => events.push(FileEvent::Created(reference)),
            Err(err) => warn!(
                path = %path.display(),
                directory_id = %directory.id,
                error = %err,
                "file vanished before it could be queued"
            ),
        }
    }
    Ok(events)
}

/// Accepted files under the directory root, sorted for a stable run order.
///
/// Exclude patterns are matched against the path relative to the root.
pub fn scan_directory(directory: &DirectoryConfig) -> Result<Vec<PathBuf>> {
    let root = Path::new(&directory.path);
    if !root.is_dir() {
        bail!("directory {} does not exist", root.display());
    }
    let excludes = build_globset(&directory.exclude_patterns)
        .with_context(|| format!("invalid exclude pattern for directory {}", directory.id))?;

    let mut walker = WalkDir::new(root).follow_links(false);
    if !directory.recursive {
        walker = walker.max_depth(1);
    }

    let mut paths = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(directory_id = %directory.id, error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.is_match(relative) {
            debug!(path = %path.display(), "excluded by pattern");
            continue;
        }
        if !directory.accepts(path) {
            continue;
        }
        paths.push(path.to_path_buf());
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn directory(root: &Path, recursive: bool, excludes: &[&str]) -> DirectoryConfig {
        DirectoryConfig {
            id: "archive".into(),
            path: root.to_string_lossy().into_owned(),
            enabled: true,
            recursive,
            file_types: vec!["pdf".into(), "text".into()],
            exclude_patterns: excludes.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(path, b"content").expect("write file");
    }

    fn names(root: &Path, paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(root).expect("under root").to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn filters_by_type_and_exclude_pattern() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "akte.pdf");
        touch(dir.path(), "notiz.txt");
        touch(dir.path(), "foto.png");
        touch(dir.path(), "tmp/entwurf.pdf");
        touch(dir.path(), "2023/brief.pdf");

        let paths = scan_directory(&directory(dir.path(), true, &["tmp/**"])).expect("scan");

        assert_eq!(
            names(dir.path(), &paths),
            vec!["2023/brief.pdf", "akte.pdf", "notiz.txt"]
        );
    }

    #[test]
    fn non_recursive_scan_stays_at_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "akte.pdf");
        touch(dir.path(), "2023/brief.pdf");

        let paths = scan_directory(&directory(dir.path(), false, &[])).expect("scan");

        assert_eq!(names(dir.path(), &paths), vec!["akte.pdf"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone");
        assert!(scan_directory(&directory(&missing, true, &[])).is_err());
    }

    #[tokio::test]
    async fn queued_events_carry_size_and_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "akte.pdf");

        let events = collect_events(&directory(dir.path(), true, &[]))
            .await
            .expect("collect");

        assert_eq!(events.len(), 1);
        let FileEvent::Created(reference) = &events[0] else {
            panic!("expected a created event");
        };
        assert_eq!(reference.directory_id, "archive");
        assert_eq!(reference.size, 7);
        assert!(reference.modified_at.is_some());
    }
}
