//! Exclude patterns for the shadow repository.
//!
//! Written to the shadow repo's `info/exclude`, never to the user's
//! `.gitignore`, so checkpointing leaves no trace in the workspace.

use std::path::Path;

use crate::errors::CheckpointError;

/// Build artifacts and dependency trees.
const BUILD_ARTIFACTS: &[&str] = &[
    ".gradle/",
    ".idea/",
    ".parcel-cache/",
    ".next/",
    ".nuxt/",
    ".venv/",
    "venv/",
    "__pycache__/",
    "node_modules/",
    "target/",
    "build/",
    "dist/",
    "out/",
    "coverage/",
    ".cache/",
];

/// Large media and binary blobs that would bloat the object store.
const MEDIA_FILES: &[&str] = &[
    "*.jpg", "*.jpeg", "*.png", "*.gif", "*.bmp", "*.ico", "*.webp", "*.tiff", "*.svg", "*.mp3",
    "*.wav", "*.flac", "*.ogg", "*.mp4", "*.avi", "*.mkv", "*.mov", "*.webm",
];

const BINARY_FILES: &[&str] = &[
    "*.zip", "*.tar", "*.gz", "*.rar", "*.7z", "*.iso", "*.bin", "*.exe", "*.dll", "*.so",
    "*.dylib", "*.o", "*.a", "*.class", "*.jar", "*.war", "*.pyc", "*.wasm",
];

const DATABASE_FILES: &[&str] = &[
    "*.db", "*.sqlite", "*.sqlite3", "*.mdb", "*.dump", "*.bak",
];

const LOG_AND_TEMP_FILES: &[&str] = &[
    "*.log", "*.tmp", "*.temp", "*.swp", "*.swo", ".DS_Store", "Thumbs.db",
];

const ENV_FILES: &[&str] = &[".env", ".env.*"];

/// All exclude patterns, layered by category. `.git` itself is excluded
/// first so the workspace's own repository is never staged.
pub fn excludes() -> Vec<String> {
    std::iter::once(".git/".to_string())
        .chain(BUILD_ARTIFACTS.iter().map(|s| s.to_string()))
        .chain(MEDIA_FILES.iter().map(|s| s.to_string()))
        .chain(BINARY_FILES.iter().map(|s| s.to_string()))
        .chain(DATABASE_FILES.iter().map(|s| s.to_string()))
        .chain(LOG_AND_TEMP_FILES.iter().map(|s| s.to_string()))
        .chain(ENV_FILES.iter().map(|s| s.to_string()))
        .collect()
}

/// Write the exclude list into `<git_dir>/info/exclude`.
pub fn write_exclude_file(git_dir: &Path) -> Result<(), CheckpointError> {
    let info_dir = git_dir.join("info");
    std::fs::create_dir_all(&info_dir).map_err(|e| CheckpointError::Storage {
        path: info_dir.clone(),
        message: e.to_string(),
    })?;
    let path = info_dir.join("exclude");
    let body = excludes().join("\n") + "\n";
    std::fs::write(&path, body).map_err(|e| CheckpointError::Storage {
        path,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_git_dir_always_excluded_first() {
        let patterns = excludes();
        assert_eq!(patterns[0], ".git/");
    }

    #[test]
    fn test_categories_present() {
        let patterns = excludes();
        assert!(patterns.iter().any(|p| p == "node_modules/"));
        assert!(patterns.iter().any(|p| p == "target/"));
        assert!(patterns.iter().any(|p| p == "*.mp4"));
        assert!(patterns.iter().any(|p| p == "*.sqlite"));
        assert!(patterns.iter().any(|p| p == ".env"));
    }

    #[test]
    fn test_write_exclude_file() {
        let dir = TempDir::new().unwrap();
        write_exclude_file(dir.path()).unwrap();

        let body = std::fs::read_to_string(dir.path().join("info/exclude")).unwrap();
        assert!(body.starts_with(".git/\n"));
        assert!(body.ends_with('\n'));
        assert!(body.contains("node_modules/"));
    }
}
