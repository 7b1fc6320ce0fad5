use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::VideoConfig;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("invalid video name '{0}'")]
    InvalidName(String),
    #[error("video '{0}' not found")]
    NotFound(String),
}

/// Local video files that can be selected as a source by name.
pub struct VideoLibrary {
    directory: PathBuf,
    extensions: Vec<String>,
}

impl VideoLibrary {
    pub fn new(config: &VideoConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn has_video_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// File names in the library, sorted. A missing directory is an empty library.
    pub fn list(&self) -> Vec<String> {
        let read_dir = match std::fs::read_dir(&self.directory) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::debug!(dir = %self.directory.display(), error = %e, "video directory unreadable");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.has_video_extension(path))
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Maps a bare file name to its path inside the library.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, VideoError> {
        let trimmed = name.trim();
        let candidate = Path::new(trimmed);
        let is_bare = candidate.file_name().and_then(|n| n.to_str()) == Some(trimmed);
        if trimmed.is_empty() || !is_bare || !self.has_video_extension(candidate) {
            return Err(VideoError::InvalidName(name.to_string()));
        }

        let path = self.directory.join(trimmed);
        if !path.is_file() {
            return Err(VideoError::NotFound(trimmed.to_string()));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(dir: &Path) -> VideoLibrary {
        VideoLibrary::new(&VideoConfig {
            directory: dir.to_path_buf(),
            extensions: vec!["mp4".to_string()],
            startup: None,
        })
    }

    #[test]
    fn lists_only_videos_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a.MP4"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("c.mp4")).unwrap();

        assert_eq!(library(dir.path()).list(), vec!["a.MP4", "b.mp4"]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(library(&dir.path().join("nope")).list().is_empty());
    }

    #[test]
    fn resolve_rejects_paths_and_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        let lib = library(dir.path());

        assert_eq!(lib.resolve("clip.mp4").unwrap(), dir.path().join("clip.mp4"));
        assert!(matches!(lib.resolve("../clip.mp4"), Err(VideoError::InvalidName(_))));
        assert!(matches!(lib.resolve("sub/clip.mp4"), Err(VideoError::InvalidName(_))));
        assert!(matches!(lib.resolve(""), Err(VideoError::InvalidName(_))));
        assert!(matches!(lib.resolve("clip.txt"), Err(VideoError::InvalidName(_))));
        assert!(matches!(lib.resolve("other.mp4"), Err(VideoError::NotFound(_))));
    }
}
