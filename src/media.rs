use std::path::{Path, PathBuf};

use crate::protocol::{ClientMediaInfo, MediaDescriptor, SubtitleDescriptor};

/// Tolerated duration difference when comparing fingerprints, seconds.
pub const DURATION_TOLERANCE_SECS: f64 = 0.25;

/// An uploaded file owned by its room. Dropping the handle removes the
/// on-disk file, so replacement and room destruction release storage
/// without unlink calls scattered across call sites.
#[derive(Debug)]
pub struct StoredFile {
    path: PathBuf,
}

impl StoredFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoredFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::debug!("could not remove {}: {err}", self.path.display());
        }
    }
}

/// At most one media item and one subtitle per room. Replacement is atomic:
/// the previous descriptor and its file go away together.
#[derive(Debug, Default)]
pub struct MediaRegistry {
    media: Option<(MediaDescriptor, Option<StoredFile>)>,
    subtitle: Option<(SubtitleDescriptor, Option<StoredFile>)>,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn media(&self) -> Option<&MediaDescriptor> {
        self.media.as_ref().map(|(d, _)| d)
    }

    pub fn subtitle(&self) -> Option<&SubtitleDescriptor> {
        self.subtitle.as_ref().map(|(d, _)| d)
    }

    pub fn duration(&self) -> Option<f64> {
        self.media().and_then(|d| d.duration)
    }

    /// Replace the room media; the previous file (if any) is released.
    pub fn replace_media(&mut self, descriptor: MediaDescriptor, file: Option<StoredFile>) {
        self.media = Some((descriptor, file));
    }

    pub fn replace_subtitle(&mut self, descriptor: SubtitleDescriptor, file: Option<StoredFile>) {
        self.subtitle = Some((descriptor, file));
    }

    /// File path for the byte-server, checked against the requested id.
    pub fn media_file(&self, id: uuid::Uuid) -> Option<(&Path, &MediaDescriptor)> {
        match &self.media {
            Some((d, Some(file))) if d.id == id => Some((file.path(), d)),
            _ => None,
        }
    }

    pub fn subtitle_file(&self, id: uuid::Uuid) -> Option<(&Path, &SubtitleDescriptor)> {
        match &self.subtitle {
            Some((d, Some(file))) if d.id == id => Some((file.path(), d)),
            _ => None,
        }
    }
}

/// Fingerprint comparison between a member's local file and the room media:
/// same sha256, same byte size, durations within a quarter second when the
/// room knows one.
pub fn matches(room: &MediaDescriptor, client: &ClientMediaInfo) -> bool {
    if room.sha256 != client.sha256 || room.size != client.size {
        return false;
    }
    match (room.duration, client.duration) {
        (Some(a), Some(b)) => (a - b).abs() <= DURATION_TOLERANCE_SECS,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn descriptor(sha: &str, size: u64, duration: Option<f64>) -> MediaDescriptor {
        MediaDescriptor {
            id: Uuid::new_v4(),
            name: "movie.mkv".into(),
            size,
            mime_type: "video/x-matroska".into(),
            duration,
            sha256: sha.into(),
            selected_at: 0,
        }
    }

    fn client(sha: &str, size: u64, duration: Option<f64>) -> ClientMediaInfo {
        ClientMediaInfo { sha256: sha.into(), size, duration, name: None, mime_type: None }
    }

    #[test]
    fn match_predicate() {
        let room = descriptor("aa", 10, Some(60.0));
        assert!(matches(&room, &client("aa", 10, Some(60.0))));
        assert!(matches(&room, &client("aa", 10, Some(60.2))));
        assert!(!matches(&room, &client("aa", 10, Some(60.3))));
        assert!(!matches(&room, &client("aa", 11, Some(60.0))));
        assert!(!matches(&room, &client("bb", 10, Some(60.0))));
        assert!(!matches(&room, &client("aa", 10, None)));

        let unknown = descriptor("aa", 10, None);
        assert!(matches(&unknown, &client("aa", 10, Some(90.0))));
        assert!(matches(&unknown, &client("aa", 10, None)));
    }

    #[test]
    fn stored_file_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, b"data").unwrap();
        {
            let _file = StoredFile::new(path.clone());
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn replace_media_releases_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        let new_path = dir.path().join("new.bin");
        std::fs::write(&old_path, b"old").unwrap();
        std::fs::write(&new_path, b"new").unwrap();

        let mut registry = MediaRegistry::new();
        registry.replace_media(descriptor("aa", 3, None), Some(StoredFile::new(old_path.clone())));
        registry.replace_media(descriptor("bb", 3, None), Some(StoredFile::new(new_path.clone())));

        assert!(!old_path.exists());
        assert!(new_path.exists());
        assert_eq!(registry.media().unwrap().sha256, "bb");
    }
}
