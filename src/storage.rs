use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const MAX_BASENAME_LEN: usize = 80;

/// On-disk layout helper for uploaded media. Files live under
/// `<root>/<roomId>/<timestamp>-<sanitized-basename><ext>`.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn room_dir(&self, room_id: &str) -> PathBuf {
        self.root.join(room_id)
    }

    /// Destination path for an upload. Creates the room folder.
    pub async fn dest_path(
        &self,
        room_id: &str,
        original_name: &str,
        ext: &str,
        now: u64,
    ) -> std::io::Result<PathBuf> {
        let dir = self.room_dir(room_id);
        tokio::fs::create_dir_all(&dir).await?;
        let base = sanitize_basename(original_name);
        Ok(dir.join(format!("{now}-{base}{ext}")))
    }

    /// Best-effort removal of everything a room ever stored.
    pub async fn remove_room_dir(&self, room_id: &str) {
        let dir = self.room_dir(room_id);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("could not remove {}: {err}", dir.display());
            }
        }
    }
}

/// Strip path components and anything outside `[A-Za-z0-9._-]`, clamp the
/// length, and never return an empty name.
pub fn sanitize_basename(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(MAX_BASENAME_LEN)
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Lowercase extension of an uploaded filename, with the leading dot.
pub fn file_ext(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}

/// Hex-encoded sha256 of a byte stream fed incrementally.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Convert SubRip to WebVTT: drop cue counters, rewrite `,` decimal
/// separators in timestamp lines, prepend the header. Cue text passes
/// through untouched.
pub fn srt_to_vtt(srt: &str) -> String {
    let mut out = String::with_capacity(srt.len() + 16);
    out.push_str("WEBVTT\n\n");
    let mut previous_blank = true;
    for line in srt.lines() {
        let trimmed = line.trim_end_matches('\r');
        if trimmed.contains("-->") {
            out.push_str(&trimmed.replace(',', "."));
            out.push('\n');
            previous_blank = false;
        } else if previous_blank && trimmed.trim().parse::<u64>().is_ok() {
            // Cue counter line; VTT does not need it.
            continue;
        } else {
            out.push_str(trimmed);
            out.push('\n');
            previous_blank = trimmed.trim().is_empty();
        }
    }
    out
}
