use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;

/// Container-level facts read from ffprobe.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFacts {
    pub duration: Option<f64>,
    pub bit_rate: Option<u64>,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Ask ffprobe for duration and bitrate. Everything about this is
/// best-effort: a missing binary, a crash, or unparsable output all
/// collapse to empty facts.
pub async fn media_facts(ffprobe_path: Option<&PathBuf>, file: &Path) -> MediaFacts {
    let binary = ffprobe_path
        .map(|p| p.as_os_str().to_owned())
        .unwrap_or_else(|| "ffprobe".into());

    let output = Command::new(binary)
        .args(["-v", "error", "-show_entries", "format=duration,bit_rate", "-of", "json"])
        .arg(file)
        .output()
        .await;

    let output = match output {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            tracing::debug!("ffprobe exited with {}", out.status);
            return MediaFacts::default();
        }
        Err(err) => {
            tracing::debug!("ffprobe unavailable: {err}");
            return MediaFacts::default();
        }
    };

    parse_ffprobe(&output.stdout)
}

fn parse_ffprobe(stdout: &[u8]) -> MediaFacts {
    let parsed: FfprobeOutput = match serde_json::from_slice(stdout) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!("unparsable ffprobe output: {err}");
            return MediaFacts::default();
        }
    };
    let format = match parsed.format {
        Some(format) => format,
        None => return MediaFacts::default(),
    };
    MediaFacts {
        duration: format.duration.and_then(|d| d.parse().ok()),
        bit_rate: format.bit_rate.and_then(|b| b.parse().ok()),
    }
}

/// Fallback bitrate estimate from file size when ffprobe had no answer.
pub fn estimate_bit_rate(size: u64, duration: Option<f64>) -> Option<u64> {
    match duration {
        Some(d) if d > 0.0 => Some(((size as f64 * 8.0) / d) as u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_json() {
        let facts = parse_ffprobe(
            br#"{"format":{"duration":"120.50","bit_rate":"800000"}}"#,
        );
        assert_eq!(facts.duration, Some(120.5));
        assert_eq!(facts.bit_rate, Some(800_000));
    }

    #[test]
    fn garbage_output_is_empty_facts() {
        let facts = parse_ffprobe(b"not json");
        assert!(facts.duration.is_none());
        assert!(facts.bit_rate.is_none());
    }

    #[test]
    fn bitrate_estimate() {
        // 10 MB over 100 s: 800 kbps.
        assert_eq!(estimate_bit_rate(10_000_000, Some(100.0)), Some(800_000));
        assert_eq!(estimate_bit_rate(10_000_000, None), None);
        assert_eq!(estimate_bit_rate(10_000_000, Some(0.0)), None);
    }
}
