use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Stream facts ffprobe reports for the first video stream of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub frames: u64,
    pub frame_rate: Option<f64>,
    pub duration: Option<Duration>,
}

impl fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} frames={}", self.width, self.height, self.frames)?;
        if let Some(r) = self.frame_rate {
            write!(f, " fps={:.2}", r)?;
        }
        if let Some(d) = self.duration {
            write!(f, " duration={:.2}s", d.as_secs_f64())?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_read_packets: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

pub fn probe_video(ffprobe: &Path, path: &Path) -> Result<ProbeInfo> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=width,height,nb_read_packets,r_frame_rate,duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .with_context(|| format!("failed to run {} on {}", ffprobe.display(), path.display()))?;

    if !output.status.success() {
        bail!(
            "ffprobe failed for {} status={} stderr={}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_probe_json(&output.stdout).with_context(|| format!("probe {}", path.display()))
}

fn parse_probe_json(raw: &[u8]) -> Result<ProbeInfo> {
    let parsed: FfprobeOutput = serde_json::from_slice(raw).context("parse ffprobe json")?;
    let Some(stream) = parsed.streams.into_iter().next() else {
        bail!("no video stream found");
    };

    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        bail!("video stream has no dimensions");
    };

    let frames = stream
        .nb_read_packets
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);

    let duration = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    Ok(ProbeInfo {
        width,
        height,
        frames,
        frame_rate: stream.r_frame_rate.as_deref().and_then(parse_rational),
        duration,
    })
}

/// ffprobe rates look like `24/1` or `30000/1001`.
fn parse_rational(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/').unwrap_or((s, "1"));
    let num = num.trim().parse::<f64>().ok()?;
    let den = den.trim().parse::<f64>().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_counted_stream() {
        let raw = br#"{
            "programs": [],
            "streams": [
                {"width": 320, "height": 720, "r_frame_rate": "24/1",
                 "duration": "4.166667", "nb_read_packets": "100"}
            ]
        }"#;
        let info = parse_probe_json(raw).expect("parse");
        assert_eq!((info.width, info.height, info.frames), (320, 720, 100));
        assert_eq!(info.frame_rate, Some(24.0));
        let secs = info.duration.expect("duration").as_secs_f64();
        assert!((secs - 4.1667).abs() < 0.001);
        assert_eq!(info.to_string(), "320x720 frames=100 fps=24.00 duration=4.17s");
    }

    #[test]
    fn empty_stream_list_is_an_error() {
        let err = parse_probe_json(br#"{"streams": []}"#).expect_err("no stream");
        assert!(err.to_string().contains("no video stream"));
        assert!(parse_probe_json(b"{}").is_err());
    }

    #[test]
    fn rationals_handle_ntsc_and_zero() {
        let ntsc = parse_rational("30000/1001").expect("ntsc");
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_rational("25"), Some(25.0));
        assert_eq!(parse_rational("0/0"), None);
    }
}
