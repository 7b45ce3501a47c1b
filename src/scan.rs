use crate::layout::{MapLayout, StreamKind};
use crate::manifest::CaptureParameters;

use anyhow::{Context, Result};
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// What one stream directory holds.
#[derive(Debug, Clone)]
pub struct StreamScan {
    pub kind: StreamKind,
    pub dir: PathBuf,
    pub dir_exists: bool,
    pub first_index: Option<u64>,
    pub last_index: Option<u64>,
    pub frame_count: u64,
    pub gaps: Vec<RangeInclusive<u64>>,
}

impl StreamScan {
    pub fn start_number(&self) -> u64 {
        self.first_index.unwrap_or(0)
    }

    /// Frames ffmpeg will actually read: image2 stops at the first missing index.
    pub fn contiguous_frames(&self) -> u64 {
        match (self.first_index, self.gaps.first()) {
            (Some(first), Some(gap)) => gap.start() - first,
            (Some(_), None) => self.frame_count,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetScan {
    pub streams: Vec<StreamScan>,
    pub parameters: Option<CaptureParameters>,
    pub warnings: Vec<String>,
}

impl DatasetScan {
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamScan> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    /// Frame count the composite is expected to reach (shortest readable stream).
    pub fn expected_composite_frames(&self) -> u64 {
        self.streams
            .iter()
            .map(StreamScan::contiguous_frames)
            .min()
            .unwrap_or(0)
    }
}

pub fn scan_stream(layout: &MapLayout, kind: StreamKind) -> Result<StreamScan> {
    let dir = layout.frame_dir(kind);
    if !dir.is_dir() {
        return Ok(StreamScan {
            kind,
            dir,
            dir_exists: false,
            first_index: None,
            last_index: None,
            frame_count: 0,
            gaps: vec![],
        });
    }

    let mut indices = vec![];
    for entry in std::fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
        let e = entry?;
        let p = e.path();
        if !p.is_file() {
            continue;
        }
        let name = e.file_name();
        if let Some(idx) = layout.parse_frame_index(kind, &name.to_string_lossy()) {
            indices.push(idx);
        }
    }
    indices.sort_unstable();
    indices.dedup();

    Ok(StreamScan {
        kind,
        dir,
        dir_exists: true,
        first_index: indices.first().copied(),
        last_index: indices.last().copied(),
        frame_count: indices.len() as u64,
        gaps: find_gaps(&indices),
    })
}

/// Scans all three streams plus the capture parameters. Nothing found here is fatal.
pub fn scan_dataset(layout: &MapLayout) -> Result<DatasetScan> {
    let mut warnings = vec![];

    let parameters = match CaptureParameters::load(&layout.parameters_path()) {
        Ok(p) => p,
        Err(err) => {
            warnings.push(format!("{:#}", err));
            None
        }
    };

    let mut streams = Vec::with_capacity(StreamKind::ALL.len());
    for kind in StreamKind::ALL {
        streams.push(scan_stream(layout, kind)?);
    }

    for s in &streams {
        if !s.dir_exists {
            warnings.push(format!("{} frames: missing directory {}", s.kind, s.dir.display()));
        } else if s.frame_count == 0 {
            warnings.push(format!("{} frames: no frames in {}", s.kind, s.dir.display()));
        }
        if !s.gaps.is_empty() {
            warnings.push(format!(
                "{} frames: {} gap(s), first missing {}; clip will stop after {} frames",
                s.kind,
                s.gaps.len(),
                describe_range(&s.gaps[0]),
                s.contiguous_frames()
            ));
        }
    }

    let counts = streams.iter().map(|s| s.frame_count).collect::<Vec<_>>();
    if counts.iter().any(|&c| c != counts[0]) {
        let detail = streams
            .iter()
            .map(|s| format!("{}={}", s.kind, s.frame_count))
            .collect::<Vec<_>>()
            .join(" ");
        warnings.push(format!(
            "frame counts differ ({}); composite truncates to the shortest",
            detail
        ));
    }

    if let Some(params) = &parameters {
        if !params.describes_map(&layout.map) {
            warnings.push(format!(
                "map {} is not listed in {}",
                layout.map,
                layout.parameters_path().display()
            ));
        } else if let Some(expected) = params.imgs_per_map {
            for s in &streams {
                if s.dir_exists && s.frame_count != expected {
                    warnings.push(format!(
                        "{} frames: found {} but capture requested {}",
                        s.kind, s.frame_count, expected
                    ));
                }
            }
        }
    }

    Ok(DatasetScan {
        streams,
        parameters,
        warnings,
    })
}

fn find_gaps(sorted: &[u64]) -> Vec<RangeInclusive<u64>> {
    sorted
        .windows(2)
        .filter(|w| w[1] > w[0] + 1)
        .map(|w| (w[0] + 1)..=(w[1] - 1))
        .collect()
}

fn describe_range(r: &RangeInclusive<u64>) -> String {
    if r.start() == r.end() {
        format!("{:06}", r.start())
    } else {
        format!("{:06}..={:06}", r.start(), r.end())
    }
}
