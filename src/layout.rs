use std::fmt;
use std::path::{Path, PathBuf};

/// Labeled image streams written by the capture tool, in composite order (top to bottom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Annotation,
    Camera,
    Depth,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Annotation, StreamKind::Camera, StreamKind::Depth];

    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Annotation => "annotation",
            StreamKind::Camera => "camera",
            StreamKind::Depth => "depth",
        }
    }

    /// Filename suffix placed between the frame index and the extension.
    pub fn frame_suffix(self) -> &'static str {
        match self {
            StreamKind::Annotation => "_annotation",
            StreamKind::Camera => "",
            StreamKind::Depth => "_depth",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const FRAME_INDEX_DIGITS: usize = 6;
pub const FRAME_EXT: &str = "png";
pub const CLIP_EXT: &str = "mp4";

/// Where one map's frames live and where its videos go.
#[derive(Debug, Clone)]
pub struct MapLayout {
    pub dataset_root: PathBuf,
    pub map: String,
    pub output_dir: PathBuf,
}

impl MapLayout {
    pub fn new(dataset_root: &Path, map: &str, output_dir: &Path) -> Self {
        Self {
            dataset_root: dataset_root.to_path_buf(),
            map: map.to_string(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn map_dir(&self) -> PathBuf {
        self.dataset_root.join("images").join(&self.map)
    }

    pub fn frame_dir(&self, kind: StreamKind) -> PathBuf {
        self.map_dir().join(kind.name())
    }

    pub fn parameters_path(&self) -> PathBuf {
        self.dataset_root.join("parameters.json")
    }

    /// ffmpeg image2 pattern, e.g. `<dir>/west_coast_%06d_depth.png`.
    /// A literal `%` in the map name is doubled so image2 reads it as text.
    pub fn frame_pattern(&self, kind: StreamKind) -> PathBuf {
        self.frame_dir(kind).join(format!(
            "{}_%0{}d{}.{}",
            self.map.replace('%', "%%"),
            FRAME_INDEX_DIGITS,
            kind.frame_suffix(),
            FRAME_EXT
        ))
    }

    /// Inverse of `parse_frame_index`; builds fixture frames in tests.
    #[cfg(test)]
    pub fn frame_file_name(&self, kind: StreamKind, index: u64) -> String {
        format!(
            "{}_{:0width$}{}.{}",
            self.map,
            index,
            kind.frame_suffix(),
            FRAME_EXT,
            width = FRAME_INDEX_DIGITS
        )
    }

    /// Parses a frame filename of this map and kind back into its index.
    pub fn parse_frame_index(&self, kind: StreamKind, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(&self.map)?.strip_prefix('_')?;
        let rest = rest
            .strip_suffix(FRAME_EXT)?
            .strip_suffix('.')?
            .strip_suffix(kind.frame_suffix())?;
        if rest.len() < FRAME_INDEX_DIGITS || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    pub fn clip_path(&self, kind: StreamKind) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.{}", self.map, kind.name(), CLIP_EXT))
    }

    pub fn composite_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.{}", self.map, CLIP_EXT))
    }
}
