//! 输入源识别与扫描
//!
//! 按扩展名识别图片/视频, 文件夹扫描产出确定性排序的任务列表。
//! 视频帧的解码由外部采集组件负责, 核心只消费解码后的帧。

use crate::error::VisionError;
use image::DynamicImage;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const SUPPORTED_IMAGE_FORMATS: [&str; 7] =
    ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];
pub const SUPPORTED_VIDEO_FORMATS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm"];

/// 输入源类型 (历史记录中以文本存储)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Image,
    Folder,
    Video,
    Unknown,
}

impl SourceType {
    /// 按路径判断输入源类型
    pub fn of(path: &Path) -> Self {
        if path.is_dir() {
            return SourceType::Folder;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some(e) if SUPPORTED_IMAGE_FORMATS.contains(&e) => SourceType::Image,
            Some(e) if SUPPORTED_VIDEO_FORMATS.contains(&e) => SourceType::Video,
            _ => SourceType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Image => "image",
            SourceType::Folder => "folder",
            SourceType::Video => "video",
            SourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "image" => SourceType::Image,
            "folder" => SourceType::Folder,
            "video" => SourceType::Video,
            _ => SourceType::Unknown,
        })
    }
}

impl Serialize for SourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// 扫描文件夹下的所有图片, 按文件名排序保证批处理顺序确定
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>, VisionError> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && SourceType::of(&path) == SourceType::Image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// 解码一帧输入图片, 损坏文件映射为 `InvalidFrame`
pub fn load_frame(path: &Path) -> Result<DynamicImage, VisionError> {
    image::open(path).map_err(|source| VisionError::InvalidFrame {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_by_extension() {
        assert_eq!(SourceType::of(Path::new("a.JPG")), SourceType::Image);
        assert_eq!(SourceType::of(Path::new("b.mp4")), SourceType::Video);
        assert_eq!(SourceType::of(Path::new("c.txt")), SourceType::Unknown);
    }

    #[test]
    fn test_collect_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let images = collect_images(dir.path()).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
    }

    #[test]
    fn test_load_frame_invalid_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("broken.jpg");
        std::fs::write(&p, b"not an image").unwrap();
        assert!(matches!(
            load_frame(&p),
            Err(VisionError::InvalidFrame { .. })
        ));
    }
}
