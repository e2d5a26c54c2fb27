//! Coarse file classification by extension, used to filter listings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl FileCategory {
    /// Classifies a file name by its (case-insensitive) extension.
    pub fn from_name(name: &str) -> Self {
        match extension(name).as_deref() {
            Some("jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp") => Self::Image,
            Some("mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv") => Self::Video,
            Some("mp3" | "wav" | "flac" | "aac" | "ogg" | "m4a") => Self::Audio,
            Some(
                "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "md" | "odt",
            ) => Self::Document,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for FileCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "video" | "videos" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" | "documents" | "docs" => Ok(Self::Document),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// Lowercased extension; `None` for dotfiles, trailing dots or no dot.
fn extension(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot == name.len() - 1 {
        return None;
    }
    Some(name[dot + 1..].to_ascii_lowercase())
}
