//! Magic-byte checks for accepted upload kinds.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use super::{IngestError, InvalidFileReason};
use crate::config::IngestConfig;

/// `%%EOF` must appear within this many trailing bytes of a PDF.
pub const PDF_EOF_WINDOW: usize = 4096;

const PDF_MAGIC: &[u8] = b"%PDF";
const PDF_EOF: &[u8] = b"%%EOF";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Accepted file kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Jpeg,
    Png,
}

impl FileKind {
    /// Kind for a file extension (with or without the leading dot,
    /// case-insensitive).
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    /// Kind for `path` judged by its extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Canonical extension, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    #[must_use]
    pub const fn is_image(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png)
    }

    fn header_ok(self, head: &[u8]) -> bool {
        match self {
            Self::Pdf => head.starts_with(PDF_MAGIC),
            Self::Jpeg => head.starts_with(JPEG_MAGIC),
            Self::Png => head.starts_with(PNG_MAGIC),
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unsupported file kind: {s}"))
    }
}

/// Per-kind size ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestLimits {
    pub pdf_max_bytes: u64,
    pub image_max_bytes: u64,
}

impl IngestLimits {
    #[must_use]
    pub const fn max_bytes(&self, kind: FileKind) -> u64 {
        match kind {
            FileKind::Pdf => self.pdf_max_bytes,
            FileKind::Jpeg | FileKind::Png => self.image_max_bytes,
        }
    }
}

impl From<&IngestConfig> for IngestLimits {
    fn from(config: &IngestConfig) -> Self {
        Self {
            pdf_max_bytes: config.pdf_max_bytes,
            image_max_bytes: config.image_max_bytes,
        }
    }
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// Check size and signature of an in-memory file.
pub fn validate(bytes: &[u8], kind: FileKind, limits: &IngestLimits) -> Result<(), IngestError> {
    check_size(bytes.len() as u64, kind, limits)?;
    let tail_start = bytes.len().saturating_sub(PDF_EOF_WINDOW);
    check_signature(kind, bytes, &bytes[tail_start..])
}

/// Check size and signature of a file on disk without reading all of it.
pub fn validate_file(path: &Path, kind: FileKind, limits: &IngestLimits) -> Result<u64, IngestError> {
    let context = || format!("inspecting {}", path.display());
    let mut file = File::open(path).map_err(|e| IngestError::io(context(), e))?;
    let size = file
        .metadata()
        .map_err(|e| IngestError::io(context(), e))?
        .len();
    check_size(size, kind, limits)?;

    let mut head = Vec::with_capacity(PNG_MAGIC.len());
    (&mut file)
        .take(PNG_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .map_err(|e| IngestError::io(context(), e))?;

    let mut tail = Vec::new();
    if kind == FileKind::Pdf {
        let window = size.min(PDF_EOF_WINDOW as u64);
        file.seek(SeekFrom::End(-(window as i64)))
            .map_err(|e| IngestError::io(context(), e))?;
        file.read_to_end(&mut tail)
            .map_err(|e| IngestError::io(context(), e))?;
    }
    check_signature(kind, &head, &tail)?;
    Ok(size)
}

fn check_size(size: u64, kind: FileKind, limits: &IngestLimits) -> Result<(), IngestError> {
    if size == 0 {
        return Err(IngestError::InvalidFile(InvalidFileReason::Empty));
    }
    let max = limits.max_bytes(kind);
    if size > max {
        return Err(IngestError::InvalidFile(InvalidFileReason::TooLarge {
            kind,
            size,
            max,
        }));
    }
    Ok(())
}

fn check_signature(kind: FileKind, head: &[u8], tail: &[u8]) -> Result<(), IngestError> {
    let ok = kind.header_ok(head)
        && (kind != FileKind::Pdf || tail.windows(PDF_EOF.len()).any(|w| w == PDF_EOF));
    if ok {
        Ok(())
    } else {
        Err(IngestError::InvalidFile(InvalidFileReason::BadSignature { kind }))
    }
}
