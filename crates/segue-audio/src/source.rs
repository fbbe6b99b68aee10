//! Audio sources and their byte views.

use std::path::PathBuf;

use bytes::Bytes;
use segue_core::{Error, Result};
use tracing::debug;

/// Where the bytes of a track come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// File on the local file system.
    File(PathBuf),
    /// Bytes already in memory, with an optional name for diagnostics.
    Memory { data: Bytes, name: Option<String> },
}

impl AudioSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn memory(data: impl Into<Bytes>) -> Self {
        Self::Memory {
            data: data.into(),
            name: None,
        }
    }

    /// Human readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory { name: Some(name), .. } => name.clone(),
            Self::Memory { data, name: None } => format!("<{} bytes in memory>", data.len()),
        }
    }

    /// Read the source into a file view.
    pub fn open(&self) -> Result<FileView> {
        match self {
            Self::File(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    Error::StorageAccessFailure(format!("Failed to read {}: {e}", path.display()))
                })?;
                debug!("Read {} bytes from {}", data.len(), path.display());
                Ok(FileView::new(Bytes::from(data), Some(path.display().to_string())))
            }
            Self::Memory { data, name } => Ok(FileView::new(data.clone(), name.clone())),
        }
    }
}

/// Read-only view of a whole file.
#[derive(Debug, Clone)]
pub struct FileView {
    bytes: Bytes,
    name: Option<String>,
}

impl FileView {
    pub const fn new(bytes: Bytes, name: Option<String>) -> Self {
        Self { bytes, name }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub const fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Identify the container from its leading bytes.
    pub fn sniff_codec(&self) -> Option<&'static str> {
        sniff_codec(&self.bytes)
    }
}

/// Identify an audio container from its magic bytes.
pub fn sniff_codec(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WAVE".as_slice()) {
        return Some("wav");
    }
    if bytes.starts_with(b"fLaC") {
        return Some("flac");
    }
    if bytes.starts_with(b"OggS") {
        return Some("ogg");
    }
    if bytes.get(4..8) == Some(b"ftyp".as_slice()) {
        return Some("m4a");
    }
    if bytes.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        return Some("webm");
    }
    if bytes.starts_with(b"ID3") {
        return Some("mp3");
    }
    match bytes {
        [0xff, second, ..] if second & 0xe0 == 0xe0 => Some("mp3"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_sniff_known_containers() {
        assert_eq!(sniff_codec(b"RIFF\0\0\0\0WAVEfmt "), Some("wav"));
        assert_eq!(sniff_codec(b"fLaC\0\0\0\x22"), Some("flac"));
        assert_eq!(sniff_codec(b"ID3\x04\0\0"), Some("mp3"));
        assert_eq!(sniff_codec(&[0xff, 0xfb, 0x90, 0x64]), Some("mp3"));
        assert_eq!(sniff_codec(b"\0\0\0\x20ftypM4A "), Some("m4a"));
    }

    #[test]
    fn test_sniff_rejects_garbage() {
        assert_eq!(sniff_codec(b"hello world"), None);
        assert_eq!(sniff_codec(b""), None);
    }

    #[test]
    fn test_missing_file_is_storage_failure() {
        let source = AudioSource::file("/definitely/not/here.flac");
        assert!(matches!(
            source.open(),
            Err(Error::StorageAccessFailure(_))
        ));
    }

    #[test]
    fn test_memory_source_view() {
        let source = AudioSource::memory(vec![1u8, 2, 3]);
        let view = source.open().unwrap();
        assert_eq!(view.len(), 3);
        assert!(source.describe().contains("3 bytes"));
    }
}
