//! Built-in readers.

use std::fs;

use crate::registry::{ProviderInput, Reader, RegistryError, Source, SourceKind};

pub const FILE_BYTES: &str = "file-bytes";
pub const FILE_LOCATION: &str = "file-location";
pub const TEXT_BYTES: &str = "text-bytes";
pub const BYTES: &str = "bytes";

/// File contents as bytes.
pub struct FileBytesReader;

impl Reader for FileBytesReader {
    fn name(&self) -> &str {
        FILE_BYTES
    }

    fn accepts(&self) -> &[SourceKind] {
        &[SourceKind::File]
    }

    fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
        match source {
            Source::File(path) => Ok(ProviderInput::Bytes(fs::read(path)?)),
            other => Err(mismatch(self, other)),
        }
    }
}

/// The file's location, for providers that open it themselves.
pub struct FileLocationReader;

impl Reader for FileLocationReader {
    fn name(&self) -> &str {
        FILE_LOCATION
    }

    fn accepts(&self) -> &[SourceKind] {
        &[SourceKind::File]
    }

    fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
        match source {
            Source::File(path) => Ok(ProviderInput::Location(path.clone())),
            other => Err(mismatch(self, other)),
        }
    }
}

/// UTF-8 bytes of in-memory text, e.g. pasted from the clipboard.
pub struct TextBytesReader;

impl Reader for TextBytesReader {
    fn name(&self) -> &str {
        TEXT_BYTES
    }

    fn accepts(&self) -> &[SourceKind] {
        &[SourceKind::Text]
    }

    fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
        match source {
            Source::Text(text) => Ok(ProviderInput::Bytes(text.as_bytes().to_vec())),
            other => Err(mismatch(self, other)),
        }
    }
}

pub struct BytesReader;

impl Reader for BytesReader {
    fn name(&self) -> &str {
        BYTES
    }

    fn accepts(&self) -> &[SourceKind] {
        &[SourceKind::Bytes]
    }

    fn convert(&self, source: &Source) -> Result<ProviderInput, RegistryError> {
        match source {
            Source::Bytes(bytes) => Ok(ProviderInput::Bytes(bytes.clone())),
            other => Err(mismatch(self, other)),
        }
    }
}

fn mismatch(reader: &dyn Reader, source: &Source) -> RegistryError {
    RegistryError::ReaderNotFound {
        provider: reader.name().to_string(),
        kind: source.kind(),
    }
}
