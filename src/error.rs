use strum::AsRefStr;
use thiserror::Error;

/// Coarse classification of linker failures, used by callers deciding
/// whether a failure is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ErrorKind {
    Format,
    Io,
    Resolve,
    Patcher,
    Integrity,
    Logic,
}

#[derive(Debug, Error)]
pub enum LinkerError {
    #[error("{filename}: bad package file tag {tag:#010x}")]
    BinaryFormat { filename: String, tag: u32 },
    #[error("{filename}: package file version {version} is older than the minimum supported {min}")]
    OldVersionFile { filename: String, version: i32, min: i32 },
    #[error("{filename}: package was saved with a newer version ({version}/{licensee}) than supported ({engine}/{engine_licensee})")]
    FileVersionDump {
        filename: String,
        version: i32,
        licensee: i32,
        engine: i32,
        engine_licensee: i32,
    },
    #[error("{filename}: summary field {field} out of bounds ({value})")]
    SummaryOutOfBounds { filename: String, field: &'static str, value: i64 },
    #[error("{filename}: serial size mismatch for {object}: got {actual}, expected {expected}")]
    SerialSizeMismatch { filename: String, object: String, actual: i64, expected: i64 },
    #[error("bad name index {index} (name map has {count} entries)")]
    BadNameIndex { index: i32, count: usize },
    #[error("{filename}: bad package index {index}")]
    BadPackageIndex { filename: String, index: i32 },
    #[error("{filename}: serial range of '{export}' ({offset}, {size} bytes) lies outside the file")]
    BadSerialRange { filename: String, export: String, offset: i32, size: i32 },
    #[error("{filename}: '{object}' is reachable from its own outer, class or archetype")]
    CircularReference { filename: String, object: String },
    #[error("unsupported compression flags {0:#x}")]
    UnsupportedCompression(u32),

    #[error("failed to open {0}")]
    OpenFailed(String),

    #[error("{filename}: failed to load import '{import}' ({class})")]
    FailedImport { filename: String, import: String, class: String },
    #[error("{filename}: can't import private object '{import}'")]
    FailedImportPrivate { filename: String, import: String },
    #[error("failed to find object '{class} {path}'")]
    FailedCreate { class: String, path: String },
    #[error("{filename}: missing class for export '{export}'")]
    MissingClass { filename: String, export: String },
    #[error("{filename}: export '{export}' is its own archetype")]
    CircularArchetype { filename: String, export: String },

    #[error("{package}: patched import '{import}' duplicates an existing import")]
    PatchDuplicateImport { package: String, import: String },
    #[error("{package}: patched export '{export}' duplicates an existing export")]
    PatchDuplicateExport { package: String, export: String },

    #[error("{filename}: SHA1 mismatch (expected {expected}, got {actual})")]
    HashMismatch { filename: String, expected: String, actual: String },

    #[error("a linker for package '{0}' already exists")]
    LinkerExists(String),
    #[error("{filename}: detaching '{object}' which is linked to a different linker")]
    DetachMislinked { filename: String, object: String },
    #[error("{filename}: detaching '{object}' whose linker index is {actual}, expected {expected}")]
    DetachMisindexed { filename: String, object: String, actual: usize, expected: usize },
    #[error("load cancelled")]
    Cancelled,
    #[error("stale object reference")]
    StaleObject,
}

impl LinkerError {
    pub fn kind(&self) -> ErrorKind {
        use LinkerError::*;
        match self {
            BinaryFormat { .. }
            | OldVersionFile { .. }
            | FileVersionDump { .. }
            | SummaryOutOfBounds { .. }
            | SerialSizeMismatch { .. }
            | BadNameIndex { .. }
            | BadPackageIndex { .. }
            | BadSerialRange { .. }
            | CircularReference { .. }
            | UnsupportedCompression(_) => ErrorKind::Format,
            OpenFailed(_) => ErrorKind::Io,
            FailedImport { .. }
            | FailedImportPrivate { .. }
            | FailedCreate { .. }
            | MissingClass { .. }
            | CircularArchetype { .. } => ErrorKind::Resolve,
            PatchDuplicateImport { .. } | PatchDuplicateExport { .. } => ErrorKind::Patcher,
            HashMismatch { .. } => ErrorKind::Integrity,
            LinkerExists(_)
            | DetachMislinked { .. }
            | DetachMisindexed { .. }
            | Cancelled
            | StaleObject => ErrorKind::Logic,
        }
    }
}

/// Classify an error produced anywhere in the crate.
///
/// Errors that carry no [`LinkerError`] are I/O failures if any cause in
/// the chain is a [`std::io::Error`], otherwise logic errors.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<LinkerError>() {
            return e.kind();
        }
    }
    if err.chain().any(|c| c.is::<std::io::Error>()) {
        ErrorKind::Io
    } else {
        ErrorKind::Logic
    }
}
