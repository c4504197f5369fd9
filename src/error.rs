use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::classifier::Eye;
use crate::pipeline::PipelineStage;

/// Failure to open, skip within, or read from a [`ByteSource`](crate::source::ByteSource).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open `{name}` at offset {offset}: {source}")]
    Open {
        name: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to skip to offset {offset} in `{name}`: {source}")]
    Skip {
        name: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("read error in `{name}` at offset {offset}: {source}")]
    Read {
        name: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("`{name}` is empty")]
    Empty { name: String },
}

impl SourceError {
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Open { offset, .. } | Self::Skip { offset, .. } | Self::Read { offset, .. } => {
                Some(*offset)
            }
            Self::Empty { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("scan cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("unsupported sub-image count: {count} (expected 2 or 4)")]
    UnsupportedSubImageCount { count: usize },
}

/// Errors reported by an [`ImageCodec`](crate::decoder::ImageCodec).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("decoded buffer does not match {width}x{height}")]
    BufferSize { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("probe of sub-image at offset {offset} in `{source_name}` failed: {cause}")]
    ProbeFailed {
        offset: u64,
        source_name: String,
        #[source]
        cause: CodecError,
    },

    #[error("decode of sub-image at offset {offset} in `{source_name}` failed: {cause}")]
    DecodeFailed {
        offset: u64,
        source_name: String,
        #[source]
        cause: CodecError,
    },

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl DecodeError {
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::ProbeFailed { offset, .. } | Self::DecodeFailed { offset, .. } => Some(*offset),
            Self::Source(e) => e.offset(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("at least one signature is required")]
    NoSignatures,

    #[error("signature #{index} is empty")]
    EmptySignature { index: usize },

    #[error("signature #{index} ({len} bytes) is longer than the chunk size {chunk_size}")]
    SignatureTooLong {
        index: usize,
        len: usize,
        chunk_size: usize,
    },

    #[error("invalid signature `{0}`: expected an even number of hex digits")]
    InvalidSignature(String),

    #[error("failed to build signature matcher: {0}")]
    Matcher(#[from] aho_corasick::BuildError),

    #[error("decode budget must be positive, got {width}x{height}")]
    InvalidBudget { width: u32, height: u32 },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("offsets are not strictly increasing at index {index}")]
    UnorderedOffsets { index: usize },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level failure of a [`ContainerPipeline`](crate::pipeline::ContainerPipeline) run.
///
/// Every variant carries enough detail to tell the stage, offset, or
/// count apart without parsing the message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source I/O failed while {stage}: {source}")]
    SourceIo {
        stage: PipelineStage,
        eye: Option<Eye>,
        #[source]
        source: SourceError,
    },

    #[error("no embedded images found in `{source_name}`")]
    NoSignaturesFound { source_name: String },

    #[error("unsupported sub-image count: {count} (expected 2 or 4)")]
    UnsupportedSubImageCount { count: usize },

    #[error("{eye} eye: probe failed at offset {offset} in `{source_name}`: {cause}")]
    ProbeFailed {
        eye: Eye,
        offset: u64,
        source_name: String,
        #[source]
        cause: CodecError,
    },

    #[error("{eye} eye: decode failed at offset {offset} in `{source_name}`: {cause}")]
    DecodeFailed {
        eye: Eye,
        offset: u64,
        source_name: String,
        #[source]
        cause: CodecError,
    },

    #[error("load cancelled while {stage}")]
    Cancelled { stage: PipelineStage },
}

impl PipelineError {
    pub(crate) fn from_scan(err: ScanError) -> Self {
        match err {
            ScanError::Source(source) => Self::SourceIo {
                stage: PipelineStage::Scanning,
                eye: None,
                source,
            },
            ScanError::Cancelled => Self::Cancelled {
                stage: PipelineStage::Scanning,
            },
        }
    }

    pub(crate) fn from_decode(eye: Eye, err: DecodeError) -> Self {
        match err {
            DecodeError::ProbeFailed {
                offset,
                source_name,
                cause,
            } => Self::ProbeFailed {
                eye,
                offset,
                source_name,
                cause,
            },
            DecodeError::DecodeFailed {
                offset,
                source_name,
                cause,
            } => Self::DecodeFailed {
                eye,
                offset,
                source_name,
                cause,
            },
            DecodeError::Source(source) => Self::SourceIo {
                stage: PipelineStage::Decoding,
                eye: Some(eye),
                source,
            },
        }
    }

    /// The stage the run was in when it failed.
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::SourceIo { stage, .. } => *stage,
            Self::NoSignaturesFound { .. } => PipelineStage::Scanning,
            Self::UnsupportedSubImageCount { .. } => PipelineStage::Classifying,
            Self::ProbeFailed { .. } | Self::DecodeFailed { .. } => PipelineStage::Decoding,
            Self::Cancelled { stage } => *stage,
        }
    }

    pub fn eye(&self) -> Option<Eye> {
        match self {
            Self::ProbeFailed { eye, .. } | Self::DecodeFailed { eye, .. } => Some(*eye),
            Self::SourceIo { eye, .. } => *eye,
            _ => None,
        }
    }
}

impl From<ClassifyError> for PipelineError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::UnsupportedSubImageCount { count } => {
                Self::UnsupportedSubImageCount { count }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
