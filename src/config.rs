//! Scan configuration
//!
//! Loaded from JSON, e.g.
//!
//! ```json
//! { "chunk_size": 4096, "signatures": ["FFD8FFE0", "FFD8FFE1"] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scanner::DEFAULT_CHUNK_SIZE;
use crate::signatures::{Signature, SignatureSet, jpeg_signatures};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Bytes read from the source per scan step
    pub chunk_size: usize,
    /// Start-of-image markers, highest priority first
    pub signatures: Vec<Signature>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            signatures: jpeg_signatures(),
        }
    }
}

impl ScanConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Replaces the signature set
    pub fn with_signatures(mut self, signatures: Vec<Signature>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.signatures.is_empty() {
            return Err(ConfigError::NoSignatures);
        }
        for (index, sig) in self.signatures.iter().enumerate() {
            if sig.is_empty() {
                return Err(ConfigError::EmptySignature { index });
            }
            if sig.len() > self.chunk_size {
                return Err(ConfigError::SignatureTooLong {
                    index,
                    len: sig.len(),
                    chunk_size: self.chunk_size,
                });
            }
        }
        Ok(())
    }

    /// Validates the config and compiles its signatures.
    pub fn signature_set(&self) -> Result<SignatureSet, ConfigError> {
        self.validate()?;
        SignatureSet::new(self.signatures.clone())
    }
}
