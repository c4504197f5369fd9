//! Chunked signature scan over a [`ByteSource`].
//!
//! The source is read front to back in fixed-size chunks. The last
//! `max_signature_len - 1` bytes of every window are carried into the next
//! one, so a marker split across a chunk boundary is still found, and
//! found exactly once.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::{ScanError, SourceError};
use crate::signatures::SignatureSet;
use crate::source::{ByteSource, SourceStream, read_full};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Lazy iterator over the ascending offsets where a signature starts.
///
/// The iterator is single-pass: it owns the stream it reads from. The
/// first error ends the iteration.
pub struct OffsetScanner<'a> {
    stream: SourceStream<'a>,
    source_name: String,
    signatures: &'a SignatureSet,
    chunk_size: usize,
    window: Vec<u8>,
    window_start: u64,
    pending: VecDeque<u64>,
    cancel: Option<CancelToken>,
    bytes_read: u64,
    found: usize,
    finished: bool,
}

impl<'a> OffsetScanner<'a> {
    pub fn new<S: ByteSource + ?Sized>(
        source: &'a S,
        signatures: &'a SignatureSet,
        chunk_size: usize,
    ) -> Result<Self, ScanError> {
        let stream = source.open_at(0)?;
        let chunk_size = chunk_size.max(1);

        Ok(Self {
            stream,
            source_name: source.name().to_string(),
            signatures,
            chunk_size,
            window: Vec::with_capacity(chunk_size + signatures.carry_len()),
            window_start: 0,
            pending: VecDeque::new(),
            cancel: None,
            bytes_read: 0,
            found: 0,
            finished: false,
        })
    }

    /// Stops the scan before the next chunk read once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bytes consumed from the source so far.
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn scan_next_chunk(&mut self) -> Result<(), ScanError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ScanError::Cancelled);
        }

        let carry = self.window.len();
        self.window.resize(carry + self.chunk_size, 0);
        let n = read_full(&mut self.stream, &mut self.window[carry..]).map_err(|source| {
            SourceError::Read {
                name: self.source_name.clone(),
                offset: self.bytes_read,
                source,
            }
        })?;
        self.window.truncate(carry + n);
        self.bytes_read += n as u64;

        if n < self.chunk_size {
            self.finished = true;
        }

        // A hit lying wholly inside the carried bytes was reported with
        // the previous window.
        for hit in self.signatures.find_iter(&self.window) {
            if hit.end <= carry {
                continue;
            }
            let offset = self.window_start + hit.start as u64;
            debug!(
                "Found {} at offset {} in {}",
                self.signatures.signatures()[hit.signature],
                offset,
                self.source_name
            );
            self.pending.push_back(offset);
            self.found += 1;
        }

        let keep = self.signatures.carry_len().min(self.window.len());
        let consumed = self.window.len() - keep;
        self.window.drain(..consumed);
        self.window_start += consumed as u64;

        trace!(
            "Scanned {} bytes of {} ({} hits)",
            self.bytes_read, self.source_name, self.found
        );

        if self.finished {
            debug!(
                "Scan of {} complete: {} bytes, {} signatures",
                self.source_name, self.bytes_read, self.found
            );
        }

        Ok(())
    }
}

impl Iterator for OffsetScanner<'_> {
    type Item = Result<u64, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(offset) = self.pending.pop_front() {
                return Some(Ok(offset));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.scan_next_chunk() {
                self.finished = true;
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }
}

impl std::iter::FusedIterator for OffsetScanner<'_> {}

/// Scans the whole source and collects every signature offset.
pub fn scan_offsets<S: ByteSource + ?Sized>(
    source: &S,
    signatures: &SignatureSet,
    chunk_size: usize,
) -> Result<Vec<u64>, ScanError> {
    OffsetScanner::new(source, signatures, chunk_size)?.collect()
}
