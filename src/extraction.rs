use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ExtractError, SourceError};
use crate::source::{ByteSource, read_full};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Splits a container into standalone JPEG files, one per sub-image.
///
/// Sub-image `i` spans `offsets[i]..offsets[i + 1]`; the last one runs to
/// the end of the source. Files are named `{stem}{i}.jpg`.
pub fn extract_sub_images<S: ByteSource + ?Sized>(
    source: &S,
    offsets: &[u64],
    output_dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>, ExtractError> {
    if let Some(index) = offsets.windows(2).position(|w| w[0] >= w[1]) {
        return Err(ExtractError::UnorderedOffsets { index: index + 1 });
    }

    fs::create_dir_all(output_dir).map_err(|source| ExtractError::Write {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let mut extracted = Vec::with_capacity(offsets.len());
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied();
        let path = output_dir.join(generate_filename(stem, i));
        let written = extract_range(source, start, end, &path)?;
        debug!("Wrote {} bytes to {}", written, path.display());
        extracted.push(path);
    }

    info!(
        "Extracted {} sub-images from {} into {}",
        extracted.len(),
        source.name(),
        output_dir.display()
    );
    Ok(extracted)
}

fn extract_range<S: ByteSource + ?Sized>(
    source: &S,
    start: u64,
    end: Option<u64>,
    path: &Path,
) -> Result<u64, ExtractError> {
    let write_err = |e: std::io::Error| ExtractError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    let mut stream = source.open_at(start)?;
    let mut out = BufWriter::new(File::create(path).map_err(write_err)?);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut offset = start;

    loop {
        let want = match end {
            Some(end) => ((end - offset) as usize).min(buffer.len()),
            None => buffer.len(),
        };
        if want == 0 {
            break;
        }

        let n = read_full(&mut stream, &mut buffer[..want]).map_err(|e| SourceError::Read {
            name: source.name().to_string(),
            offset,
            source: e,
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n]).map_err(write_err)?;
        offset += n as u64;
    }

    let file = out.into_inner().map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;
    Ok(offset - start)
}

pub fn generate_filename(stem: &str, index: usize) -> String {
    format!("{stem}{index}.jpg")
}
