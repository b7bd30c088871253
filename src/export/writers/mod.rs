//! Output files for queued exports
//!
//! An export file is created exclusively (never overwritten) and is either
//! plain CSV or gzip-compressed CSV.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::{ExportError, Result};

const BUFFER_CAPACITY: usize = 256 * 1024;

/// Writer over a freshly created export file
pub enum OutputWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl OutputWriter {
    /// Create the output file, failing if it already exists
    ///
    /// # Arguments
    /// * `path` - Target file path
    /// * `compressed` - Wrap the file in a gzip encoder
    pub fn create(path: &Path, compressed: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    ExportError::OutputExists(path.display().to_string())
                }
                _ => ExportError::Io(e),
            })?;
        let buffered = BufWriter::with_capacity(BUFFER_CAPACITY, file);

        debug!("Created output file {} (gzip: {})", path.display(), compressed);

        Ok(if compressed {
            OutputWriter::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            OutputWriter::Plain(buffered)
        })
    }

    /// Write trailers, flush and close the file
    pub fn finish(self) -> io::Result<()> {
        let mut buffered = match self {
            OutputWriter::Plain(w) => w,
            OutputWriter::Gzip(encoder) => encoder.finish()?,
        };
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputWriter::Plain(w) => w.write(buf),
            OutputWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(w) => w.flush(),
            OutputWriter::Gzip(w) => w.flush(),
        }
    }
}

/// Make sure the output directory exists
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        ExportError::Io(io::Error::new(
            e.kind(),
            format!("cannot create output directory {}: {}", dir.display(), e),
        ))
    })
}
