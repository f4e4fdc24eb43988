use crate::bus_sampler::Sample;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Bytes per sample on disk.
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<Sample>();

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Cannot open trace {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes samples as a flat run of little-endian 32-bit words.
///
/// There is no header: the file length is the sample count times
/// [`SAMPLE_WIDTH`].
pub struct TraceWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write_sample(&mut self, sample: Sample) -> Result<(), TraceError> {
        self.inner.write_u32::<LittleEndian>(sample)?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<I>(&mut self, samples: I) -> Result<u64, TraceError>
    where
        I: IntoIterator<Item = Sample>,
    {
        let before = self.written;
        for sample in samples {
            self.write_sample(sample)?;
        }
        Ok(self.written - before)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W, TraceError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Iterates a trace as `(index, sample)` pairs in capture order.
///
/// A clean end of input ends the iteration. Trailing bytes that do not make up
/// a whole sample are ignored with a warning. Any other read failure is
/// yielded once and ends the iteration.
pub struct TraceReader<R: Read> {
    inner: R,
    index: u64,
    done: bool,
}

impl TraceReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Opened trace {}", path.display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            index: 0,
            done: false,
        }
    }

    /// Read every remaining sample into memory.
    pub fn read_all(self) -> Result<Vec<Sample>, TraceError> {
        self.map(|item| item.map(|(_, sample)| sample)).collect()
    }

    fn read_word(&mut self) -> Result<Option<Sample>, TraceError> {
        let mut buf = [0u8; SAMPLE_WIDTH];
        let mut filled = 0;
        while filled < SAMPLE_WIDTH {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TraceError::Io(e)),
            }
        }
        match filled {
            0 => Ok(None),
            SAMPLE_WIDTH => Ok(Some(LittleEndian::read_u32(&buf))),
            partial => {
                log::warn!(
                    "Ignoring {} trailing bytes after sample {}",
                    partial,
                    self.index
                );
                Ok(None)
            }
        }
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<(u64, Sample), TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_word() {
            Ok(Some(sample)) => {
                let index = self.index;
                self.index += 1;
                Some(Ok((index, sample)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FailingReader {
        remaining: Vec<u8>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining.is_empty() {
                return Err(std::io::Error::other("device unplugged"));
            }
            let n = buf.len().min(self.remaining.len());
            buf[..n].copy_from_slice(&self.remaining[..n]);
            self.remaining.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn test_layout_is_little_endian_words() {
        let mut writer = TraceWriter::new(Vec::new());
        writer.write_all([0x0403_0201, 0xdead_beef]).unwrap();
        assert_eq!(writer.written(), 2);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_reader_yields_indexed_samples() {
        let bytes = vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];
        let items: Vec<(u64, Sample)> = TraceReader::new(Cursor::new(bytes))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_reader_empty_trace() {
        let reader = TraceReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_reader_ignores_partial_word() {
        let bytes = vec![7, 0, 0, 0, 1, 2];
        let samples = TraceReader::new(Cursor::new(bytes)).read_all().unwrap();
        assert_eq!(samples, vec![7]);
    }

    #[test]
    fn test_reader_reports_io_error_once() {
        let mut reader = TraceReader::new(FailingReader {
            remaining: vec![9, 0, 0, 0],
        });
        assert!(matches!(reader.next(), Some(Ok((0, 9)))));
        assert!(matches!(reader.next(), Some(Err(TraceError::Io(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = TraceReader::open(dir.path().join("missing.bin"));
        assert!(matches!(result, Err(TraceError::Open { .. })));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        let mut writer = TraceWriter::new(File::create(&path).unwrap());
        writer.write_all([0, 1, 0x8000_0000]).unwrap();
        writer.finish().unwrap();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            3 * SAMPLE_WIDTH as u64
        );
        let samples = TraceReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(samples, vec![0, 1, 0x8000_0000]);
    }
}
