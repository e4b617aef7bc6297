// pgdumps3/src/restore/decompress.rs
use flate2::read::MultiGzDecoder;
use std::fmt;
use std::io::{self, Read, Write};

const COPY_BUFFER: usize = 64 * 1024;

/// Why feeding the restore tool stopped early.
#[derive(Debug)]
pub(crate) enum FeedError {
    /// Reading the downloaded object failed.
    Source(io::Error),
    /// The object is not a valid gzip stream.
    Decompress(io::Error),
    /// The restore tool stopped accepting input.
    Sink(io::Error),
}

/// Tags errors coming from the object body so they are not mistaken for corrupt gzip.
#[derive(Debug)]
struct SourceFailure(io::Error);

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reading object body: {}", self.0)
    }
}

impl std::error::Error for SourceFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

struct TaggedSource<R> {
    inner: R,
}

impl<R: Read> Read for TaggedSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(e.kind(), SourceFailure(e)))
    }
}

/// Decompresses `source` into `sink`, returning the number of decompressed bytes written.
///
/// Concatenated gzip members are accepted. A truncated stream or a checksum mismatch is a
/// `Decompress` error even if every byte before it was already written.
pub(crate) fn feed_decompressed<R, W>(source: R, sink: &mut W) -> Result<u64, FeedError>
where
    R: Read,
    W: Write + ?Sized,
{
    let mut decoder = MultiGzDecoder::new(TaggedSource { inner: source });
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;

    loop {
        let read = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        };
        sink.write_all(&buf[..read]).map_err(FeedError::Sink)?;
        total += read as u64;
    }

    sink.flush().map_err(FeedError::Sink)?;
    Ok(total)
}

fn classify(err: io::Error) -> FeedError {
    let from_source = err
        .get_ref()
        .is_some_and(|inner| inner.is::<SourceFailure>());
    if from_source {
        FeedError::Source(err)
    } else {
        FeedError::Decompress(err)
    }
}

#[cfg(test)]
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
