//! JPEG frame extraction from a continuous byte stream.
//!
//! Both the RTSP decoder pipe and HTTP multipart bodies carry their video
//! as a plain concatenation of JPEG images, optionally with part headers
//! in between. Frames are recovered by scanning for the JPEG start (FFD8)
//! and end (FFD9) markers. Entropy-coded JPEG data escapes every FF byte,
//! so a bare FFD9 always terminates the image.

use std::io::Read;

use bytes::Bytes;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Frames larger than this are assumed to be marker desync and discarded.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// Incremental JPEG frame scanner over any [`Read`] implementation.
///
/// Markers split across read boundaries are handled: unconsumed bytes stay
/// buffered between calls and the scan resumes over the joined data.
pub struct MjpegFrameReader<R> {
    reader: R,
    pending: Vec<u8>,
    max_frame_size: usize,
}

impl<R: Read> MjpegFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::with_capacity(READ_CHUNK_SIZE * 4),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    #[cfg(test)]
    fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            max_frame_size,
        }
    }

    /// Reads until a complete JPEG frame is available.
    ///
    /// Returns `Ok(None)` once the underlying reader reaches EOF. A frame
    /// that grows past the size limit is discarded and reported as an
    /// error; the scan resynchronizes on the next start marker.
    pub fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(frame) = self.extract_frame() {
                return Ok(Some(frame));
            }
            if self.pending.len() > self.max_frame_size {
                self.pending.clear();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "JPEG frame exceeds size limit, discarding buffered data",
                ));
            }
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pulls one complete frame out of the pending buffer, if present.
    fn extract_frame(&mut self) -> Option<Bytes> {
        let start = match find_marker(&self.pending, SOI) {
            Some(pos) => pos,
            None => {
                // Keep the trailing byte: it may be the first half of a
                // marker whose second half arrives with the next read.
                if self.pending.len() > 1 {
                    let tail = self.pending[self.pending.len() - 1];
                    self.pending.clear();
                    self.pending.push(tail);
                }
                return None;
            }
        };
        if start > 0 {
            self.pending.drain(..start);
        }
        // Search after the start marker so SOI's own FF is not re-matched.
        let end = find_marker(&self.pending[2..], EOI)? + 2;
        let frame = Bytes::copy_from_slice(&self.pending[..end + 2]);
        self.pending.drain(..end + 2);
        Some(frame)
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}
