//! Streaming ETags for denormalization writes.

use std::io;

use md5::{Digest, Md5};

/// An `io::Write` sink that accumulates an MD5 over everything written to
/// it. Serializing through this alongside the output buffer gives an ETag
/// without a second pass over the bytes.
pub struct EtagWriter {
    hash: Md5,
}

impl EtagWriter {
    pub fn new() -> Self {
        Self { hash: Md5::new() }
    }

    /// Hash a complete byte slice, for the pre-denormalization side.
    pub fn digest(bytes: &[u8]) -> String {
        let mut writer = Self::new();
        writer.hash.update(bytes);
        writer.etag()
    }

    pub fn etag(self) -> String {
        let digest = self.hash.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for EtagWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for EtagWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that tees into an output buffer and an [`EtagWriter`] at once.
pub struct TeeWriter<'a> {
    pub buffer: &'a mut Vec<u8>,
    pub etag: &'a mut EtagWriter,
}

impl io::Write for TeeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        io::Write::write_all(self.etag, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn streamed_writes_match_one_shot_digest() {
        let mut writer = EtagWriter::new();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();

        assert_eq!(writer.etag(), EtagWriter::digest(b"hello world"));
    }

    #[test]
    fn different_bytes_produce_different_etags() {
        assert_ne!(EtagWriter::digest(b"a"), EtagWriter::digest(b"b"));
    }

    #[test]
    fn tee_writer_captures_bytes_and_hash() {
        let mut buffer = Vec::new();
        let mut etag = EtagWriter::new();
        {
            let mut tee = TeeWriter {
                buffer: &mut buffer,
                etag: &mut etag,
            };
            tee.write_all(b"payload").unwrap();
        }

        assert_eq!(buffer, b"payload");
        assert_eq!(etag.etag(), EtagWriter::digest(b"payload"));
    }
}
