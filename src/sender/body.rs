use bytes::Bytes;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::{self, Write};

/// Size of the chunks handed to the HTTP body stream.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Most uncompressed input the compressor is assumed to hold back.
pub const COMPRESSOR_HEADROOM: u64 = 2 * CHUNK_SIZE as u64;

/// Request body under construction, optionally zlib-compressed.
///
/// Output accumulates in memory until at least one full chunk is ready.
pub enum BodyWriter {
    Deflate {
        encoder: ZlibEncoder<Vec<u8>>,
        /// `total_in` at the last sync flush.
        flushed_in: u64,
    },
    Identity(Vec<u8>),
}

impl BodyWriter {
    pub fn new(compress: bool) -> Self {
        if compress {
            BodyWriter::Deflate {
                encoder: ZlibEncoder::new(Vec::with_capacity(CHUNK_SIZE), Compression::fast()),
                flushed_in: 0,
            }
        } else {
            BodyWriter::Identity(Vec::with_capacity(CHUNK_SIZE))
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, BodyWriter::Deflate { .. })
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BodyWriter::Deflate { encoder, .. } => encoder.write_all(data),
            BodyWriter::Identity(buffer) => {
                buffer.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Output bytes produced but not yet handed out.
    pub fn buffered_len(&self) -> usize {
        self.output().len()
    }

    /// Input written since the last sync flush that may not have produced
    /// output yet, capped at [`COMPRESSOR_HEADROOM`]. Always 0 uncompressed.
    pub fn pending_input(&self) -> u64 {
        match self {
            BodyWriter::Deflate {
                encoder,
                flushed_in,
            } => (encoder.total_in() - flushed_in).min(COMPRESSOR_HEADROOM),
            BodyWriter::Identity(_) => 0,
        }
    }

    /// Splits off every complete chunk currently buffered.
    pub fn take_chunks(&mut self) -> Vec<Bytes> {
        let output = self.output_mut();
        if output.len() < CHUNK_SIZE {
            return Vec::new();
        }
        let mut chunks = Vec::with_capacity(output.len() / CHUNK_SIZE);
        let complete = output.len() - output.len() % CHUNK_SIZE;
        let rest = output.split_off(complete);
        let full = std::mem::replace(output, rest);
        for chunk in full.chunks(CHUNK_SIZE) {
            chunks.push(Bytes::copy_from_slice(chunk));
        }
        chunks
    }

    /// Pushes everything written so far through the compressor and takes
    /// the whole buffered output, even if it is shorter than a chunk.
    pub fn flush(&mut self) -> io::Result<Bytes> {
        if let BodyWriter::Deflate {
            encoder,
            flushed_in,
        } = self
        {
            encoder.flush()?;
            *flushed_in = encoder.total_in();
        }
        Ok(Bytes::from(std::mem::take(self.output_mut())))
    }

    /// Terminates the stream and returns the remaining output.
    pub fn finish(self) -> io::Result<Bytes> {
        let output = match self {
            BodyWriter::Deflate { encoder, .. } => encoder.finish()?,
            BodyWriter::Identity(buffer) => buffer,
        };
        Ok(Bytes::from(output))
    }

    fn output(&self) -> &Vec<u8> {
        match self {
            BodyWriter::Deflate { encoder, .. } => encoder.get_ref(),
            BodyWriter::Identity(buffer) => buffer,
        }
    }

    fn output_mut(&mut self) -> &mut Vec<u8> {
        match self {
            BodyWriter::Deflate { encoder, .. } => encoder.get_mut(),
            BodyWriter::Identity(buffer) => buffer,
        }
    }
}
