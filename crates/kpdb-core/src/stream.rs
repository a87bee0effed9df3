//! Framed, SHA-256-verified block streams.
//!
//! The KDBX payload wraps its plaintext in consecutive frames of
//! `index(u32) || hash(32) || size(u32) || data`, terminated by a frame with
//! size zero and an all-zero hash. Gzip framing on top of this layer is
//! provided by `flate2`'s `GzDecoder`/`GzEncoder`.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

/// Default block size used when writing KDBX payloads.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads a hashed block stream, verifying the index and hash of each frame.
pub struct HashedBlockReader<R: Read> {
    src: R,
    block: Vec<u8>,
    pos: usize,
    block_index: u32,
    done: bool,
}

impl<R: Read> HashedBlockReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            block: Vec::new(),
            pos: 0,
            block_index: 0,
            done: false,
        }
    }

    fn fill_block(&mut self) -> io::Result<()> {
        let index = self.src.read_u32::<LittleEndian>()?;
        if index != self.block_index {
            return Err(bad_data("block index mismatch"));
        }
        self.block_index += 1;

        let mut hash = [0u8; 32];
        self.src.read_exact(&mut hash)?;

        let size = self.src.read_u32::<LittleEndian>()? as usize;
        if size == 0 {
            if hash != [0u8; 32] {
                return Err(bad_data("corrupt end-of-stream block"));
            }
            self.done = true;
            return Ok(());
        }

        self.block.resize(size, 0);
        self.src.read_exact(&mut self.block)?;
        self.pos = 0;

        let computed: [u8; 32] = Sha256::digest(&self.block).into();
        if computed != hash {
            return Err(bad_data("block checksum error"));
        }

        Ok(())
    }
}

impl<R: Read> Read for HashedBlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.block.len() {
            if self.done {
                return Ok(0);
            }
            self.fill_block()?;
            if self.done {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.block.len() - self.pos);
        buf[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Writes a hashed block stream, one frame per filled buffer.
///
/// `finish` must be called to emit the terminating empty frame; it is
/// written even when no payload bytes were ever produced.
pub struct HashedBlockWriter<W: Write> {
    dst: W,
    block: Vec<u8>,
    block_size: usize,
    block_index: u32,
}

impl<W: Write> HashedBlockWriter<W> {
    pub fn new(dst: W) -> Self {
        Self::with_block_size(dst, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(dst: W, block_size: usize) -> Self {
        Self {
            dst,
            block: Vec::with_capacity(block_size.min(DEFAULT_BLOCK_SIZE)),
            block_size,
            block_index: 0,
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        self.dst.write_u32::<LittleEndian>(self.block_index)?;
        self.block_index += 1;

        if self.block.is_empty() {
            self.dst.write_all(&[0u8; 32])?;
        } else {
            let hash: [u8; 32] = Sha256::digest(&self.block).into();
            self.dst.write_all(&hash)?;
        }

        self.dst.write_u32::<LittleEndian>(self.block.len() as u32)?;
        self.dst.write_all(&self.block)?;
        self.block.clear();
        Ok(())
    }

    /// Flushes any buffered payload and writes the terminating frame.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.block.is_empty() {
            self.flush_block()?;
        }
        self.flush_block()?;
        self.dst.flush()?;
        Ok(self.dst)
    }
}

impl<W: Write> Write for HashedBlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let room = self.block_size - self.block.len();
            let n = room.min(remaining.len());
            self.block.extend_from_slice(&remaining[..n]);
            remaining = &remaining[n..];

            if self.block.len() == self.block_size {
                self.flush_block()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dst.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::random_vec;
    use std::io::Cursor;

    fn write_stream(data: &[u8], block_size: usize) -> Vec<u8> {
        let mut writer = HashedBlockWriter::with_block_size(Vec::new(), block_size);
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn read_stream(framed: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = HashedBlockReader::new(Cursor::new(framed));
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn empty_stream_round_trip() {
        let framed = write_stream(&[], 128);
        // A single terminating frame: index, zero hash, zero size.
        assert_eq!(framed.len(), 40);
        assert_eq!(read_stream(&framed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn round_trip_various_block_sizes() {
        let data = random_vec(3000);
        for block_size in [1usize, 128, 1024] {
            let framed = write_stream(&data, block_size);
            assert_eq!(read_stream(&framed).unwrap(), data);
        }
    }

    #[test]
    fn round_trip_exact_block_multiple() {
        let data = random_vec(256);
        let framed = write_stream(&data, 128);
        assert_eq!(read_stream(&framed).unwrap(), data);
    }

    #[test]
    fn payload_bit_flip_is_detected() {
        let data = random_vec(500);
        let mut framed = write_stream(&data, 128);

        // Flip one bit inside the first frame's payload.
        framed[40] ^= 0x01;
        let err = read_stream(&framed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn index_mismatch_is_detected() {
        let data = random_vec(500);
        let mut framed = write_stream(&data, 128);

        // Corrupt the first frame's index.
        framed[0] ^= 0x01;
        let err = read_stream(&framed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn nonzero_hash_on_terminator_is_detected() {
        let mut framed = write_stream(&[], 128);
        framed[4] ^= 0x01;
        let err = read_stream(&framed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_stream_is_detected() {
        let data = random_vec(500);
        let framed = write_stream(&data, 128);
        let err = read_stream(&framed[..framed.len() - 30]).unwrap_err();
        assert!(
            err.kind() == io::ErrorKind::InvalidData
                || err.kind() == io::ErrorKind::UnexpectedEof
        );
    }
}
