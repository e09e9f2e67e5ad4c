//! Frames exchanged over a punched peer connection
//!
//! Uses the same 4-byte length prefix as the control channel, with a
//! bincode-encoded [`PeerFrame`] as the payload:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode PeerFrame)     │
//! └─────────────┴─────────────────────────────────┘
//! ```

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::signaling::{read_frame, write_frame};

// ============================================================================
// Constants
// ============================================================================

/// Maximum peer frame size (64 KB)
pub const MAX_FRAME_SIZE: u32 = 65536;

/// Bytes of file data carried by one chunk frame
pub const CHUNK_SIZE: usize = 16 * 1024;

// ============================================================================
// Peer Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// Free-form chat text
    Text(String),
    /// A file transfer begins
    FileStart {
        name: String,
        size: u64,
        chunks: u32,
    },
    /// One slice of the current file
    Chunk { index: u32, data: Vec<u8> },
    /// The current file is complete
    FileEnd,
}

pub fn write_peer_frame<W: Write>(writer: &mut W, frame: &PeerFrame) -> io::Result<()> {
    let payload =
        bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(writer, &payload, MAX_FRAME_SIZE)
}

/// Returns `Ok(None)` when the peer closed the connection
pub fn read_peer_frame<R: Read>(reader: &mut R) -> io::Result<Option<PeerFrame>> {
    match read_frame(reader, MAX_FRAME_SIZE)? {
        Some(payload) => bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        None => Ok(None),
    }
}

// ============================================================================
// File Chunks
// ============================================================================

/// A file split into fixed-size chunks for transfer
#[derive(Debug, Clone)]
pub struct FileChunks {
    name: String,
    data: Vec<u8>,
}

impl FileChunks {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn chunk_count(&self) -> u32 {
        self.data.len().div_ceil(CHUNK_SIZE) as u32
    }

    pub fn get_chunk(&self, index: u32) -> Option<&[u8]> {
        let start = (index as usize).checked_mul(CHUNK_SIZE)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + CHUNK_SIZE).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// Every frame needed to send this file, in order
    pub fn frames(&self) -> impl Iterator<Item = PeerFrame> + '_ {
        let start = PeerFrame::FileStart {
            name: self.name.clone(),
            size: self.size(),
            chunks: self.chunk_count(),
        };
        let chunks = (0..self.chunk_count()).filter_map(move |index| {
            self.get_chunk(index).map(|data| PeerFrame::Chunk {
                index,
                data: data.to_vec(),
            })
        });
        std::iter::once(start)
            .chain(chunks)
            .chain(std::iter::once(PeerFrame::FileEnd))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_chunk_boundaries() {
        let file = FileChunks::new("notes.txt", vec![7u8; CHUNK_SIZE * 2 + 10]);

        assert_eq!(file.size(), (CHUNK_SIZE * 2 + 10) as u64);
        assert_eq!(file.chunk_count(), 3);
        assert_eq!(file.get_chunk(0).unwrap().len(), CHUNK_SIZE);
        assert_eq!(file.get_chunk(2).unwrap().len(), 10);
        assert!(file.get_chunk(3).is_none());
        assert!(file.get_chunk(u32::MAX).is_none());
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let file = FileChunks::new("empty", Vec::new());
        assert_eq!(file.chunk_count(), 0);

        let frames: Vec<_> = file.frames().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], PeerFrame::FileEnd);
    }

    #[test]
    fn test_file_frames_reassemble() {
        let data: Vec<u8> = (0..CHUNK_SIZE + 300).map(|i| (i % 251) as u8).collect();
        let file = FileChunks::new("blob.bin", data.clone());

        let mut wire = Vec::new();
        for frame in file.frames() {
            write_peer_frame(&mut wire, &frame).unwrap();
        }

        let mut cursor = Cursor::new(wire);
        let mut rebuilt = Vec::new();
        match read_peer_frame(&mut cursor).unwrap().unwrap() {
            PeerFrame::FileStart { name, size, chunks } => {
                assert_eq!(name, "blob.bin");
                assert_eq!(size, data.len() as u64);
                assert_eq!(chunks, 2);
            }
            other => panic!("Expected FileStart, got {:?}", other),
        }
        while let Some(frame) = read_peer_frame(&mut cursor).unwrap() {
            match frame {
                PeerFrame::Chunk { data, .. } => rebuilt.extend(data),
                PeerFrame::FileEnd => break,
                other => panic!("Unexpected frame {:?}", other),
            }
        }

        assert_eq!(rebuilt, data);
    }
}
