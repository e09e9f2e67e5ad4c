//! Direct peer link over a punched socket
//!
//! Text and files travel as [`PeerFrame`]s. The send side lives in
//! [`PeerLink`]; a receiver thread reads the other half of the stream,
//! reassembles files into the download directory and reports what arrived.

use std::fs;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use punch_core::{read_peer_frame, write_peer_frame, FileChunks, PeerFrame};

/// Something that arrived over a peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    File { name: String, path: PathBuf, size: u64 },
    /// A transfer was abandoned because its frames were inconsistent
    TransferFailed(String),
    Closed,
}

// ============================================================================
// Peer Link
// ============================================================================

pub struct PeerLink {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl PeerLink {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self { stream, peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        write_peer_frame(&mut self.stream, &PeerFrame::Text(text.to_string()))
    }

    /// Send the file at `path` in chunks; returns the byte count
    pub fn send_file(&mut self, path: &Path) -> io::Result<u64> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?;
        let data = fs::read(path)?;
        let file = FileChunks::new(name, data);

        log::info!(
            "Sending {} ({} bytes, {} chunks) to {}",
            file.name(),
            file.size(),
            file.chunk_count(),
            self.peer_addr
        );
        for frame in file.frames() {
            write_peer_frame(&mut self.stream, &frame)?;
        }
        Ok(file.size())
    }

    /// Read the next frame directly; `None` once the peer closed
    ///
    /// Not for use once a receiver thread owns the read side.
    pub fn recv_frame(&mut self) -> io::Result<Option<PeerFrame>> {
        read_peer_frame(&mut self.stream)
    }

    /// Start a thread that reads frames and forwards them through `map`
    pub fn spawn_receiver<E, F>(
        &self,
        download_dir: PathBuf,
        events: Sender<E>,
        map: F,
    ) -> io::Result<JoinHandle<()>>
    where
        E: Send + 'static,
        F: Fn(LinkEvent) -> E + Send + 'static,
    {
        let reader = self.stream.try_clone()?;
        let peer_addr = self.peer_addr;
        thread::Builder::new()
            .name(format!("link-rx-{}", peer_addr))
            .spawn(move || {
                receive_loop(reader, &download_dir, |event| {
                    let _ = events.send(map(event));
                });
                log::info!("Peer link {} closed", peer_addr);
            })
    }

    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("Shutdown of link {} failed: {}", self.peer_addr, e);
            }
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

/// A file being reassembled
struct Incoming {
    name: String,
    size: u64,
    chunks: u32,
    next: u32,
    data: Vec<u8>,
}

/// Read frames until the stream ends, reporting each completed item
pub fn receive_loop<R, F>(mut reader: R, download_dir: &Path, mut emit: F)
where
    R: io::Read,
    F: FnMut(LinkEvent),
{
    let mut incoming: Option<Incoming> = None;

    loop {
        let frame = match read_peer_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::debug!("Peer link read error: {}", e);
                break;
            }
        };

        match frame {
            PeerFrame::Text(text) => emit(LinkEvent::Text(text)),

            PeerFrame::FileStart { name, size, chunks } => {
                if let Some(previous) = incoming.take() {
                    log::warn!("Transfer of {} interrupted by a new file", previous.name);
                    emit(LinkEvent::TransferFailed(previous.name));
                }
                log::debug!("Receiving {} ({} bytes, {} chunks)", name, size, chunks);
                incoming = Some(Incoming {
                    name,
                    size,
                    chunks,
                    next: 0,
                    data: Vec::new(),
                });
            }

            PeerFrame::Chunk { index, data } => match incoming.take() {
                Some(file) if file.data.len() as u64 + data.len() as u64 > file.size => {
                    log::warn!(
                        "Chunk {} overruns {} ({} of {} bytes already received)",
                        index,
                        file.name,
                        file.data.len(),
                        file.size
                    );
                    emit(LinkEvent::TransferFailed(file.name));
                }
                Some(mut file) if index == file.next && index < file.chunks => {
                    file.data.extend_from_slice(&data);
                    file.next += 1;
                    incoming = Some(file);
                }
                Some(file) => {
                    log::warn!(
                        "Chunk {} out of order for {} (expected {})",
                        index,
                        file.name,
                        file.next
                    );
                    emit(LinkEvent::TransferFailed(file.name));
                }
                None => log::warn!("Chunk {} without a file in progress", index),
            },

            PeerFrame::FileEnd => match incoming.take() {
                Some(file) => emit(finish_file(file, download_dir)),
                None => log::warn!("File end without a file in progress"),
            },
        }
    }

    if let Some(file) = incoming {
        emit(LinkEvent::TransferFailed(file.name));
    }
    emit(LinkEvent::Closed);
}

fn finish_file(file: Incoming, download_dir: &Path) -> LinkEvent {
    if file.next != file.chunks || file.data.len() as u64 != file.size {
        log::warn!(
            "Incomplete transfer of {}: {} of {} bytes",
            file.name,
            file.data.len(),
            file.size
        );
        return LinkEvent::TransferFailed(file.name);
    }

    let path = download_dir.join(safe_file_name(&file.name));
    let saved = fs::create_dir_all(download_dir).and_then(|_| fs::write(&path, &file.data));
    match saved {
        Ok(()) => {
            log::info!("Saved {} ({} bytes)", path.display(), file.size);
            LinkEvent::File {
                name: file.name,
                path,
                size: file.size,
            }
        }
        Err(e) => {
            log::warn!("Cannot save {}: {}", path.display(), e);
            LinkEvent::TransferFailed(file.name)
        }
    }
}

/// Strip any directory components a sender put in the name
fn safe_file_name(name: &str) -> PathBuf {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use punch_core::transfer::CHUNK_SIZE;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peer-client-link-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn encode(frames: &[PeerFrame]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for frame in frames {
            write_peer_frame(&mut buf, frame).unwrap();
        }
        Cursor::new(buf)
    }

    fn collect(frames: &[PeerFrame], dir: &Path) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        receive_loop(encode(frames), dir, |e| events.push(e));
        events
    }

    #[test]
    fn test_text_then_closed() {
        let dir = temp_dir("text");
        let events = collect(&[PeerFrame::Text("hi".into())], &dir);
        assert_eq!(events, vec![LinkEvent::Text("hi".into()), LinkEvent::Closed]);
    }

    #[test]
    fn test_file_reassembled_into_download_dir() {
        let dir = temp_dir("file");
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 7).map(|i| (i % 251) as u8).collect();
        let file = FileChunks::new("../notes.bin", data.clone());
        let frames: Vec<_> = file.frames().collect();

        let events = collect(&frames, &dir);

        let expected_path = dir.join("notes.bin");
        assert_eq!(
            events[0],
            LinkEvent::File {
                name: "../notes.bin".into(),
                path: expected_path.clone(),
                size: data.len() as u64,
            }
        );
        assert_eq!(fs::read(&expected_path).unwrap(), data);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_out_of_order_chunk_fails_transfer() {
        let dir = temp_dir("order");
        let frames = [
            PeerFrame::FileStart {
                name: "a.txt".into(),
                size: 4,
                chunks: 2,
            },
            PeerFrame::Chunk {
                index: 1,
                data: b"cd".to_vec(),
            },
            PeerFrame::FileEnd,
        ];

        let events = collect(&frames, &dir);
        assert_eq!(
            events,
            vec![LinkEvent::TransferFailed("a.txt".into()), LinkEvent::Closed]
        );
        assert!(!dir.join("a.txt").exists());
    }

    #[test]
    fn test_chunk_larger_than_announced_size_fails_transfer() {
        let dir = temp_dir("overrun");
        let frames = [
            PeerFrame::FileStart {
                name: "small.txt".into(),
                size: 4,
                chunks: 1,
            },
            PeerFrame::Chunk {
                index: 0,
                data: vec![0xAB; 4096],
            },
            PeerFrame::FileEnd,
        ];

        let events = collect(&frames, &dir);
        assert_eq!(
            events,
            vec![LinkEvent::TransferFailed("small.txt".into()), LinkEvent::Closed]
        );
        assert!(!dir.join("small.txt").exists());
    }

    #[test]
    fn test_truncated_transfer_reported_on_close() {
        let dir = temp_dir("truncated");
        let frames = [PeerFrame::FileStart {
            name: "big.iso".into(),
            size: 100,
            chunks: 1,
        }];

        let events = collect(&frames, &dir);
        assert_eq!(
            events,
            vec![LinkEvent::TransferFailed("big.iso".into()), LinkEvent::Closed]
        );
    }

    #[test]
    fn test_link_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (accepted, _) = listener.accept().unwrap();

        let mut sender = PeerLink::new(dialer.join().unwrap()).unwrap();
        let receiver = PeerLink::new(accepted).unwrap();

        let dir = temp_dir("socket");
        let (tx, rx) = mpsc::channel();
        let handle = receiver.spawn_receiver(dir.clone(), tx, |e| e).unwrap();

        let source = dir.with_extension("src");
        fs::write(&source, b"payload").unwrap();

        sender.send_text("hello").unwrap();
        assert_eq!(sender.send_file(&source).unwrap(), 7);
        drop(sender);

        let events: Vec<_> = rx.iter().collect();
        handle.join().unwrap();

        assert_eq!(events[0], LinkEvent::Text("hello".into()));
        assert!(matches!(&events[1], LinkEvent::File { size: 7, .. }));
        assert_eq!(events[2], LinkEvent::Closed);

        fs::remove_file(&source).unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }
}
