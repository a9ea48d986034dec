//! File operation sub-protocol
//!
//! Each frame is one opcode byte followed by an optional JSON payload. Saves
//! are a `SaveBegin`, a run of `Chunk` frames (base64 of at most
//! [`CHUNK_SIZE`] raw bytes each) and a bare `SaveEnd`. Nothing is
//! acknowledged per chunk, so the sequence relies on in-order delivery of a
//! single socket.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::FrameError;

/// Largest raw slice carried by one `Chunk` frame.
pub const CHUNK_SIZE: usize = 1024;

/// Opcode byte of a file-operation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileOpcode {
    Ready = 0x0,
    ListFiles = 0x1,
    SaveBegin = 0x2,
    Chunk = 0x3,
    SaveEnd = 0x4,
    CreateFolder = 0x5,
    DeleteFile = 0x6,
    DeleteFolder = 0x7,
    Rename = 0x8,
    Error = 0x9,
    SearchDirectories = 0xA,
    ResolveSymlink = 0xB,
    MoveFiles = 0xC,
    CopyFiles = 0xD,
    Chmod = 0xE,
    Stat = 0xF,
    Checksum = 0x10,
    FolderSize = 0x11,
}

impl TryFrom<u8> for FileOpcode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        use FileOpcode::*;
        Ok(match byte {
            0x0 => Ready,
            0x1 => ListFiles,
            0x2 => SaveBegin,
            0x3 => Chunk,
            0x4 => SaveEnd,
            0x5 => CreateFolder,
            0x6 => DeleteFile,
            0x7 => DeleteFolder,
            0x8 => Rename,
            0x9 => FileOpcode::Error,
            0xA => SearchDirectories,
            0xB => ResolveSymlink,
            0xC => MoveFiles,
            0xD => CopyFiles,
            0xE => Chmod,
            0xF => Stat,
            0x10 => Checksum,
            0x11 => FolderSize,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }
}

/// A client → server file-operation frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    ListFiles { path: String },
    SaveBegin { path: String },
    Chunk { bytes: Vec<u8> },
    SaveEnd,
    CreateFolder { path: String },
    DeleteFile { path: String },
    DeleteFolder { path: String },
    Rename { path: String, new_path: String },
    SearchDirectories { search_path: String },
    ResolveSymlink { path: String },
    MoveFiles { sources: Vec<String>, destination: String },
    CopyFiles { sources: Vec<String>, destination: String },
    Chmod { path: String, mode: u32 },
    Stat { path: String },
    Checksum { path: String, algorithm: String },
    FolderSize { path: String },
}

impl FileRequest {
    pub fn opcode(&self) -> FileOpcode {
        match self {
            FileRequest::ListFiles { .. } => FileOpcode::ListFiles,
            FileRequest::SaveBegin { .. } => FileOpcode::SaveBegin,
            FileRequest::Chunk { .. } => FileOpcode::Chunk,
            FileRequest::SaveEnd => FileOpcode::SaveEnd,
            FileRequest::CreateFolder { .. } => FileOpcode::CreateFolder,
            FileRequest::DeleteFile { .. } => FileOpcode::DeleteFile,
            FileRequest::DeleteFolder { .. } => FileOpcode::DeleteFolder,
            FileRequest::Rename { .. } => FileOpcode::Rename,
            FileRequest::SearchDirectories { .. } => FileOpcode::SearchDirectories,
            FileRequest::ResolveSymlink { .. } => FileOpcode::ResolveSymlink,
            FileRequest::MoveFiles { .. } => FileOpcode::MoveFiles,
            FileRequest::CopyFiles { .. } => FileOpcode::CopyFiles,
            FileRequest::Chmod { .. } => FileOpcode::Chmod,
            FileRequest::Stat { .. } => FileOpcode::Stat,
            FileRequest::Checksum { .. } => FileOpcode::Checksum,
            FileRequest::FolderSize { .. } => FileOpcode::FolderSize,
        }
    }

    fn payload(&self) -> Option<Value> {
        match self {
            FileRequest::SaveEnd => None,
            FileRequest::ListFiles { path }
            | FileRequest::SaveBegin { path }
            | FileRequest::CreateFolder { path }
            | FileRequest::DeleteFile { path }
            | FileRequest::DeleteFolder { path }
            | FileRequest::ResolveSymlink { path }
            | FileRequest::Stat { path }
            | FileRequest::FolderSize { path } => Some(json!({ "path": path })),
            FileRequest::Chunk { bytes } => Some(json!({ "chunk": BASE64.encode(bytes) })),
            FileRequest::Rename { path, new_path } => {
                Some(json!({ "path": path, "newPath": new_path }))
            }
            FileRequest::SearchDirectories { search_path } => {
                Some(json!({ "searchPath": search_path }))
            }
            FileRequest::MoveFiles {
                sources,
                destination,
            }
            | FileRequest::CopyFiles {
                sources,
                destination,
            } => Some(json!({ "sources": sources, "destination": destination })),
            FileRequest::Chmod { path, mode } => Some(json!({ "path": path, "mode": mode })),
            FileRequest::Checksum { path, algorithm } => {
                Some(json!({ "path": path, "algorithm": algorithm }))
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode() as u8];
        if let Some(payload) = self.payload() {
            frame.extend_from_slice(payload.to_string().as_bytes());
        }
        frame
    }

    /// Full frame sequence for writing `content` to `path`.
    pub fn save_sequence(path: &str, content: &[u8]) -> Vec<FileRequest> {
        let mut frames = Vec::with_capacity(content.len().div_ceil(CHUNK_SIZE) + 2);
        frames.push(FileRequest::SaveBegin {
            path: path.to_string(),
        });
        frames.extend(content.chunks(CHUNK_SIZE).map(|slice| FileRequest::Chunk {
            bytes: slice.to_vec(),
        }));
        frames.push(FileRequest::SaveEnd);
        frames
    }

    /// Server-side decode. Used by the reassembly helper and tests.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&op, rest) = frame.split_first().ok_or(FrameError::Empty)?;
        let opcode = FileOpcode::try_from(op)?;

        if opcode == FileOpcode::SaveEnd {
            return Ok(FileRequest::SaveEnd);
        }

        let payload: Value = serde_json::from_slice(rest).map_err(|e| FrameError::Payload {
            opcode: op,
            reason: e.to_string(),
        })?;
        let bad = |reason: &str| FrameError::Payload {
            opcode: op,
            reason: reason.to_string(),
        };
        let text = |key: &str| -> Result<String, FrameError> {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| bad(&format!("missing {key}")))
        };

        Ok(match opcode {
            FileOpcode::ListFiles => FileRequest::ListFiles { path: text("path")? },
            FileOpcode::SaveBegin => FileRequest::SaveBegin { path: text("path")? },
            FileOpcode::Chunk => FileRequest::Chunk {
                bytes: BASE64
                    .decode(text("chunk")?)
                    .map_err(|e| bad(&e.to_string()))?,
            },
            FileOpcode::CreateFolder => FileRequest::CreateFolder { path: text("path")? },
            FileOpcode::DeleteFile => FileRequest::DeleteFile { path: text("path")? },
            FileOpcode::DeleteFolder => FileRequest::DeleteFolder { path: text("path")? },
            FileOpcode::Rename => FileRequest::Rename {
                path: text("path")?,
                new_path: text("newPath")?,
            },
            FileOpcode::SearchDirectories => FileRequest::SearchDirectories {
                search_path: text("searchPath")?,
            },
            FileOpcode::ResolveSymlink => FileRequest::ResolveSymlink { path: text("path")? },
            FileOpcode::MoveFiles | FileOpcode::CopyFiles => {
                #[derive(Deserialize)]
                struct Multi {
                    sources: Vec<String>,
                    destination: String,
                }
                let Multi {
                    sources,
                    destination,
                } = Multi::deserialize(&payload).map_err(|e| bad(&e.to_string()))?;
                if opcode == FileOpcode::MoveFiles {
                    FileRequest::MoveFiles {
                        sources,
                        destination,
                    }
                } else {
                    FileRequest::CopyFiles {
                        sources,
                        destination,
                    }
                }
            }
            FileOpcode::Chmod => FileRequest::Chmod {
                path: text("path")?,
                mode: payload
                    .get("mode")
                    .and_then(Value::as_u64)
                    .and_then(|m| u32::try_from(m).ok())
                    .ok_or_else(|| bad("missing mode"))?,
            },
            FileOpcode::Stat => FileRequest::Stat { path: text("path")? },
            FileOpcode::Checksum => FileRequest::Checksum {
                path: text("path")?,
                algorithm: text("algorithm")?,
            },
            FileOpcode::FolderSize => FileRequest::FolderSize { path: text("path")? },
            FileOpcode::SaveEnd => FileRequest::SaveEnd,
            FileOpcode::Ready | FileOpcode::Error => return Err(FrameError::UnknownOpcode(op)),
        })
    }
}

/// Rebuild saved files from a stream of decoded requests, in receipt order.
///
/// Mirrors what the server does with a save sequence. A `SaveBegin` while a
/// sequence is open discards the partial one.
#[derive(Debug, Default)]
pub struct SaveAssembler {
    open: Option<(String, Vec<u8>)>,
}

impl SaveAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one request; returns `(path, content)` when a save completes.
    pub fn push(&mut self, request: FileRequest) -> Option<(String, Vec<u8>)> {
        match request {
            FileRequest::SaveBegin { path } => {
                self.open = Some((path, Vec::new()));
                None
            }
            FileRequest::Chunk { bytes } => {
                if let Some((_, buf)) = self.open.as_mut() {
                    buf.extend_from_slice(&bytes);
                }
                None
            }
            FileRequest::SaveEnd => self.open.take(),
            _ => None,
        }
    }

    /// Drop a half-received sequence (the transport closed mid-save).
    pub fn abandon(&mut self) -> Option<String> {
        self.open.take().map(|(path, _)| path)
    }
}

/// A server → client file-operation frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FileReply {
    Ready,
    Listing { files: Vec<Value> },
    Ack(FileOpcode),
    Error { message: String },
    Directories(Value),
    Symlink(Value),
    Stat(Value),
    Checksum { hash: String, algorithm: String },
    FolderSize { size: u64 },
}

impl FileReply {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&op, rest) = frame.split_first().ok_or(FrameError::Empty)?;
        let opcode = FileOpcode::try_from(op)?;

        if opcode == FileOpcode::Ready {
            return Ok(FileReply::Ready);
        }
        if rest.is_empty() {
            return Ok(FileReply::Ack(opcode));
        }

        let payload: Value = serde_json::from_slice(rest).map_err(|e| FrameError::Payload {
            opcode: op,
            reason: e.to_string(),
        })?;
        let field = |key: &str| payload.get(key).cloned().unwrap_or(Value::Null);

        Ok(match opcode {
            FileOpcode::ListFiles => FileReply::Listing {
                files: match field("files") {
                    Value::Array(files) => files,
                    _ => Vec::new(),
                },
            },
            FileOpcode::Error => FileReply::Error {
                message: field("message")
                    .as_str()
                    .unwrap_or("Operation failed")
                    .to_string(),
            },
            FileOpcode::SearchDirectories => FileReply::Directories(field("directories")),
            FileOpcode::ResolveSymlink => FileReply::Symlink(payload),
            FileOpcode::Stat => FileReply::Stat(payload),
            FileOpcode::Checksum => FileReply::Checksum {
                hash: field("hash").as_str().unwrap_or_default().to_string(),
                algorithm: field("algorithm").as_str().unwrap_or_default().to_string(),
            },
            FileOpcode::FolderSize => FileReply::FolderSize {
                size: field("size").as_u64().unwrap_or(0),
            },
            other => FileReply::Ack(other),
        })
    }

    /// Frame as the server would send it. Used by test servers.
    pub fn encode(&self) -> Vec<u8> {
        let (opcode, payload) = match self {
            FileReply::Ready => (FileOpcode::Ready, None),
            FileReply::Listing { files } => (FileOpcode::ListFiles, Some(json!({ "files": files }))),
            FileReply::Ack(op) => (*op, None),
            FileReply::Error { message } => (FileOpcode::Error, Some(json!({ "message": message }))),
            FileReply::Directories(dirs) => (
                FileOpcode::SearchDirectories,
                Some(json!({ "directories": dirs })),
            ),
            FileReply::Symlink(v) => (FileOpcode::ResolveSymlink, Some(v.clone())),
            FileReply::Stat(v) => (FileOpcode::Stat, Some(v.clone())),
            FileReply::Checksum { hash, algorithm } => (
                FileOpcode::Checksum,
                Some(json!({ "hash": hash, "algorithm": algorithm })),
            ),
            FileReply::FolderSize { size } => (FileOpcode::FolderSize, Some(json!({ "size": size }))),
        };
        let mut frame = vec![opcode as u8];
        if let Some(payload) = payload {
            frame.extend_from_slice(payload.to_string().as_bytes());
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_of_3000_bytes_is_three_chunks() {
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let frames = FileRequest::save_sequence("/etc/motd", &content);

        let opcodes: Vec<u8> = frames.iter().map(|f| f.opcode() as u8).collect();
        assert_eq!(opcodes, vec![0x2, 0x3, 0x3, 0x3, 0x4]);

        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                FileRequest::Chunk { bytes } => Some(bytes.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![1024, 1024, 952]);

        let mut assembler = SaveAssembler::new();
        let mut saved = None;
        for frame in &frames {
            let decoded = FileRequest::decode(&frame.encode()).unwrap();
            if let Some(done) = assembler.push(decoded) {
                saved = Some(done);
            }
        }
        assert_eq!(saved, Some(("/etc/motd".to_string(), content)));
    }

    #[test]
    fn multibyte_text_split_mid_character_reassembles() {
        let text = "é".repeat(700); // 1400 bytes, first boundary inside a char
        let frames = FileRequest::save_sequence("/tmp/a.txt", text.as_bytes());
        let mut assembler = SaveAssembler::new();
        let saved = frames
            .into_iter()
            .filter_map(|f| assembler.push(FileRequest::decode(&f.encode()).unwrap()))
            .next()
            .unwrap();
        assert_eq!(String::from_utf8(saved.1).unwrap(), text);
    }

    #[test]
    fn empty_file_is_begin_then_end() {
        let frames = FileRequest::save_sequence("/tmp/empty", b"");
        assert_eq!(
            frames,
            vec![
                FileRequest::SaveBegin {
                    path: "/tmp/empty".into()
                },
                FileRequest::SaveEnd
            ]
        );
    }

    #[test]
    fn single_message_operations_layout() {
        assert_eq!(
            FileRequest::DeleteFile { path: "/a".into() }.encode(),
            b"\x06{\"path\":\"/a\"}".to_vec()
        );
        assert_eq!(FileRequest::DeleteFolder { path: "/d".into() }.encode()[0], 0x7);
        let rename = FileRequest::Rename {
            path: "/a".into(),
            new_path: "/b".into(),
        };
        let frame = rename.encode();
        assert_eq!(frame[0], 0x8);
        assert_eq!(FileRequest::decode(&frame).unwrap(), rename);
        assert_eq!(FileRequest::SaveEnd.encode(), vec![0x4]);
    }

    #[test]
    fn abandoned_sequence_yields_nothing() {
        let mut assembler = SaveAssembler::new();
        assembler.push(FileRequest::SaveBegin { path: "/x".into() });
        assembler.push(FileRequest::Chunk { bytes: b"half".to_vec() });
        assert_eq!(assembler.abandon(), Some("/x".to_string()));
        assert_eq!(assembler.push(FileRequest::SaveEnd), None);
    }

    #[test]
    fn replies_decode() {
        assert_eq!(FileReply::decode(&[0x0]).unwrap(), FileReply::Ready);
        assert_eq!(
            FileReply::decode(&[0x6]).unwrap(),
            FileReply::Ack(FileOpcode::DeleteFile)
        );
        assert_eq!(
            FileReply::decode(b"\x09{\"message\":\"Invalid path\"}").unwrap(),
            FileReply::Error {
                message: "Invalid path".into()
            }
        );
        let listing = FileReply::decode(b"\x01{\"files\":[{\"name\":\"a\"}]}").unwrap();
        assert!(matches!(listing, FileReply::Listing { ref files } if files.len() == 1));
        assert_eq!(FileReply::decode(&[0x42]), Err(FrameError::UnknownOpcode(0x42)));
        assert_eq!(FileReply::decode(&[]), Err(FrameError::Empty));
    }
}
