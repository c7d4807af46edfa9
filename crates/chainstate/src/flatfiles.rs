//! Append-only numbered block and undo files with magic-framed records.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use emberd_consensus::Hash256;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::hash::sha256d;

/// Block files grow in 16 MiB steps.
pub const BLOCKFILE_CHUNK_SIZE: u64 = 0x100_0000;
/// Undo files grow in 1 MiB steps.
pub const UNDOFILE_CHUNK_SIZE: u64 = 0x10_0000;

#[derive(Debug)]
pub enum FlatFileError {
    Io(String),
    /// Record framing did not carry the network magic; the file is damaged
    /// or the position is wrong. Requires a rebuild.
    BadMagic,
    BadLength,
    /// Undo payload does not match its recorded checksum.
    BadChecksum,
    OutOfSpace,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(message) => write!(f, "{message}"),
            FlatFileError::BadMagic => write!(f, "block file magic mismatch; rebuild required"),
            FlatFileError::BadLength => write!(f, "block file record length out of range"),
            FlatFileError::BadChecksum => write!(f, "undo data checksum mismatch"),
            FlatFileError::OutOfSpace => write!(f, "out of disk space"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err.to_string())
    }
}

/// Position of a framed record: file number and byte offset of its magic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileLocation {
    pub file: u32,
    pub pos: u64,
}

impl FileLocation {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(12);
        encoder.write_u32_le(self.file);
        encoder.write_u64_le(self.pos);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let file = decoder.read_u32_le()?;
        let pos = decoder.read_u64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { file, pos })
    }
}

/// Per-file statistics, persisted so pruning and the append cursor survive
/// restarts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    /// Logical bytes of block data (the files themselves are preallocated
    /// beyond this).
    pub size: u64,
    pub undo_size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    pub fn set_null(&mut self) {
        *self = Self::default();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(40);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u64_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            undo_size: decoder.read_u64_le()?,
            height_first: decoder.read_i32_le()?,
            height_last: decoder.read_i32_le()?,
            time_first: decoder.read_u32_le()?,
            time_last: decoder.read_u32_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(info)
    }
}

/// One family of numbered flat files (`blk*.dat` or `rev*.dat`).
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    chunk_size: u64,
}

const MAX_RECORD_SIZE: u64 = 1 << 30;

impl FlatFileStore {
    pub fn new(dir: impl AsRef<Path>, prefix: &'static str, magic: [u8; 4], chunk_size: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix,
            magic,
            chunk_size,
        }
    }

    pub fn file_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{:05}.dat", self.prefix, file))
    }

    fn open_write(&self, file: u32) -> Result<File, FlatFileError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file_path(file))?)
    }

    /// Total bytes a framed record occupies on disk.
    pub fn record_size(payload_len: u64, with_checksum: bool) -> u64 {
        8 + payload_len + if with_checksum { 32 } else { 0 }
    }

    /// Extend the file in whole chunks so appends up to `pos + add` never
    /// grow it one write at a time. Failure aborts the acceptance path.
    pub fn allocate(&self, file: u32, pos: u64, add: u64) -> Result<(), FlatFileError> {
        let old_chunks = pos.div_ceil(self.chunk_size);
        let new_chunks = (pos + add).div_ceil(self.chunk_size);
        if new_chunks <= old_chunks {
            return Ok(());
        }
        let handle = self.open_write(file)?;
        let current = handle.metadata()?.len();
        let wanted = new_chunks * self.chunk_size;
        if current < wanted {
            handle
                .set_len(wanted)
                .map_err(|_| FlatFileError::OutOfSpace)?;
        }
        Ok(())
    }

    /// Write a framed record at `loc`: magic, payload length, payload, and
    /// for undo data a trailing sha256d(block_hash || payload) checksum.
    pub fn write_record(
        &self,
        loc: FileLocation,
        payload: &[u8],
        checksum_hash: Option<&Hash256>,
    ) -> Result<(), FlatFileError> {
        let mut handle = self.open_write(loc.file)?;
        handle.seek(SeekFrom::Start(loc.pos))?;
        handle.write_all(&self.magic)?;
        handle.write_all(&(payload.len() as u32).to_le_bytes())?;
        handle.write_all(payload)?;
        if let Some(block_hash) = checksum_hash {
            handle.write_all(&record_checksum(block_hash, payload))?;
        }
        Ok(())
    }

    /// Read the record at `loc`, verifying framing and, for undo data, the
    /// trailing checksum against the owning block hash.
    pub fn read_record(
        &self,
        loc: FileLocation,
        checksum_hash: Option<&Hash256>,
    ) -> Result<Vec<u8>, FlatFileError> {
        let mut handle = File::open(self.file_path(loc.file))?;
        handle.seek(SeekFrom::Start(loc.pos))?;
        let mut frame = [0u8; 8];
        handle.read_exact(&mut frame)?;
        if frame[..4] != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as u64;
        if len == 0 || len > MAX_RECORD_SIZE {
            return Err(FlatFileError::BadLength);
        }
        let mut payload = vec![0u8; len as usize];
        handle.read_exact(&mut payload)?;
        if let Some(block_hash) = checksum_hash {
            let mut stored = [0u8; 32];
            handle.read_exact(&mut stored)?;
            if stored != record_checksum(block_hash, &payload) {
                return Err(FlatFileError::BadChecksum);
            }
        }
        Ok(payload)
    }

    /// Truncate to the logical size and fsync; `finalize` is set when the
    /// file will no longer be appended to.
    pub fn flush(&self, file: u32, logical_size: u64, finalize: bool) -> Result<(), FlatFileError> {
        let path = self.file_path(file);
        if !path.exists() {
            return Ok(());
        }
        let handle = self.open_write(file)?;
        if finalize && handle.metadata()?.len() > logical_size {
            handle.set_len(logical_size)?;
        }
        handle.sync_data()?;
        Ok(())
    }

    /// Delete a pruned file; a missing file is not an error.
    pub fn remove(&self, file: u32) -> Result<(), FlatFileError> {
        match std::fs::remove_file(self.file_path(file)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn record_checksum(block_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(block_hash);
    data.extend_from_slice(payload);
    sha256d(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "emberd-flatfiles-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn records_roundtrip_with_framing() {
        let dir = temp_dir("roundtrip");
        let store = FlatFileStore::new(&dir, "blk", [0xfa, 0xbf, 0xb5, 0xda], 4096);
        let payload = vec![0x42u8; 100];
        let loc = FileLocation { file: 0, pos: 0 };
        store.allocate(0, 0, 108).unwrap();
        store.write_record(loc, &payload, None).unwrap();
        assert_eq!(store.read_record(loc, None).unwrap(), payload);
        // Appending a second record after the first works at its offset.
        let second = FileLocation { file: 0, pos: 108 };
        store.write_record(second, &payload, None).unwrap();
        assert_eq!(store.read_record(second, None).unwrap(), payload);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wrong_magic_is_a_hard_error() {
        let dir = temp_dir("magic");
        let writer = FlatFileStore::new(&dir, "blk", [1, 2, 3, 4], 4096);
        let reader = FlatFileStore::new(&dir, "blk", [9, 9, 9, 9], 4096);
        let loc = FileLocation { file: 0, pos: 0 };
        writer.write_record(loc, b"payload", None).unwrap();
        assert!(matches!(
            reader.read_record(loc, None),
            Err(FlatFileError::BadMagic)
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn undo_checksum_binds_block_hash() {
        let dir = temp_dir("checksum");
        let store = FlatFileStore::new(&dir, "rev", [1, 2, 3, 4], 4096);
        let loc = FileLocation { file: 0, pos: 0 };
        let block_hash = [7u8; 32];
        store.write_record(loc, b"undo-bytes", Some(&block_hash)).unwrap();
        assert_eq!(
            store.read_record(loc, Some(&block_hash)).unwrap(),
            b"undo-bytes"
        );
        let other = [8u8; 32];
        assert!(matches!(
            store.read_record(loc, Some(&other)),
            Err(FlatFileError::BadChecksum)
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flush_truncates_preallocation() {
        let dir = temp_dir("truncate");
        let store = FlatFileStore::new(&dir, "blk", [1, 2, 3, 4], 1024);
        let loc = FileLocation { file: 0, pos: 0 };
        store.allocate(0, 0, 100).unwrap();
        store.write_record(loc, &[5u8; 92], None).unwrap();
        assert_eq!(store.file_path(0).metadata().unwrap().len(), 1024);
        store.flush(0, 100, true).unwrap();
        assert_eq!(store.file_path(0).metadata().unwrap().len(), 100);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
