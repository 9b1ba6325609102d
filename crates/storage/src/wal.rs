//! Write-Ahead Log (WAL) for durability.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON payload]\n`.
//! On recovery, replay all valid entries. Corrupt tail entries are dropped.
//!
//! The log is typed: a `Wal<T>` only appends and replays `T`.

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// An append-only write-ahead log of `T` entries.
pub struct Wal<T> {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
    _entry: PhantomData<fn(&T)>,
}

impl<T> std::fmt::Debug for Wal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("fsync", &self.fsync)
            .field("entries_written", &self.entries_written)
            .finish_non_exhaustive()
    }
}

impl<T: Serialize + DeserializeOwned> Wal<T> {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
            _entry: PhantomData,
        })
    }

    /// Append an entry to the WAL.
    pub fn append(&mut self, entry: &T) -> Result<(), WalError> {
        write_entry(&mut self.writer, entry)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        self.fsync
    }

    /// Replace the log contents with `entries` and reopen it for appending.
    ///
    /// The new log is written to a sibling temp file and renamed over the
    /// old one, so a crash leaves either the old or the new log intact.
    pub fn rewrite(&mut self, entries: &[T]) -> Result<(), WalError> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                write_entry(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entries_written = 0;
        Ok(())
    }

    /// Replay all valid entries from a WAL file.
    /// Returns the entries in order. Stops at the first corrupt entry.
    pub fn replay(path: &Path) -> Result<Vec<T>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut entry_num = 0u64;

        loop {
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // clean EOF
                Err(e) => return Err(WalError::Io(e)),
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            // A short read past the CRC means the last append was torn.
            macro_rules! read_or_break {
                ($buf:expr) => {
                    match reader.read_exact($buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            tracing::warn!(
                                path = %path.display(),
                                "WAL truncated mid-entry at entry {}; stopping replay",
                                entry_num
                            );
                            break;
                        }
                        Err(e) => return Err(WalError::Io(e)),
                    }
                };
            }

            let mut len_buf = [0u8; 4];
            read_or_break!(&mut len_buf);
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            read_or_break!(&mut payload);

            let mut nl = [0u8; 1];
            read_or_break!(&mut nl);

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let actual_crc = hasher.finalize();

            if actual_crc != expected_crc {
                tracing::warn!(
                    path = %path.display(),
                    "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
                    entry_num,
                    expected_crc,
                    actual_crc
                );
                break;
            }

            entries.push(serde_json::from_slice(&payload)?);
            entry_num += 1;
        }

        Ok(entries)
    }
}

fn write_entry<W: Write, T: Serialize>(writer: &mut W, entry: &T) -> Result<(), WalError> {
    let payload = serde_json::to_vec(entry)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    // CRC(4) + LEN(4) + PAYLOAD + \n
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(b"\n")?;
    Ok(())
}
