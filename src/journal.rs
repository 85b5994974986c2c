//! Append-only journal of applied cluster commands.
//!
//! Every command the cluster applies is appended here before its index is
//! published. Reopening the journal replays the entries in order; a torn
//! entry at the tail (crash mid-write) is cut off and the journal continues
//! from the last complete entry.
//!
//! Layout: `SFJ\0`, a version byte, then entries of
//! `len: u32 LE | msgpack body | crc32: u32 LE`.

use crate::config::JournalConfig;
use crate::error::{Result, SubscriptionError};
use crate::types::{RaftIndex, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"SFJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Entries larger than this are treated as corruption.
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

const JOURNAL_FILE: &str = "cluster.journal";

/// One applied command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry<C> {
    pub index: RaftIndex,
    pub timestamp: Timestamp,
    pub command: C,
}

pub struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    _lock_file: File,
}

impl Journal {
    /// Open (or create) the journal and return every complete entry in it.
    pub fn open<C: DeserializeOwned>(config: &JournalConfig) -> Result<(Self, Vec<JournalEntry<C>>)> {
        if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
        } else if !config.path.exists() {
            return Err(SubscriptionError::InvalidOperation(format!(
                "journal directory {} does not exist",
                config.path.display()
            )));
        }

        let lock_file = Self::acquire_lock(&config.path)?;
        let path = config.path.join(JOURNAL_FILE);

        let entries = if path.exists() {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        info!(path = %path.display(), entries = entries.len(), "opened journal");

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
                _lock_file: lock_file,
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry and fsync it.
    pub fn append<C: Serialize>(&self, entry: &JournalEntry<C>) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        let mut writer = self.writer.lock();
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn replay<C: DeserializeOwned>(path: &Path) -> Result<Vec<JournalEntry<C>>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(SubscriptionError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(SubscriptionError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut good_len = HEADER_LEN;
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    good_len = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = good_len,
                        error = %e,
                        "truncating torn journal tail"
                    );
                    reader.get_ref().set_len(good_len)?;
                    reader.get_ref().sync_all()?;
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// `Ok(None)` at a clean end of file.
    fn read_entry<C: DeserializeOwned>(
        reader: &mut BufReader<File>,
    ) -> Result<Option<JournalEntry<C>>> {
        if Self::at_end(reader)? {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_LEN {
            return Err(SubscriptionError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(SubscriptionError::ChecksumMismatch { expected, got });
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }

    fn at_end(reader: &mut BufReader<File>) -> Result<bool> {
        let position = reader.stream_position()?;
        Ok(position == reader.get_ref().metadata()?.len())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubscriptionError::Locked)?;
        Ok(lock_file)
    }
}
