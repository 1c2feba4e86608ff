//! Size-rotated append-only log files.
//!
//! The live file is `<dir>/<filename>.log`. Once it grows past
//! `max_file_size` it is renamed to `<dir>/<filename>.<id>.log` and a fresh
//! live file is opened. Ids start at 1 and wrap after `max_file_count`.
//!
//! Writers share the open handle under a read lock and track the size with an
//! atomic counter; only a rotation takes the write lock, and it re-checks the
//! size first since another writer may already have rotated.

use crate::config::DEFAULT_LOG_MAX_SIZE;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Options for a [`RotatingFile`].
#[derive(Debug, Clone)]
pub struct RotatingFileOptions {
    /// Directory holding the files
    pub dir: PathBuf,
    /// File name without the `.log` extension
    pub filename: String,
    /// Maximum size of the live file, 0 means the default of 128MB
    pub max_file_size: u64,
    /// Maximum count of rotated files, 0 means unbounded
    pub max_file_count: u64,
}

struct State {
    file: Option<File>,
    last_id: Option<u64>,
}

/// A log file rotated by size.
pub struct RotatingFile {
    opts: RotatingFileOptions,
    state: RwLock<State>,
    size: AtomicU64,
}

fn poisoned<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "rotating file: lock poisoned")
}

impl RotatingFile {
    /// Open (or create) the live file.
    pub fn open(mut opts: RotatingFileOptions) -> io::Result<Self> {
        if opts.max_file_size == 0 {
            opts.max_file_size = DEFAULT_LOG_MAX_SIZE;
        }
        let rf = Self {
            opts,
            state: RwLock::new(State {
                file: None,
                last_id: None,
            }),
            size: AtomicU64::new(0),
        };
        let file = rf.open_current()?;
        rf.state.write().map_err(poisoned)?.file = Some(file);
        Ok(rf)
    }

    pub fn current_path(&self) -> PathBuf {
        self.opts.dir.join(format!("{}.log", self.opts.filename))
    }

    pub fn rotated_path(&self, id: u64) -> PathBuf {
        self.opts.dir.join(format!("{}.{}.log", self.opts.filename, id))
    }

    /// Append `buf`, rotating afterwards if the size limit was crossed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        {
            let state = self.state.read().map_err(poisoned)?;
            let mut file = state
                .file
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "rotating file: closed"))?;
            file.write_all(buf)?;
        }

        let n = buf.len() as u64;
        if self.size.fetch_add(n, Ordering::SeqCst) + n > self.opts.max_file_size {
            self.rotate()?;
        }
        Ok(buf.len())
    }

    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        if let Some(file) = state.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn open_current(&self) -> io::Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        let len = file.metadata()?.len();
        self.size.store(len, Ordering::SeqCst);
        Ok(file)
    }

    fn rotate(&self) -> io::Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;

        if self.size.load(Ordering::SeqCst) <= self.opts.max_file_size {
            return Ok(());
        }
        if state.file.is_none() {
            return Ok(());
        }

        let id = self.next_rotated_id(state.last_id)?;
        let rotated = self.rotated_path(id);

        // the id may have wrapped onto an existing file
        let _ = fs::remove_file(&rotated);

        // on failure the current handle stays valid
        fs::rename(self.current_path(), &rotated)?;

        let file = self.open_current()?;
        state.file = Some(file);
        state.last_id = Some(id);

        debug!(file = %rotated.display(), "rotated log file");
        Ok(())
    }

    /// Index for the next rotated file.
    ///
    /// The directory is scanned only for the first rotation of this handle,
    /// later rotations continue from the cached index. With a file count
    /// limit the indexes cycle `1..=max_file_count`, so the oldest rotated
    /// file is the one overwritten.
    fn next_rotated_id(&self, last_id: Option<u64>) -> io::Result<u64> {
        let last = match last_id {
            Some(id) => id,
            None => self.highest_rotated_id()?,
        };
        let mut id = last + 1;
        if self.opts.max_file_count > 0 && id > self.opts.max_file_count {
            id = 1;
        }
        Ok(id)
    }

    fn highest_rotated_id(&self) -> io::Result<u64> {
        let prefix = format!("{}.", self.opts.filename);
        let mut highest = 0;
        for entry in fs::read_dir(&self.opts.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let id = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|id| id.parse::<u64>().ok());
            if let Some(id) = id {
                highest = highest.max(id);
            }
        }
        Ok(highest)
    }
}
