//! Size-capped log files.
//!
//! Generation 0 is the live `<name>.log`; generation `n` is `<name>.log.n`,
//! higher numbers being older. Wrap a [`RotatingLog`] in a `std::sync::Mutex`
//! to hand it to `tracing_subscriber::fmt::layer().with_writer(..)`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Retention limits for one log file set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Files kept, the live one included
    pub max_files: usize,
    /// Size at which the live file is rolled over
    pub max_bytes: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Append-only log that rolls into numbered generations when full.
///
/// A single write is never split across two files; a record larger than
/// `max_bytes` gets a file of its own.
pub struct RotatingLog {
    dir: PathBuf,
    stem: String,
    policy: RotationPolicy,
    live: Option<File>,
    written: u64,
}

impl RotatingLog {
    pub fn open(dir: impl Into<PathBuf>, name: &str, policy: RotationPolicy) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut log = Self {
            stem: file_stem(name),
            dir,
            policy: RotationPolicy {
                max_files: policy.max_files.max(1),
                ..policy
            },
            live: None,
            written: 0,
        };
        log.reopen()?;
        if log.written >= log.policy.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    /// Path of the live file
    pub fn path(&self) -> PathBuf {
        self.generation(0)
    }

    fn generation(&self, n: usize) -> PathBuf {
        if n == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.log.{}", self.stem, n))
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        self.written = file.metadata()?.len();
        self.live = Some(file);
        Ok(())
    }

    /// Age every generation by one, dropping the oldest, then start a new
    /// live file. With `max_files == 1` the live file simply starts over.
    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut live) = self.live.take() {
            live.flush()?;
        }

        let oldest = self.policy.max_files - 1;
        remove_if_present(&self.generation(oldest))?;
        for n in (0..oldest).rev() {
            rename_if_present(&self.generation(n), &self.generation(n + 1))?;
        }

        self.reopen()
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.policy.max_bytes {
            self.roll()?;
        }

        let live = self
            .live
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        live.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.live.as_mut() {
            Some(live) => live.flush(),
            None => Ok(()),
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Application name reduced to a safe file stem
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() {
        "quarry".to_string()
    } else {
        stem
    }
}
