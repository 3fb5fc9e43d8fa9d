//! Append-only record of the frames a lobby harvested

use relay_protocol::{Frame, LobbyId};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One file per lobby lifetime, one line per frame: `<tick> <frame>`
pub struct SessionLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl SessionLog {
    pub fn create(dir: &Path, lobby_id: LobbyId) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let path = dir.join(format!("lobby-{}-{}.log", lobby_id, started));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn record(&mut self, tick: u64, frame: &Frame) -> io::Result<()> {
        writeln!(self.writer, "{} {}", tick, frame)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
