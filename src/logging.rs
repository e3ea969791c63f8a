//! Consumers of child process output.
//!
//! Each managed process owns one `Bus` per output channel and the bus owns
//! its handlers. Handlers of different kinds live in the same container, so
//! the `LogHandler` enum carries the runtime difference between them.
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

pub type Log<'a> = &'a [u8];

pub trait Logger {
    fn log(&mut self, log: Log) -> io::Result<()>;

    /// Re-create the underlying handle. A no-op for handlers without one.
    fn reopen(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileLogHandler {
    path: PathBuf,
    file: File,
    written: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .inspect_err(|e| log::error!("failed to open log file {}: {e}", path.display()))
}

impl FileLogHandler {
    pub fn new<T>(path: T) -> io::Result<Self>
    where
        T: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end offset of the log, as seen by this handler.
    pub fn offset(&self) -> u64 {
        self.written
    }
}

impl Logger for FileLogHandler {
    fn log(&mut self, log: Log) -> io::Result<()> {
        self.file.write_all(log)?;
        self.written += log.len() as u64;
        Ok(())
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.file = open_append(&self.path)?;
        self.written = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(())
    }
}

#[derive(Debug)]
pub enum LogHandler {
    File(FileLogHandler),
}

impl Logger for LogHandler {
    fn log(&mut self, log: Log) -> io::Result<()> {
        match self {
            Self::File(x) => x.log(log),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        match self {
            Self::File(x) => x.reopen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_handler_appends_and_tracks_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, b"old\n").unwrap();

        let mut handler = FileLogHandler::new(&path).unwrap();
        assert_eq!(handler.offset(), 4);
        handler.log(b"new\n").unwrap();
        assert_eq!(handler.offset(), 8);
        assert_eq!(fs::read(&path).unwrap(), b"old\nnew\n");
    }

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut handler = LogHandler::File(FileLogHandler::new(&path).unwrap());
        handler.log(b"before\n").unwrap();

        fs::rename(&path, dir.path().join("out.log.1")).unwrap();
        handler.reopen().unwrap();
        handler.log(b"after\n").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"after\n");
        assert_eq!(fs::read(dir.path().join("out.log.1")).unwrap(), b"before\n");
    }
}
