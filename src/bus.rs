//! Bus protocol for connecting log handlers to child output.
//!
//! The Bus has an internal bytes buffer which it uses to batch writes to its
//! handlers. Ownership-wise, the Bus owns the handlers but not the pipe that
//! feeds it: the subprocess drains its pipes and throws the bytes in here.
use crate::logging::{LogHandler, Logger};
use std::io;
use std::path::Path;

#[derive(Debug)]
pub struct Bus {
    buffer: Box<[u8]>,
    curr_len: usize,
    handlers: Vec<LogHandler>,
}

impl Bus {
    pub fn new(bufsize: usize) -> Self {
        Self {
            buffer: vec![0; bufsize].into_boxed_slice(),
            curr_len: 0,
            handlers: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: LogHandler) {
        self.handlers.push(handler)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if self.curr_len == 0 {
            return Ok(());
        }

        for handler in &mut self.handlers {
            handler.log(&self.buffer[..self.curr_len])?;
        }

        self.curr_len = 0;
        Ok(())
    }

    pub fn consume(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buffer.is_empty() {
            for handler in &mut self.handlers {
                handler.log(data)?;
            }
            return Ok(());
        }

        let mut rest = data;
        while !rest.is_empty() {
            let available = self.buffer.len() - self.curr_len;
            let take = available.min(rest.len());
            self.buffer[self.curr_len..self.curr_len + take].copy_from_slice(&rest[..take]);
            self.curr_len += take;
            rest = &rest[take..];

            if self.curr_len == self.buffer.len() {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Flush pending bytes, then reopen every handler.
    pub fn reopen(&mut self) -> io::Result<()> {
        self.flush()?;
        for handler in &mut self.handlers {
            handler.reopen()?;
        }
        Ok(())
    }

    /// Path and offset of the first file handler, if any.
    pub fn logfile(&self) -> Option<(&Path, u64)> {
        self.handlers.first().map(|handler| match handler {
            LogHandler::File(f) => (f.path(), f.offset() + self.curr_len as u64),
        })
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if self.curr_len > 0 {
            if let Err(e) = self.flush() {
                log::error!("failed to flush log buffer: {e}");
            }
        }
    }
}
