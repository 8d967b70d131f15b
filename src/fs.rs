//! Blocking file I/O dispatched to the executor's worker pool.
//!
//! This is out of scope as core functionality -- there's no async file I/O facility here, just a
//! motivating example of the "dispatch CPU-ish/blocking work to the executor" pattern. Each call
//! consumes a worker-pool slot for the duration of the underlying syscalls; it is not true
//! asynchronous I/O the way socket operations are.

use std::io::{Read, Write};
use std::path::PathBuf;

use crate::error::Result;
use crate::executor::{Executor, JoinHandle};

/// Reads the whole contents of `path` on the global executor's worker pool.
pub fn read_to_vec(path: impl Into<PathBuf>) -> JoinHandle<Vec<u8>> {
    let path = path.into();
    Executor::global().spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

/// Appends `data` to `path` (creating it if absent) on the global executor's worker pool.
pub fn append(path: impl Into<PathBuf>, data: Vec<u8>) -> JoinHandle<()> {
    let path = path.into();
    Executor::global().spawn_blocking(move || -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(&data)?;
        Ok(())
    })
}
