//! A `flock`-based exclusive lock, the Linux analogue of a named
//! cross-process mutex (§6): a second instance exits rather than fighting
//! the first one over the same input devices.

use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub struct SingleInstanceGuard {
    _file: File,
}

impl SingleInstanceGuard {
    pub fn acquire() -> Result<Self> {
        let path = lock_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("couldn't create {}", dir.display()))?;
        }
        let file = File::create(&path)
            .with_context(|| format!("couldn't open lock file {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            bail!("another instance is already running ({})", path.display());
        }
        Ok(Self { _file: file })
    }
}

fn lock_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("keyremapd.lock")
}
