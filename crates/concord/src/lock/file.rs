// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{validate_name, ErrorKind};
use crate::lock::LockMode;

/// Cross-process locks: one `<name>.lock` file per lock under a shared
/// directory, held with an exclusive `flock`.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| anyhow::Error::new(e).context(ErrorKind::Storage))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) async fn acquire(&self, name: &str, mode: LockMode) -> anyhow::Result<Option<Flock<File>>> {
        validate_name(name)?;
        let path = self.dir.join(format!("{name}.lock"));
        match mode {
            LockMode::IfAvailable => lock_file(&path, FlockArg::LockExclusiveNonblock),
            LockMode::Blocking => {
                tokio::task::spawn_blocking(move || lock_file(&path, FlockArg::LockExclusive)).await?
            }
        }
    }
}

/// Take `flock` on `path`. `Ok(None)` means a non-blocking attempt found it held.
fn lock_file(path: &Path, arg: FlockArg) -> anyhow::Result<Option<Flock<File>>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| anyhow::Error::new(e).context(ErrorKind::Storage))?;
    match Flock::lock(file, arg) {
        Ok(locked) => Ok(Some(locked)),
        Err((_file, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_file, errno)) => {
            Err(anyhow::anyhow!("flock {} failed: {errno}", path.display()).context(ErrorKind::Storage))
        }
    }
}
