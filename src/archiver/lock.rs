use crate::archiver::paths::lock_path;
use crate::archiver::util::now_iso8601;
use crate::error::ArchiverError;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub build_uuid: String,
    pub start_time: String,
}

/// Exclusive hold on an archive root. Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        let path = lock_path(root);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let holder = read_holder(&mut file)
                .map(|p| format!("pid {} since {}", p.pid, p.start_time))
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(ArchiverError::Locked { path, holder }.into());
        }

        let payload = LockPayload {
            pid: std::process::id(),
            build_uuid: env!("BUILD_UUID").to_string(),
            start_time: now_iso8601(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serde_json::to_string(&payload)?.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.sync_all()?;
        tracing::debug!("run lock held at {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder(file: &mut File) -> Option<LockPayload> {
    let mut raw = String::new();
    file.read_to_string(&mut raw).ok()?;
    serde_json::from_str(raw.trim()).ok()
}

/// Payload of a live lock on `root`, if another run holds it.
pub fn current_holder(root: &Path) -> Option<LockPayload> {
    let path = lock_path(root);
    let mut file = OpenOptions::new().read(true).write(true).open(path).ok()?;
    if FileExt::try_lock_exclusive(&file).is_ok() {
        let _ = FileExt::unlock(&file);
        return None;
    }
    read_holder(&mut file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExitCode, exit_code_for};
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let tmp = tempdir().expect("tempdir");
        let held = RunLock::acquire(tmp.path()).expect("first lock");
        assert!(held.path().ends_with(".disc-archiver.lock"));

        let holder = current_holder(tmp.path()).expect("holder");
        assert_eq!(holder.pid, std::process::id());

        let err = RunLock::acquire(tmp.path()).expect_err("contended");
        assert_eq!(exit_code_for(&err), ExitCode::Locked);
        assert!(format!("{err:#}").contains("pid"));

        drop(held);
        assert!(current_holder(tmp.path()).is_none());
        RunLock::acquire(tmp.path()).expect("relock");
    }
}
