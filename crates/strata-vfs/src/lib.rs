//! Sandboxed virtual filesystem: copy-on-write reads of a protected store.
#![forbid(unsafe_code)]

mod sandbox;

pub use sandbox::Sandbox;

use std::path::{Component, Path, PathBuf};

use strata_core::{Result, Status, StatusExt};

/// Filesystem operations the storage engine is allowed to perform.
///
/// Everything takes whole paths so policy layers can inspect targets
/// before anything touches the real disk.
pub trait Vfs: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
    fn append(&self, path: &Path, data: &[u8]) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn file_size(&self, path: &Path) -> Result<u64>;
    /// Entries directly inside `dir`, as full paths, in name order.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn create_dir_all(&self, dir: &Path) -> Result<()>;
}

/// Lexically normalize a path: resolve `.` and `..` without touching disk.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Passthrough [`Vfs`] over the real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskFs;

impl Vfs for DiskFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).push_ctx(|| format!("reading {}", path.display()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        std::fs::write(path, data).push_ctx(|| format!("writing {}", path.display()))
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .push_ctx(|| format!("opening {} for append", path.display()))?;
        f.write_all(data)
            .push_ctx(|| format!("appending to {}", path.display()))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).push_ctx(|| format!("removing {}", path.display()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
            .push_ctx(|| format!("renaming {} -> {}", from.display(), to.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let meta =
            std::fs::metadata(path).push_ctx(|| format!("stat {}", path.display()))?;
        Ok(meta.len())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries =
            std::fs::read_dir(dir).push_ctx(|| format!("listing {}", dir.display()))?;
        for entry in entries {
            let entry = entry.push_ctx(|| format!("listing {}", dir.display()))?;
            out.push(entry.path());
        }
        out.sort();
        Ok(out)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).push_ctx(|| format!("creating {}", dir.display()))
    }
}

/// Policy layer failing every mutation whose target falls outside `allow`.
pub struct AllowListFs<V> {
    inner: V,
    allow: PathBuf,
}

impl<V: Vfs> AllowListFs<V> {
    pub fn new(inner: V, allow: PathBuf) -> Self {
        Self {
            inner,
            allow: normalize(&allow),
        }
    }

    fn check_write(&self, path: &Path) -> Result<()> {
        if normalize(path).starts_with(&self.allow) {
            Ok(())
        } else {
            Err(Status::io(format!(
                "write to {} outside sandbox {}",
                path.display(),
                self.allow.display()
            )))
        }
    }
}

impl<V: Vfs> Vfs for AllowListFs<V> {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.check_write(path)?;
        self.inner.write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.check_write(path)?;
        self.inner.append(path, data)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.check_write(path)?;
        self.inner.remove(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.check_write(from)?;
        self.check_write(to)?;
        self.inner.rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.inner.file_size(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list(dir)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        self.check_write(dir)?;
        self.inner.create_dir_all(dir)
    }
}
