use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use strata_core::{Result, Status};
use tempfile::TempDir;

use crate::{AllowListFs, DiskFs, Vfs, normalize};

#[derive(Default)]
struct Overlay {
    // protected path -> private copy inside the shadow root
    shadowed: HashMap<PathBuf, PathBuf>,
    // protected paths logically deleted or renamed away
    removed: HashSet<PathBuf>,
}

/// Copy-on-write layer over a protected directory.
///
/// Writes touching files under `protect` land in private copies under
/// `shadow_root`; later reads of those paths see the copy. Paths never
/// written fall through to the original untouched.
struct CowFs<V> {
    inner: V,
    protect: PathBuf,
    shadow_root: PathBuf,
    overlay: Mutex<Overlay>,
}

impl<V: Vfs> CowFs<V> {
    fn new(inner: V, protect: PathBuf, shadow_root: PathBuf) -> Self {
        Self {
            inner,
            protect: normalize(&protect),
            shadow_root,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    fn protected(&self, path: &Path) -> Option<PathBuf> {
        let n = normalize(path);
        n.starts_with(&self.protect).then_some(n)
    }

    fn shadow_for(&self, protected: &Path) -> PathBuf {
        // protected is normalized and under self.protect
        let rel = protected.strip_prefix(&self.protect).unwrap_or(protected);
        self.shadow_root.join(rel)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Overlay> {
        // Inner state stays consistent even if a panicking thread held the lock.
        self.overlay.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: Vfs> Vfs for CowFs<V> {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        if let Some(p) = self.protected(path) {
            let overlay = self.lock();
            if overlay.removed.contains(&p) {
                return Err(Status::not_found(format!("{} was removed", p.display())));
            }
            if let Some(copy) = overlay.shadowed.get(&p) {
                let copy = copy.clone();
                drop(overlay);
                return self.inner.read(&copy);
            }
        }
        self.inner.read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let Some(p) = self.protected(path) else {
            return self.inner.write(path, data);
        };
        let copy = self.shadow_for(&p);
        if let Some(parent) = copy.parent() {
            self.inner.create_dir_all(parent)?;
        }
        self.inner.write(&copy, data)?;
        debug!("cow: {} -> {}", p.display(), copy.display());
        let mut overlay = self.lock();
        overlay.removed.remove(&p);
        overlay.shadowed.insert(p, copy);
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let Some(p) = self.protected(path) else {
            return self.inner.append(path, data);
        };
        // First append to a still-pristine original copies it into the shadow.
        let existing = match self.read(&p) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == strata_core::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut combined = existing;
        combined.extend_from_slice(data);
        self.write(&p, &combined)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let Some(p) = self.protected(path) else {
            return self.inner.remove(path);
        };
        let mut overlay = self.lock();
        let copy = overlay.shadowed.remove(&p);
        overlay.removed.insert(p);
        drop(overlay);
        if let Some(copy) = copy {
            self.inner.remove(&copy)?;
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_protected = self.protected(from).is_some();
        let to_protected = self.protected(to).is_some();
        if !from_protected && !to_protected {
            return self.inner.rename(from, to);
        }
        // A protected endpoint may live in a different real tree than the
        // other side, so this is a copy, never a fast rename.
        let bytes = self.read(from)?;
        self.write(to, &bytes)?;
        self.remove(from)
    }

    fn exists(&self, path: &Path) -> bool {
        if let Some(p) = self.protected(path) {
            let overlay = self.lock();
            if overlay.removed.contains(&p) {
                return false;
            }
            if overlay.shadowed.contains_key(&p) {
                return true;
            }
        }
        self.inner.exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        if let Some(p) = self.protected(path) {
            let overlay = self.lock();
            if overlay.removed.contains(&p) {
                return Err(Status::not_found(format!("{} was removed", p.display())));
            }
            if let Some(copy) = overlay.shadowed.get(&p) {
                let copy = copy.clone();
                drop(overlay);
                return self.inner.file_size(&copy);
            }
        }
        self.inner.file_size(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let Some(d) = self.protected(dir) else {
            return self.inner.list(dir);
        };
        let mut entries = self.inner.list(&d).unwrap_or_default();
        let overlay = self.lock();
        entries.retain(|p| !overlay.removed.contains(&normalize(p)));
        for p in overlay.shadowed.keys() {
            if p.parent() == Some(d.as_path()) && !entries.contains(p) {
                entries.push(p.clone());
            }
        }
        drop(overlay);
        entries.sort();
        Ok(entries)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        if self.protected(dir).is_some() {
            // Logical directories under the protected root always exist.
            return Ok(());
        }
        self.inner.create_dir_all(dir)
    }
}

/// Sandboxed view of a key-value store directory.
///
/// The storage engine gets the writable environment it expects (lock
/// files, temp manifests) while the original store directory is never
/// mutated: an allow-list confines real writes to a per-open temp
/// directory, and a copy-on-write layer on top redirects writes against
/// protected store files into private copies there.
pub struct Sandbox {
    store_root: PathBuf,
    work_root: PathBuf,
    fs: Option<CowFs<AllowListFs<DiskFs>>>,
    // Removed recursively on drop.
    _temp: Option<TempDir>,
}

impl Sandbox {
    /// Open a sandboxed view over `store_path`, staging writes under a
    /// fresh temp directory inside `temp_root`.
    ///
    /// Temp-directory creation failure is fatal. If the store or temp
    /// path cannot be canonicalized the returned handle is poisoned:
    /// every operation on it reports an i/o error.
    pub fn open(store_path: &Path, temp_root: &Path) -> Result<Sandbox> {
        std::fs::create_dir_all(temp_root)
            .map_err(|e| Status::from(e).push(format!("preparing {}", temp_root.display())))?;
        let temp = tempfile::Builder::new()
            .prefix("strata-sandbox-")
            .tempdir_in(temp_root)
            .map_err(|e| {
                Status::from(e).push(format!("creating sandbox under {}", temp_root.display()))
            })?;

        let canon_store = store_path.canonicalize();
        let canon_work = temp.path().canonicalize();
        let (store_root, work_root, fs) = match (canon_store, canon_work) {
            (Ok(store), Ok(work)) => {
                let allow = AllowListFs::new(DiskFs, work.clone());
                let cow = CowFs::new(allow, store.clone(), work.join("shadow"));
                (store, work, Some(cow))
            }
            _ => {
                debug!(
                    "sandbox over {} is poisoned: canonicalization failed",
                    store_path.display()
                );
                (store_path.to_path_buf(), temp.path().to_path_buf(), None)
            }
        };

        Ok(Sandbox {
            store_root,
            work_root,
            fs,
            _temp: Some(temp),
        })
    }

    /// Root of the protected source store.
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    /// Writable staging directory, removed when the sandbox drops.
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn is_poisoned(&self) -> bool {
        self.fs.is_none()
    }

    fn fs(&self) -> Result<&CowFs<AllowListFs<DiskFs>>> {
        self.fs
            .as_ref()
            .ok_or_else(|| Status::io("sandbox handle is poisoned"))
    }
}

impl Vfs for Sandbox {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.fs()?.read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.fs()?.write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.fs()?.append(path, data)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.fs()?.remove(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.fs()?.rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        match &self.fs {
            Some(fs) => fs.exists(path),
            None => false,
        }
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.fs()?.file_size(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.fs()?.list(dir)
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        self.fs()?.create_dir_all(dir)
    }
}
