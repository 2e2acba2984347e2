use std::path::Path;
use std::sync::Arc;

use log::debug;
use strata_core::{Result, Status, StatusExt};
use strata_vfs::Vfs;

use crate::{KvIter, KvStore};

const MANIFEST_MAGIC: &str = "strata-table-v1";
const ENTRIES_PER_TABLE: usize = 4096;

/// On-disk sorted-table store, opened through a [`Vfs`].
///
/// The layout is a `MANIFEST` naming the table files plus one or more
/// `table-NNN.tbl` files of length-prefixed records in ascending key
/// order. Opening takes a `LOCK` in the store directory, which a
/// sandboxing `Vfs` redirects away from the real store.
#[derive(Debug)]
pub struct TableStore {
    entries: Arc<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl TableStore {
    pub fn open(vfs: &dyn Vfs, root: &Path) -> Result<TableStore> {
        vfs.write(&root.join("LOCK"), format!("strata {}", std::process::id()).as_bytes())
            .push_ctx(|| format!("locking store {}", root.display()))?;

        let manifest = vfs
            .read(&root.join("MANIFEST"))
            .push_ctx(|| format!("opening store {}", root.display()))?;
        let manifest = String::from_utf8(manifest)
            .map_err(|_| Status::malformed("manifest is not utf-8"))
            .push_ctx(|| format!("opening store {}", root.display()))?;
        let mut lines = manifest.lines();
        if lines.next() != Some(MANIFEST_MAGIC) {
            return Err(Status::malformed("bad manifest magic")
                .push(format!("opening store {}", root.display())));
        }

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for name in lines {
            let path = root.join(name);
            let data = vfs
                .read(&path)
                .push_ctx(|| format!("reading table {name}"))?;
            parse_table(&data, &mut entries)
                .push_ctx(|| format!("reading table {name}"))?;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);
        debug!("opened table store {} ({} keys)", root.display(), entries.len());
        Ok(TableStore {
            entries: Arc::new(entries),
        })
    }

    /// Write a store at `root` from pre-built pairs (need not be sorted).
    pub fn create(
        vfs: &dyn Vfs,
        root: &Path,
        mut pairs: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        vfs.create_dir_all(root)?;
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut manifest = String::from(MANIFEST_MAGIC);
        for (i, chunk) in pairs.chunks(ENTRIES_PER_TABLE).enumerate() {
            let name = format!("table-{i:03}.tbl");
            let mut data = Vec::new();
            for (k, v) in chunk {
                data.extend_from_slice(&(k.len() as u32).to_be_bytes());
                data.extend_from_slice(&(v.len() as u32).to_be_bytes());
                data.extend_from_slice(k);
                data.extend_from_slice(v);
            }
            vfs.write(&root.join(&name), &data)
                .push_ctx(|| format!("writing table {name}"))?;
            manifest.push('\n');
            manifest.push_str(&name);
        }
        vfs.write(&root.join("MANIFEST"), manifest.as_bytes())
            .push_ctx(|| format!("writing manifest in {}", root.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_table(data: &[u8], out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
    let mut at = 0usize;
    while at < data.len() {
        if at + 8 > data.len() {
            return Err(Status::malformed(format!("truncated header at offset {at}")));
        }
        let klen = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
        let vlen = u32::from_be_bytes(data[at + 4..at + 8].try_into().unwrap()) as usize;
        at += 8;
        if at + klen + vlen > data.len() {
            return Err(Status::malformed(format!("truncated record at offset {at}")));
        }
        let key = data[at..at + klen].to_vec();
        let value = data[at + klen..at + klen + vlen].to_vec();
        at += klen + vlen;
        out.push((key, value));
    }
    Ok(())
}

struct TableIter {
    entries: Arc<Vec<(Vec<u8>, Vec<u8>)>>,
    at: usize,
}

impl KvIter for TableIter {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.entries.get(self.at) {
            Some((k, v)) => {
                self.at += 1;
                Ok(Some((k.clone(), v.clone())))
            }
            None => Ok(None),
        }
    }
}

impl KvStore for TableStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => Ok(Some(self.entries[i].1.clone())),
            Err(_) => Ok(None),
        }
    }

    fn iter_from(&self, start: &[u8]) -> Result<Box<dyn KvIter + '_>> {
        let at = self.entries.partition_point(|(k, _)| k.as_slice() < start);
        Ok(Box::new(TableIter {
            entries: Arc::clone(&self.entries),
            at,
        }))
    }
}
