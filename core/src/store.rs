use crate::types::ObjectId;
use crate::{Error, Result};
use bytes::Bytes;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const COPY_BUF: usize = 64 * 1024;

/// Content-addressed blob storage under `objects/<2-hex>/<64-hex>`.
///
/// An object's location is a pure function of its hash, so presence checks
/// never list directories. New objects are written to a temp file inside
/// the shard and renamed into place; a crash leaves at most a
/// `<hash>.tmp.<suffix>` file behind.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

/// Whether a put wrote a new blob or found it already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub id: ObjectId,
    pub stored: bool,
}

/// One blob found while walking the store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: ObjectId,
    pub path: PathBuf,
    pub size: u64,
}

impl ObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.shard()).join(id.to_hex())
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    /// Stores `data` unless an object with the same hash already exists.
    pub fn put(&self, data: &[u8]) -> Result<PutOutcome> {
        let id = ObjectId::from_data(data);
        if self.contains(&id) {
            return Ok(PutOutcome { id, stored: false });
        }
        let (tmp, mut file) = self.create_temp(&id)?;
        let written = file
            .write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io("writing object", e));
        drop(file);
        if let Err(e) = written {
            discard(&tmp);
            return Err(e);
        }
        self.install(&tmp, &id)
    }

    /// Streams a file into the store, hashing while copying. Content that is
    /// already stored is recognized from a read-only hash pass and never
    /// copied. The returned id is whatever the bytes actually hashed to.
    pub fn put_file(&self, path: &Path) -> Result<PutOutcome> {
        let known = hash_file(path).map_err(|e| Error::io("reading source file", e))?;
        if self.contains(&known) {
            return Ok(PutOutcome {
                id: known,
                stored: false,
            });
        }

        let source = File::open(path).map_err(|e| Error::io("reading source file", e))?;
        let staging = self.root.join(format!("incoming.tmp.{}", random_suffix()));
        fs::create_dir_all(&self.root).map_err(|e| Error::io("creating object store", e))?;
        let mut file = File::create(&staging).map_err(|e| Error::io("writing object", e))?;
        let copied = copy_hashing(source, &mut file).and_then(|id| {
            file.sync_all()?;
            Ok(id)
        });
        drop(file);
        let id = match copied {
            Ok((id, _)) => id,
            Err(e) => {
                discard(&staging);
                return Err(Error::io("writing object", e));
            }
        };
        if self.contains(&id) {
            discard(&staging);
            return Ok(PutOutcome { id, stored: false });
        }
        self.install(&staging, &id)
    }

    /// Installs the bytes from `reader` under `expected` only if they hash to
    /// it. Existing objects are never overwritten, but the incoming stream is
    /// still consumed and verified. Returns `Ok(true)` when a blob was written.
    pub fn put_verified<R: Read>(&self, expected: &ObjectId, reader: R) -> Result<bool> {
        if self.contains(expected) {
            let (actual, _) = copy_hashing(reader, &mut io::sink())?;
            if actual != *expected {
                return Err(Error::ObjectCorrupt {
                    hash: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
            return Ok(false);
        }

        let (tmp, mut file) = self.create_temp(expected)?;
        let copied = copy_hashing(reader, &mut file).and_then(|id| {
            file.sync_all()?;
            Ok(id)
        });
        drop(file);
        let actual = match copied {
            Ok((id, _)) => id,
            Err(e) => {
                discard(&tmp);
                return Err(Error::io("writing object", e));
            }
        };
        if actual != *expected {
            discard(&tmp);
            return Err(Error::ObjectCorrupt {
                hash: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(self.install(&tmp, expected)?.stored)
    }

    pub fn get(&self, id: &ObjectId) -> Result<Bytes> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::ObjectMissing {
                hash: id.to_hex(),
                path: None,
            }),
            Err(e) => Err(Error::io("reading object", e)),
        }
    }

    pub fn open(&self, id: &ObjectId) -> Result<File> {
        File::open(self.object_path(id)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::ObjectMissing {
                    hash: id.to_hex(),
                    path: None,
                }
            } else {
                Error::io("reading object", e)
            }
        })
    }

    /// Re-hashes the stored bytes of `id`.
    pub fn rehash(&self, id: &ObjectId) -> Result<ObjectId> {
        let file = self.open(id)?;
        let (actual, _) = copy_hashing(file, &mut io::sink())
            .map_err(|e| Error::io("reading object", e))?;
        Ok(actual)
    }

    /// Removes one blob and, when it was the last in its shard, the shard.
    pub fn delete(&self, id: &ObjectId) -> Result<()> {
        let path = self.object_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("removing object", e)),
        }
        if let Some(shard) = path.parent() {
            remove_dir_if_empty(shard);
        }
        debug!(object = %id, "removed object");
        Ok(())
    }

    /// Walks every shard, returning well-formed blobs and, separately, stray
    /// temp files from interrupted writes.
    pub fn scan(&self) -> Result<(Vec<StoredObject>, Vec<PathBuf>)> {
        let mut objects = Vec::new();
        let mut strays = Vec::new();

        let shards = match fs::read_dir(&self.root) {
            Ok(shards) => shards,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((objects, strays)),
            Err(e) => return Err(Error::io("listing object store", e)),
        };

        for shard in shards {
            let shard = shard?;
            let name = shard.file_name().to_string_lossy().to_string();
            if !shard.file_type()?.is_dir() {
                if name.contains(".tmp.") {
                    strays.push(shard.path());
                }
                continue;
            }

            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();
                match ObjectId::parse_strict(&file_name) {
                    Some(id) if id.shard() == name => objects.push(StoredObject {
                        id,
                        path: entry.path(),
                        size: entry.metadata()?.len(),
                    }),
                    _ if file_name.contains(".tmp.") => strays.push(entry.path()),
                    _ => {}
                }
            }
        }

        objects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((objects, strays))
    }

    fn create_temp(&self, id: &ObjectId) -> Result<(PathBuf, File)> {
        let shard = self.root.join(id.shard());
        fs::create_dir_all(&shard).map_err(|e| Error::io("creating object shard", e))?;
        let tmp = shard.join(format!("{}.tmp.{}", id.to_hex(), random_suffix()));
        let file = File::create(&tmp).map_err(|e| Error::io("writing object", e))?;
        Ok((tmp, file))
    }

    fn install(&self, tmp: &Path, id: &ObjectId) -> Result<PutOutcome> {
        let dest = self.object_path(id);
        if let Some(shard) = dest.parent() {
            fs::create_dir_all(shard).map_err(|e| Error::io("creating object shard", e))?;
        }
        if dest.is_file() {
            discard(tmp);
            return Ok(PutOutcome {
                id: *id,
                stored: false,
            });
        }
        if let Err(e) = fs::rename(tmp, &dest) {
            discard(tmp);
            return Err(Error::io("installing object", e));
        }
        debug!(object = %id, "stored object");
        Ok(PutOutcome {
            id: *id,
            stored: true,
        })
    }
}

/// Copies `reader` into `writer`, returning the SHA-256 of the bytes and
/// their length.
pub fn copy_hashing<R: Read, W: Write>(mut reader: R, writer: &mut W) -> io::Result<(ObjectId, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((ObjectId::from(hasher), total))
}

pub fn hash_file(path: &Path) -> io::Result<ObjectId> {
    let file = File::open(path)?;
    copy_hashing(file, &mut io::sink()).map(|(id, _)| id)
}

pub(crate) fn random_suffix() -> String {
    format!("{:08x}", rand::thread_rng().r#gen::<u32>())
}

pub(crate) fn remove_dir_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        let _ = fs::remove_dir(dir);
    }
}

fn discard(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        (dir, store)
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = store();
        let first = store.put(b"hello").unwrap();
        assert!(first.stored);
        assert_eq!(first.id, ObjectId::from_data(b"hello"));

        let second = store.put(b"hello").unwrap();
        assert!(!second.stored);
        assert_eq!(second.id, first.id);

        let path = store.object_path(&first.id);
        assert!(path.ends_with(format!("{}/{}", first.id.shard(), first.id.to_hex())));
        assert_eq!(&store.get(&first.id).unwrap()[..], b"hello");
    }

    #[test]
    fn test_get_missing_object() {
        let (_dir, store) = store();
        let err = store.get(&ObjectId::from_data(b"nope")).unwrap_err();
        assert_eq!(err.code(), "OBJECT_MISSING");
    }

    #[test]
    fn test_put_file_streams_and_dedups() {
        let (dir, store) = store();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let first = store.put_file(&a).unwrap();
        let second = store.put_file(&b).unwrap();
        assert!(first.stored);
        assert!(!second.stored);
        assert_eq!(first.id, second.id);

        let (objects, strays) = store.scan().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(strays.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_put_file_skips_copy_for_known_content() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store();
        let id = store.put(b"already here").unwrap().id;
        let before = fs::metadata(store.object_path(&id)).unwrap().modified().unwrap();
        let source = dir.path().join("copy.txt");
        fs::write(&source, b"already here").unwrap();

        fs::set_permissions(store.root(), fs::Permissions::from_mode(0o555)).unwrap();
        let outcome = store.put_file(&source);
        fs::set_permissions(store.root(), fs::Permissions::from_mode(0o755)).unwrap();

        let outcome = outcome.unwrap();
        assert_eq!(outcome.id, id);
        assert!(!outcome.stored);
        let after = fs::metadata(store.object_path(&id)).unwrap().modified().unwrap();
        assert_eq!(before, after);
        let leftovers = fs::read_dir(store.root())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("incoming"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_put_verified_rejects_mismatch() {
        let (_dir, store) = store();
        let claimed = ObjectId::from_data(b"expected");
        let err = store.put_verified(&claimed, &b"tampered"[..]).unwrap_err();
        assert_eq!(err.code(), "OBJECT_CORRUPT");
        assert!(!store.contains(&claimed));

        let (objects, strays) = store.scan().unwrap();
        assert!(objects.is_empty());
        assert!(strays.is_empty());

        assert!(store.put_verified(&claimed, &b"expected"[..]).unwrap());
        assert!(!store.put_verified(&claimed, &b"expected"[..]).unwrap());
        assert!(store.put_verified(&claimed, &b"tampered"[..]).is_err());
    }

    #[test]
    fn test_delete_prunes_empty_shard() {
        let (_dir, store) = store();
        let put = store.put(b"bye").unwrap();
        let shard = store.object_path(&put.id).parent().unwrap().to_path_buf();
        store.delete(&put.id).unwrap();
        assert!(!store.contains(&put.id));
        assert!(!shard.exists());
    }

    #[test]
    fn test_rehash_detects_corruption() {
        let (_dir, store) = store();
        let put = store.put(b"original").unwrap();
        fs::write(store.object_path(&put.id), b"bit rot").unwrap();
        assert_ne!(store.rehash(&put.id).unwrap(), put.id);
    }
}
