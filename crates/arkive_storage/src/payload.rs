//! Sharded payload store.

use crate::config::PayloadConfig;
use crate::digest::HashAlgorithm;
use crate::error::{StorageError, StorageResult};
use crate::shard;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Number of bytes written.
    pub size: u64,
    /// Digest rendered as `algorithm:hex`, `None` for an empty body.
    pub hash: Option<String>,
}

impl Upload {
    /// Returns true if the upload produced a live payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.size > 0
    }
}

/// A filesystem store of resource payloads.
///
/// Each resource has at most one live file at its sharded path. While a
/// transaction replaces or deletes that file, the previous content is kept
/// at the same path suffixed with `.{txid}`. Moving between the two is
/// always a rename, so a crash leaves exactly one of them populated.
///
/// [`preserve`](Self::preserve) fills the backup slot once per
/// transaction. If there was no live payload at that point it leaves an
/// empty backup file instead, which [`restore`](Self::restore) turns back
/// into "no payload". Uploads never keep an empty live file, so an empty
/// backup cannot be mistaken for content.
///
/// # Example
///
/// ```no_run
/// use arkive_storage::{PayloadConfig, PayloadStore};
///
/// let store = PayloadStore::new(PayloadConfig::new("/srv/payloads")).unwrap();
/// let upload = store.upload(42, &b"hello"[..]).unwrap();
/// assert_eq!(upload.size, 5);
/// assert!(store.backup(42, 7).unwrap());
/// assert!(store.restore(42, 7).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct PayloadStore {
    config: PayloadConfig,
    algorithm: HashAlgorithm,
}

impl PayloadStore {
    /// Creates a store, resolving the configured digest algorithm.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHashAlgorithm` if the algorithm name is not supported.
    pub fn new(config: PayloadConfig) -> StorageResult<Self> {
        let algorithm = config.hash_algorithm.parse()?;
        Ok(Self { config, algorithm })
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Returns the resolved digest algorithm.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Returns the live payload path of `id`.
    #[must_use]
    pub fn path(&self, id: u64) -> PathBuf {
        shard::shard_path(&self.config.root, id, self.config.shard_depth)
    }

    /// Returns the path of the backup kept for transaction `suffix`.
    #[must_use]
    pub fn backup_path(&self, id: u64, suffix: u64) -> PathBuf {
        let mut name = self.path(id).into_os_string();
        name.push(format!(".{suffix}"));
        PathBuf::from(name)
    }

    /// Returns true if a live payload exists for `id`.
    #[must_use]
    pub fn exists(&self, id: u64) -> bool {
        self.path(id).is_file()
    }

    /// Returns true if a backup for transaction `suffix` exists.
    #[must_use]
    pub fn has_backup(&self, id: u64, suffix: u64) -> bool {
        self.backup_path(id, suffix).is_file()
    }

    /// Opens the live payload for reading, if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened.
    pub fn open(&self, id: u64) -> StorageResult<Option<File>> {
        match File::open(self.path(id)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the shard directories of `id` if they are missing.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dir(&self, id: u64) -> StorageResult<PathBuf> {
        let dir = shard::shard_dir(&self.config.root, id, self.config.shard_depth);
        self.create_dir(&dir)?;
        Ok(dir)
    }

    /// Streams `body` into the live location of `id`.
    ///
    /// The bytes go to a temporary file first while the digest is computed,
    /// then the file is renamed over the live path. An empty body leaves no
    /// payload at all: the temporary file is discarded and any previous
    /// live file is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the body, writing the temporary file or
    /// the final rename fails.
    pub fn upload<R: Read>(&self, id: u64, mut body: R) -> StorageResult<Upload> {
        self.create_dir(&self.config.tmp_dir)?;
        let mut temp = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.config.tmp_dir)?;

        let mut hasher = self.algorithm.hasher();
        let mut size = 0u64;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match body.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buffer[..n]);
            temp.write_all(&buffer[..n])?;
            size += n as u64;
        }

        if size == 0 {
            // Dropping `temp` unlinks it.
            drop(temp);
            self.delete(id, None)?;
            tracing::debug!(resource_id = id, "empty upload, no payload kept");
            return Ok(Upload { size, hash: None });
        }

        temp.as_file().sync_all()?;
        self.ensure_dir(id)?;
        let target = self.path(id);
        temp.persist(&target).map_err(|e| {
            let from = e.file.path().to_path_buf();
            StorageError::rename(from, target.clone(), e.error)
        })?;

        let hash = hasher.finish();
        tracing::debug!(resource_id = id, size, %hash, "payload uploaded");
        Ok(Upload {
            size,
            hash: Some(hash),
        })
    }

    /// Moves the live payload of `id` aside for transaction `suffix`.
    ///
    /// Returns `false` without failing if there is no live payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    pub fn backup(&self, id: u64, suffix: u64) -> StorageResult<bool> {
        let live = self.path(id);
        let backup = self.backup_path(id, suffix);
        let moved = rename_if_present(&live, &backup)?;
        if moved {
            tracing::debug!(resource_id = id, txid = suffix, "payload backed up");
        }
        Ok(moved)
    }

    /// Records the pre-transaction payload of `id` for transaction `suffix`.
    ///
    /// Only the first call per transaction does anything: it moves the live
    /// payload to the backup slot, or marks the slot with an empty file if
    /// there was no payload. Returns `true` if this call filled the slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename or the marker file fails.
    pub fn preserve(&self, id: u64, suffix: u64) -> StorageResult<bool> {
        if self.has_backup(id, suffix) {
            return Ok(false);
        }
        if self.backup(id, suffix)? {
            return Ok(true);
        }
        self.ensure_dir(id)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.backup_path(id, suffix))
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(resource_id = id, txid = suffix, "payload absence recorded");
        Ok(true)
    }

    /// Moves the backup kept for transaction `suffix` back to the live path.
    ///
    /// An empty backup records that there was no payload: the live file is
    /// removed along with it. Returns `false` without failing if there is
    /// no backup.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename or a removal fails.
    pub fn restore(&self, id: u64, suffix: u64) -> StorageResult<bool> {
        let live = self.path(id);
        let backup = self.backup_path(id, suffix);
        match fs::metadata(&backup) {
            Ok(meta) if meta.len() == 0 => {
                self.delete(id, None)?;
                self.delete(id, Some(suffix))?;
                tracing::debug!(resource_id = id, txid = suffix, "payload absence restored");
                return Ok(true);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let moved = rename_if_present(&backup, &live)?;
        if moved {
            tracing::debug!(resource_id = id, txid = suffix, "payload restored");
        }
        Ok(moved)
    }

    /// Removes the live payload, or the backup for `suffix` if given.
    ///
    /// Returns `false` if there was nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self, id: u64, suffix: Option<u64>) -> StorageResult<bool> {
        let path = match suffix {
            Some(suffix) => self.backup_path(id, suffix),
            None => self.path(id),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_dir(&self, dir: &Path) -> StorageResult<()> {
        if dir.is_dir() {
            return Ok(());
        }
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.config.dir_mode);
        }
        builder.create(dir)?;
        Ok(())
    }
}

fn rename_if_present(from: &Path, to: &Path) -> StorageResult<bool> {
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::rename(from, to, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> PayloadStore {
        PayloadStore::new(PayloadConfig::new(dir.join("payloads"))).unwrap()
    }

    #[test]
    fn upload_writes_sharded_file() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let upload = store.upload(1234, &b"hello world"[..]).unwrap();
        assert_eq!(upload.size, 11);
        assert!(upload.hash.unwrap().starts_with("sha256:"));

        let expected = dir.path().join("payloads").join("34").join("12").join("1234");
        assert_eq!(store.path(1234), expected);
        assert_eq!(fs::read(&expected).unwrap(), b"hello world");
    }

    #[test]
    fn upload_replaces_previous_payload() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upload(5, &b"first"[..]).unwrap();
        store.upload(5, &b"second"[..]).unwrap();
        assert_eq!(fs::read(store.path(5)).unwrap(), b"second");
    }

    #[test]
    fn empty_upload_leaves_no_payload() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upload(9, &b"old"[..]).unwrap();
        let upload = store.upload(9, io::empty()).unwrap();

        assert_eq!(upload.size, 0);
        assert!(upload.hash.is_none());
        assert!(!upload.has_payload());
        assert!(!store.exists(9));
        let leftovers = fs::read_dir(&store.config().tmp_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backup_then_restore_is_identity() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let bytes: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
        store.upload(77, bytes.as_slice()).unwrap();

        assert!(store.backup(77, 42).unwrap());
        assert!(!store.exists(77));
        assert!(store.has_backup(77, 42));

        assert!(store.restore(77, 42).unwrap());
        assert_eq!(fs::read(store.path(77)).unwrap(), bytes);
        assert!(!store.has_backup(77, 42));
    }

    #[test]
    fn backup_without_live_file_is_noop() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(!store.backup(3, 1).unwrap());
        assert!(!store.has_backup(3, 1));
        assert!(!store.restore(3, 1).unwrap());
    }

    #[test]
    fn restore_overwrites_transaction_content() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upload(8, &b"before"[..]).unwrap();
        store.backup(8, 10).unwrap();
        store.upload(8, &b"during"[..]).unwrap();
        store.restore(8, 10).unwrap();

        assert_eq!(fs::read(store.path(8)).unwrap(), b"before");
    }

    #[test]
    fn preserve_keeps_only_the_first_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upload(21, &b"original"[..]).unwrap();
        assert!(store.preserve(21, 4).unwrap());
        store.upload(21, &b"first"[..]).unwrap();
        assert!(!store.preserve(21, 4).unwrap());
        store.upload(21, &b"second"[..]).unwrap();

        assert!(store.restore(21, 4).unwrap());
        assert_eq!(fs::read(store.path(21)).unwrap(), b"original");
    }

    #[test]
    fn preserve_without_payload_restores_absence() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.preserve(22, 4).unwrap());
        assert!(store.has_backup(22, 4));
        store.upload(22, &b"first"[..]).unwrap();
        assert!(!store.preserve(22, 4).unwrap());
        store.upload(22, &b"second"[..]).unwrap();
        assert_eq!(fs::metadata(store.backup_path(22, 4)).unwrap().len(), 0);

        assert!(store.restore(22, 4).unwrap());
        assert!(!store.exists(22));
        assert!(!store.has_backup(22, 4));
    }

    #[test]
    fn delete_live_and_backup() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.upload(11, &b"x"[..]).unwrap();
        store.backup(11, 2).unwrap();
        store.upload(11, &b"y"[..]).unwrap();

        assert!(store.delete(11, Some(2)).unwrap());
        assert!(store.delete(11, None).unwrap());
        assert!(!store.delete(11, None).unwrap());
        assert!(store.open(11).unwrap().is_none());
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let first = store.ensure_dir(123).unwrap();
        let second = store.ensure_dir(123).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn directories_use_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let config = PayloadConfig::new(dir.path().join("p")).with_dir_mode(0o700);
        let store = PayloadStore::new(config).unwrap();

        let shard = store.ensure_dir(5).unwrap();
        let mode = fs::metadata(&shard).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & !0o700, 0);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let config = PayloadConfig::new("/tmp/x").with_hash_algorithm("crc32");
        assert!(matches!(
            PayloadStore::new(config),
            Err(StorageError::UnknownHashAlgorithm(_))
        ));
    }
}
