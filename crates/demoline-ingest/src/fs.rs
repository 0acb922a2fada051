//! [`BlobSink`] on a local directory.
//!
//! A blob being written lives at `<root>/<locator>.part`, created with
//! `create_new` so only one writer can ever hold it. Finalizing syncs the
//! file, renames it to `<root>/<locator>` and marks it read-only.
//!
//! The open file handle sits in a slot shared between the writer and the
//! sink. `seal` empties that slot under its lock, so once a blob is sealed
//! its writer has nothing left to append to.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::{BlobError, BlobLocator, BlobReceipt, BlobSink, BlobWriter};

/// The file a writer appends to; `None` once finalized or sealed.
type Slot = Mutex<Option<BufWriter<File>>>;

/// Writers opened by this sink that have not finished yet.
#[derive(Debug, Clone, Default)]
struct LiveWriters(Arc<StdMutex<HashMap<BlobLocator, Weak<Slot>>>>);

impl LiveWriters {
    fn register(&self, locator: &BlobLocator, slot: &Arc<Slot>) {
        let mut live = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        live.retain(|_, slot| slot.strong_count() > 0);
        live.insert(locator.clone(), Arc::downgrade(slot));
    }

    fn get(&self, locator: &BlobLocator) -> Option<Arc<Slot>> {
        let live = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        live.get(locator).and_then(Weak::upgrade)
    }

    fn forget(&self, locator: &BlobLocator) {
        let mut live = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        live.remove(locator);
    }
}

/// Demo blobs stored as files under one directory.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
    live: LiveWriters,
}

impl FsBlobSink {
    /// Uses `root` as the blob directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            live: LiveWriters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn final_path(&self, locator: &BlobLocator) -> PathBuf {
        self.root.join(locator.as_str())
    }

    fn part_path(&self, locator: &BlobLocator) -> PathBuf {
        self.root.join(format!("{locator}.part"))
    }

    /// Takes the file away from a writer that is still open in this
    /// process and commits what it had written.
    async fn revoke(&self, locator: &BlobLocator, slot: &Slot) -> Result<Option<u64>, BlobError> {
        let mut held = slot.lock().await;
        // Already finalized, or sealed by an earlier sweep.
        let Some(mut file) = held.take() else {
            return Ok(None);
        };
        file.flush().await?;
        file.get_ref().sync_all().await?;
        drop(file);

        let size = commit(&self.part_path(locator), &self.final_path(locator)).await?;
        drop(held);
        self.live.forget(locator);
        tracing::info!(%locator, size, "blob sealed away from a stalled writer");
        Ok(Some(size))
    }
}

impl BlobSink for FsBlobSink {
    type Writer = FsBlobWriter;
    type Reader = File;

    async fn open_writer(&self, locator: &BlobLocator) -> Result<FsBlobWriter, BlobError> {
        let final_path = self.final_path(locator);
        if fs::try_exists(&final_path).await? {
            return Err(BlobError::WriterExists(locator.clone()));
        }

        let part_path = self.part_path(locator);
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BlobError::WriterExists(locator.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let slot = Arc::new(Mutex::new(Some(BufWriter::new(file))));
        self.live.register(locator, &slot);
        tracing::debug!(path = %part_path.display(), "blob writer opened");
        Ok(FsBlobWriter {
            locator: locator.clone(),
            slot,
            live: self.live.clone(),
            part_path,
            final_path,
            size: 0,
        })
    }

    async fn read(&self, locator: &BlobLocator) -> Result<Vec<u8>, BlobError> {
        match fs::read(self.final_path(locator)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::Missing(locator.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_reader(&self, locator: &BlobLocator) -> Result<(File, u64), BlobError> {
        let file = match File::open(self.final_path(locator)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlobError::Missing(locator.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    async fn seal(&self, locator: &BlobLocator) -> Result<Option<u64>, BlobError> {
        if let Some(slot) = self.live.get(locator) {
            return self.revoke(locator, &slot).await;
        }

        // No writer here: it died with an earlier process, or was dropped
        // without finalizing.
        let part_path = self.part_path(locator);
        let final_path = self.final_path(locator);
        if !fs::try_exists(&part_path).await? || fs::try_exists(&final_path).await? {
            return Ok(None);
        }

        File::open(&part_path).await?.sync_all().await?;
        let size = commit(&part_path, &final_path).await?;
        tracing::info!(%locator, size, "orphaned blob sealed");
        Ok(Some(size))
    }
}

/// Exclusive writer for one `.part` file.
#[derive(Debug)]
pub struct FsBlobWriter {
    locator: BlobLocator,
    slot: Arc<Slot>,
    live: LiveWriters,
    part_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

impl BlobWriter for FsBlobWriter {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), BlobError> {
        let mut held = self.slot.lock().await;
        let file = held
            .as_mut()
            .ok_or_else(|| BlobError::Sealed(self.locator.clone()))?;
        file.write_all(bytes).await?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    async fn finalize(self) -> Result<BlobReceipt, BlobError> {
        let mut held = self.slot.lock().await;
        let mut file = held
            .take()
            .ok_or_else(|| BlobError::Sealed(self.locator.clone()))?;
        file.flush().await?;
        file.get_ref().sync_all().await?;
        drop(file);

        let size = commit(&self.part_path, &self.final_path).await?;
        drop(held);
        self.live.forget(&self.locator);
        tracing::debug!(locator = %self.locator, size, written = self.size, "blob finalized");
        Ok(BlobReceipt { size })
    }
}

/// Moves a synced `.part` file into place and makes it read-only.
async fn commit(part_path: &Path, final_path: &Path) -> Result<u64, BlobError> {
    fs::rename(part_path, final_path).await?;
    let metadata = fs::metadata(final_path).await?;
    let mut permissions = metadata.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(final_path, permissions).await?;
    Ok(metadata.len())
}
