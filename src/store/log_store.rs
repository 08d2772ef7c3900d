//! Log Data Store
//!
//! Orchestrates file pairs and the lid table.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::chunk::{FileChunk, FileId, FileStats, NameId, SerialNum};
use crate::chunk::{ChunkVisitor, WriterOptions};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::generation::{GenerationGuard, GenerationHandler, GenerationHoldList};
use crate::lid::{LidGuard, LidInfo, LidLocks, LidSnapshot, LidTable};

/// Name ids of consecutive active files are this far apart, leaving room
/// for compaction targets to slot in directly after their source
pub(crate) const NAME_ID_STEP: NameId = 1 << 20;

/// Append-only, log-structured document store
///
/// ## Concurrency Model
///
/// - **Writes / removes**: serialized per lid by `lid_locks`; different lids
///   proceed in parallel and only meet at the active file's writer mutex
/// - **Reads**: pin a generation, look up the lid table, read from the file;
///   no store-wide lock is taken
/// - **Rotation**: new file is created outside any hot lock; `active` is
///   locked only for the pointer swap
/// - **Compaction**: re-validates each entry under its lid lock, so it is
///   linearized with ordinary writers of the same lid
pub struct LogDataStore {
    config: Config,
    dir: PathBuf,
    options: WriterOptions,

    generations: Arc<GenerationHandler>,
    lids: LidTable,
    lid_locks: LidLocks,

    /// Every file pair still on disk, retired ones included
    files: RwLock<BTreeMap<FileId, Arc<FileChunk>>>,

    /// The single writable file for feed traffic
    active: Mutex<Arc<FileChunk>>,

    /// Serializes file creation and rotation
    layout_lock: Mutex<()>,

    /// Files compacted away, waiting for readers to drain
    retired: Mutex<GenerationHoldList<Arc<FileChunk>>>,

    last_flushed_serial: AtomicU64,
}

impl LogDataStore {
    /// Open or create a store in `config.data_dir`
    ///
    /// On startup:
    /// 1. Discover `*.idx` files and order them by name id
    /// 2. Open each pair, scanning only its index stream
    /// 3. Replay entries in order; later entries win
    /// 4. Reopen the newest pair for appending (or create one)
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();

        // Step 1: Discover file pairs
        fs::create_dir_all(&config.data_dir)?;
        let mut name_ids: Vec<NameId> = Vec::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(name_id) = FileChunk::parse_name_id(&path) {
                    name_ids.push(name_id);
                }
            }
        }
        name_ids.sort_unstable();

        if name_ids.len() > LidInfo::MAX_FILE_ID as usize {
            return Err(StoreError::FileIdExhausted(LidInfo::MAX_FILE_ID));
        }

        let options = WriterOptions {
            sync: config.sync_strategy,
            max_chunk_bytes: config.max_chunk_bytes,
        };

        // Step 2: Open pairs; file ids start at 1 so no location packs to zero
        let mut ordered: Vec<Arc<FileChunk>> = Vec::with_capacity(name_ids.len() + 1);
        for (index, name_id) in name_ids.iter().enumerate() {
            let file_id = FileId(index as u32 + 1);
            let writable = (index + 1 == name_ids.len()).then_some(options);
            ordered.push(Arc::new(FileChunk::open(
                file_id,
                &config.data_dir,
                *name_id,
                writable,
            )?));
        }

        // Step 3: Rebuild the lid table
        let generations = Arc::new(GenerationHandler::new());
        let lids = LidTable::new(Arc::clone(&generations));
        let files: BTreeMap<FileId, Arc<FileChunk>> =
            ordered.iter().map(|f| (f.file_id(), Arc::clone(f))).collect();

        let mut replayed: u64 = 0;
        for file in &ordered {
            let mut failure = None;
            file.for_each_entry(|chunk_id, meta| {
                if failure.is_some() {
                    return;
                }
                let info = match LidInfo::new(file.file_id(), chunk_id, meta.size) {
                    Ok(info) => info,
                    Err(e) => {
                        failure = Some(e);
                        return;
                    }
                };
                let old = lids.get(meta.lid);
                if !old.is_empty() {
                    if let Some(previous) = files.get(&old.file_id()) {
                        previous.note_erased(old.size());
                    }
                }
                if info.is_empty() {
                    file.note_erased(0);
                }
                if let Err(e) = lids.set(meta.lid, info) {
                    failure = Some(e);
                }
                replayed += 1;
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }

        // Step 4: Active file
        let active = match ordered.last() {
            Some(file) => Arc::clone(file),
            None => Arc::new(FileChunk::create(
                FileId(1),
                &config.data_dir,
                NAME_ID_STEP,
                options,
            )?),
        };
        let mut files = files;
        files.insert(active.file_id(), Arc::clone(&active));

        let last_serial = files.values().map(|f| f.last_serial()).max().unwrap_or(0);

        tracing::info!(
            dir = %config.data_dir.display(),
            files = files.len(),
            entries = replayed,
            lid_limit = lids.limit(),
            last_serial,
            active = %active.file_id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "opened log data store"
        );

        Ok(Self {
            dir: config.data_dir.clone(),
            config,
            options,
            generations,
            lids,
            lid_locks: LidLocks::default(),
            files: RwLock::new(files),
            active: Mutex::new(active),
            layout_lock: Mutex::new(()),
            retired: Mutex::new(GenerationHoldList::new()),
            last_flushed_serial: AtomicU64::new(last_serial),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Feed Operations
    // =========================================================================

    /// Store `payload` as the new content of `lid`
    ///
    /// An empty payload leaves the lid reading as not-found, like a remove.
    pub fn write(&self, serial: SerialNum, lid: u32, payload: &[u8]) -> Result<()> {
        if lid >= LidTable::MAX_LIDS {
            return Err(StoreError::LidOutOfRange {
                lid,
                limit: LidTable::MAX_LIDS,
            });
        }

        let file = {
            let _lid_guard = self.lid_locks.lock(lid);
            let (file, chunk_id) = self.append_active(serial, lid, payload)?;
            let size = u32::try_from(payload.len()).map_err(|_| {
                StoreError::Config(format!("payload of {} bytes exceeds u32", payload.len()))
            })?;
            self.publish(lid, LidInfo::new(file.file_id(), chunk_id, size)?)?;
            file
        };

        self.rotate_if_full(&file)
    }

    /// Append a tombstone for `lid`
    pub fn remove(&self, serial: SerialNum, lid: u32) -> Result<()> {
        self.write(serial, lid, &[])
    }

    /// Current payload of `lid`, or `None` if absent or removed
    pub fn read(&self, lid: u32) -> Result<Option<Bytes>> {
        let _guard = self.generations.acquire();

        let info = self.lids.get(lid);
        if info.is_empty() {
            return Ok(None);
        }

        let file = self.file(info.file_id())?;
        file.read(info.chunk_id(), lid)
    }

    /// Pin the current generation for a series of consistent lookups
    pub fn lid_read_guard(&self) -> GenerationGuard {
        self.generations.acquire()
    }

    /// Generation-pinned view of the whole lid table
    pub fn lid_snapshot(&self) -> LidSnapshot {
        self.lids.snapshot()
    }

    /// Current location of `lid`
    pub fn lid_info(&self, lid: u32) -> LidInfo {
        self.lids.get(lid)
    }

    /// Stream every live entry to `f`, oldest file first
    pub fn visit(&self, mut f: impl FnMut(u32, &[u8]) -> Result<()>) -> Result<()> {
        let _guard = self.generations.acquire();

        let mut ordered: Vec<Arc<FileChunk>> = self.files.read().values().cloned().collect();
        ordered.sort_by_key(|file| file.name_id());

        for file in ordered {
            let mut live = LiveFilter {
                lids: &self.lids,
                file_id: file.file_id(),
                f: &mut f,
            };
            file.visit(&mut live)?;
        }
        Ok(())
    }

    /// Write the pending chunk of the active file and sync it
    ///
    /// Returns the highest serial number now durable.
    pub fn flush(&self) -> Result<SerialNum> {
        let active = self.active_file();
        let serial = active.flush()?;
        self.last_flushed_serial.fetch_max(serial, Ordering::AcqRel);
        tracing::debug!(serial, active = %active.file_id(), "flushed active file");
        Ok(self.last_flushed_serial())
    }

    /// Freeze the active file and start a new one
    pub fn rotate(&self) -> Result<FileId> {
        let _layout = self.layout_lock.lock();
        self.rotate_locked()
    }

    /// Free retired files and lid arrays no reader can still reach
    pub fn reclaim(&self) -> Result<()> {
        let oldest = self.generations.update_oldest_used_generation();
        let freed = self.retired.lock().reclaim(oldest);

        for file in freed {
            self.files.write().remove(&file.file_id());
            file.erase()?;
        }

        self.lids.reclaim();
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_file_id(&self) -> FileId {
        self.active.lock().file_id()
    }

    /// File pairs on disk, retired ones included
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Files waiting for readers to drain before they are erased
    pub fn retired_file_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Stats of every file pair, ordered by name id
    pub fn file_stats(&self) -> Vec<FileStats> {
        let mut stats: Vec<FileStats> = self.files.read().values().map(|f| f.stats()).collect();
        stats.sort_by_key(|s| s.name_id);
        stats
    }

    /// One past the highest lid ever written
    pub fn doc_id_limit(&self) -> u32 {
        self.lids.limit()
    }

    /// Highest serial number written, durable or not
    pub fn last_serial(&self) -> SerialNum {
        self.files
            .read()
            .values()
            .map(|f| f.last_serial())
            .max()
            .unwrap_or(0)
    }

    pub fn last_flushed_serial(&self) -> SerialNum {
        self.last_flushed_serial.load(Ordering::Acquire)
    }

    /// Bytes buffered in the active file's pending chunk
    pub fn pending_bytes(&self) -> usize {
        self.active_file().pending_bytes()
    }

    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        &self.generations
    }

    // =========================================================================
    // Crate Internals
    // =========================================================================

    pub(crate) fn active_file(&self) -> Arc<FileChunk> {
        Arc::clone(&self.active.lock())
    }

    pub(crate) fn file(&self, file_id: FileId) -> Result<Arc<FileChunk>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(StoreError::UnknownFile(file_id.0))
    }

    pub(crate) fn lock_lid(&self, lid: u32) -> LidGuard<'_> {
        self.lid_locks.lock(lid)
    }

    pub(crate) fn is_retired(&self, file_id: FileId) -> bool {
        self.retired.lock().iter().any(|f| f.file_id() == file_id)
    }

    /// Whether no other file on disk is older than `file_id`
    pub(crate) fn is_oldest(&self, file_id: FileId) -> Result<bool> {
        let files = self.files.read();
        let name_id = files
            .get(&file_id)
            .map(|f| f.name_id())
            .ok_or(StoreError::UnknownFile(file_id.0))?;
        Ok(files.values().all(|f| f.name_id() >= name_id))
    }

    /// Append to the active file, following rotations that race with us
    pub(crate) fn append_active(
        &self,
        serial: SerialNum,
        lid: u32,
        payload: &[u8],
    ) -> Result<(Arc<FileChunk>, u32)> {
        loop {
            let file = self.active_file();
            if let Some(chunk_id) = file.append(serial, lid, payload)? {
                return Ok((file, chunk_id));
            }
            // Frozen between pointer load and append; the swap already
            // published its successor.
        }
    }

    /// Point `lid` at `info` and charge the previous entry to its file
    ///
    /// The caller holds the lid lock.
    pub(crate) fn publish(&self, lid: u32, info: LidInfo) -> Result<()> {
        let old = self.lids.get(lid);
        self.lids.set(lid, info)?;

        if !old.is_empty() {
            self.file(old.file_id())?.note_erased(old.size());
        }
        if info.is_empty() {
            self.file(info.file_id())?.note_erased(0);
        }
        Ok(())
    }

    /// Drop `lid` from the lid table entirely; the caller holds the lid lock
    pub(crate) fn prune(&self, lid: u32, old: LidInfo) -> Result<()> {
        self.lids.clear(lid);
        if !old.is_empty() {
            self.file(old.file_id())?.note_erased(old.size());
        }
        Ok(())
    }

    pub(crate) fn rotate_if_full(&self, file: &Arc<FileChunk>) -> Result<()> {
        if !self.is_full(file) {
            return Ok(());
        }

        let _layout = self.layout_lock.lock();
        let active = self.active_file();
        // Someone else rotated already
        if !Arc::ptr_eq(&active, file) || !self.is_full(&active) {
            return Ok(());
        }
        self.rotate_locked().map(|_| ())
    }

    /// Past the size limit, or about to run out of addressable chunk ids
    fn is_full(&self, file: &FileChunk) -> bool {
        file.data_size() >= self.config.max_file_size
            || file.chunk_count() as u32 >= LidInfo::MAX_CHUNK_ID - 1
    }

    /// Create a writable file ordered directly after `source`
    pub(crate) fn create_compaction_target(&self, source: &FileChunk) -> Result<Arc<FileChunk>> {
        let _layout = self.layout_lock.lock();

        let name_id = {
            let files = self.files.read();
            let upper = files
                .values()
                .map(|f| f.name_id())
                .filter(|n| *n > source.name_id())
                .min()
                .unwrap_or(NameId::MAX);
            let taken = |n: NameId| files.values().any(|f| f.name_id() == n);

            let mut candidate = source.name_id() + 1;
            while candidate < upper && taken(candidate) {
                candidate += 1;
            }
            if candidate >= upper {
                return Err(StoreError::Config(format!(
                    "no name id free between {} and {}",
                    source.name_id(),
                    upper
                )));
            }
            candidate
        };

        let file = self.create_file(name_id)?;
        tracing::debug!(
            source = %source.file_id(),
            target = %file.file_id(),
            name_id,
            "created compaction target"
        );
        Ok(file)
    }

    /// Hand `file_id` to the hold list; it is erased once readers drain
    pub(crate) fn retire(&self, file_id: FileId) -> Result<()> {
        let file = self.file(file_id)?;
        let retire_at = self.generations.current_generation();
        self.retired.lock().hold(retire_at, file);
        self.generations.increment_generation();
        self.reclaim()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Rotate with `layout_lock` held
    fn rotate_locked(&self) -> Result<FileId> {
        let old = self.active_file();
        let next_name = {
            let files = self.files.read();
            let max = files.values().map(|f| f.name_id()).max().unwrap_or(0);
            (max / NAME_ID_STEP + 1) * NAME_ID_STEP
        };

        // Step 1: Create the new pair outside the active lock
        let new = self.create_file(next_name)?;

        // Step 2: Swap the pointer
        *self.active.lock() = Arc::clone(&new);

        // Step 3: Freeze the old pair; appends racing with us see `None`
        // and retry against the new active file
        old.freeze()?;

        tracing::info!(
            old = %old.file_id(),
            new = %new.file_id(),
            name_id = next_name,
            old_bytes = old.data_size(),
            "rotated active file"
        );
        Ok(new.file_id())
    }

    /// Allocate a file id and create a writable pair; `layout_lock` held
    fn create_file(&self, name_id: NameId) -> Result<Arc<FileChunk>> {
        let file_id = {
            let files = self.files.read();
            (1..=LidInfo::MAX_FILE_ID)
                .map(FileId)
                .find(|id| !files.contains_key(id))
                .ok_or(StoreError::FileIdExhausted(LidInfo::MAX_FILE_ID))?
        };

        let file = Arc::new(FileChunk::create(file_id, &self.dir, name_id, self.options)?);
        self.files.write().insert(file_id, Arc::clone(&file));
        Ok(file)
    }
}

/// Forwards only entries that are still the current location of their lid
struct LiveFilter<'a, F> {
    lids: &'a LidTable,
    file_id: FileId,
    f: &'a mut F,
}

impl<'a, F> ChunkVisitor for LiveFilter<'a, F>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    fn visit(&mut self, chunk_id: u32, lid: u32, payload: &[u8]) -> Result<()> {
        let size = payload.len() as u32;
        let expected = LidInfo::new(self.file_id, chunk_id, size)?;
        if size > 0 && self.lids.get(lid) == expected {
            (self.f)(lid, payload)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDataStore")
            .field("dir", &self.dir)
            .field("active", &self.active_file_id())
            .field("files", &self.file_count())
            .finish()
    }
}
