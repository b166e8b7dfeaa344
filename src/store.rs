//! Chunk store: one file per sealed chunk, named `<metric>_<id>.chunk`,
//! serialized with the chunk's byte-precise layout.

use crate::chunk::ColumnarChunk;
use crate::error::DbError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Per-metric chunk file persistence under one database directory.
///
/// File operations are independent per file; callers serialize deletions
/// against sealing via the chunks lock.
#[derive(Debug)]
pub struct ChunkStore {
    base_path: PathBuf,
}

impl ChunkStore {
    /// Binds the store to a directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self, DbError> {
        fs::create_dir_all(&base_path)?;
        Ok(ChunkStore {
            base_path: base_path.as_ref().to_path_buf(),
        })
    }

    fn chunk_path(&self, metric: &str, chunk_id: u64) -> PathBuf {
        self.base_path.join(format!("{}_{}.chunk", metric, chunk_id))
    }

    /// Writes one chunk file and flushes it to stable storage.
    pub fn save_chunk(
        &self,
        metric: &str,
        chunk_id: u64,
        chunk: &ColumnarChunk,
    ) -> Result<(), DbError> {
        let data = chunk.serialize()?;
        let path = self.chunk_path(metric, chunk_id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(DbError::Io)?;
        file.write_all(&data)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads and deserializes one chunk. A missing file yields `Ok(None)`;
    /// a corrupt file yields `Err` so the caller can emit a diagnostic and
    /// continue with a best-effort subset.
    pub fn load_chunk(&self, metric: &str, chunk_id: u64) -> Result<Option<ColumnarChunk>, DbError> {
        let path = self.chunk_path(metric, chunk_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DbError::Io(e)),
        };
        if data.is_empty() {
            return Ok(None);
        }
        ColumnarChunk::deserialize(&data).map(Some)
    }

    /// Removes every chunk file belonging to `metric`.
    pub fn delete_chunks(&self, metric: &str) -> Result<(), DbError> {
        let prefix = format!("{}_", metric);
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".chunk") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Sorted ids of the chunk files present for `metric`. Files whose id
    /// part does not parse are skipped.
    pub fn list_chunks(&self, metric: &str) -> Result<Vec<u64>, DbError> {
        let prefix = format!("{}_", metric);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(id_str) = rest.strip_suffix(".chunk") {
                    if let Ok(id) = id_str.parse::<u64>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}
