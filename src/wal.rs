//! Write-ahead log: every acknowledged write is appended here before it is
//! visible anywhere else, and replayed at open until a clean close clears it.

use crate::error::DbError;
use crate::telemetry::db_metrics;
use crate::types::{sorted_tag_pairs, Sample, TagSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Recovery sanity limits. A record violating any of these truncates
/// recovery at that offset; the valid prefix is kept.
const MAX_METRIC_LEN: usize = 1024;
const MAX_TAG_COUNT: usize = 100;
const MAX_TAG_STR_LEN: usize = 256;

/// Result of replaying the log: the decoded prefix, plus the byte offset of
/// the first malformed or incomplete record if the file had a damaged tail.
#[derive(Debug)]
pub struct RecoveredLog {
    pub samples: Vec<Sample>,
    pub truncated_at: Option<u64>,
}

/// Append-only log of framed samples.
///
/// Record layout (all integers and floats little-endian):
/// `entry_size: u32` followed by exactly `entry_size` payload bytes:
/// `sequence: u64, timestamp: u64, value: f64, metric_len: u32, metric,
/// tag_count: u32, (key_len: u32, key, value_len: u32, value) x tag_count`.
///
/// All append paths run under the engine's WAL mutex; `recover` runs only
/// at open, before any producer exists.
#[derive(Debug)]
pub struct WriteAheadLog {
    log_path: PathBuf,
    log_file: Option<BufWriter<File>>,
    next_sequence: u64,
}

impl WriteAheadLog {
    /// Opens (or creates) `wal.log` under the database directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DbError> {
        let log_path = dir.as_ref().join("wal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(DbError::Io)?;

        Ok(WriteAheadLog {
            log_path,
            log_file: Some(BufWriter::new(file)),
            next_sequence: 0,
        })
    }

    /// Appends one sample and returns the sequence number it was assigned.
    ///
    /// A failure here breaks the durability contract: the caller must treat
    /// it as fatal for the acknowledging write, not retry past it.
    pub fn append(&mut self, sample: &Sample) -> Result<u64, DbError> {
        let seq = self.next_sequence;
        let record = encode_record(seq, sample);
        let file = self
            .log_file
            .as_mut()
            .ok_or_else(|| DbError::Internal("WAL file not open".to_string()))?;
        file.write_all(&record)?;
        file.flush()?;
        self.next_sequence += 1;
        db_metrics::record_wal_bytes_written(record.len() as u64);
        Ok(seq)
    }

    /// Appends a batch of samples under one buffered write, flushing once.
    pub fn append_batch(&mut self, samples: &[Sample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }
        let file = self
            .log_file
            .as_mut()
            .ok_or_else(|| DbError::Internal("WAL file not open".to_string()))?;
        let mut bytes = 0u64;
        for sample in samples {
            let record = encode_record(self.next_sequence, sample);
            file.write_all(&record)?;
            self.next_sequence += 1;
            bytes += record.len() as u64;
        }
        file.flush()?;
        db_metrics::record_wal_bytes_written(bytes);
        Ok(())
    }

    /// Replays the log from the start, in sequence order.
    ///
    /// Never fails: a missing file yields an empty result, and the first
    /// malformed or incomplete record cuts recovery at that offset. The
    /// sequence counter resumes past the highest sequence seen.
    pub fn recover(&mut self) -> RecoveredLog {
        let buf = match fs::read(&self.log_path) {
            Ok(buf) => buf,
            Err(_) => {
                return RecoveredLog {
                    samples: Vec::new(),
                    truncated_at: None,
                }
            }
        };

        let mut samples = Vec::new();
        let mut truncated_at = None;
        let mut max_sequence: Option<u64> = None;
        let mut offset = 0usize;

        while offset < buf.len() {
            if offset + 4 > buf.len() {
                truncated_at = Some(offset as u64);
                break;
            }
            let mut size_bytes = [0u8; 4];
            size_bytes.copy_from_slice(&buf[offset..offset + 4]);
            let entry_size = u32::from_le_bytes(size_bytes) as usize;
            if entry_size == 0 || offset + 4 + entry_size > buf.len() {
                truncated_at = Some(offset as u64);
                break;
            }
            let payload = &buf[offset + 4..offset + 4 + entry_size];
            match decode_record(payload) {
                Some((seq, sample)) => {
                    max_sequence = Some(max_sequence.map_or(seq, |m: u64| m.max(seq)));
                    samples.push(sample);
                    offset += 4 + entry_size;
                }
                None => {
                    truncated_at = Some(offset as u64);
                    break;
                }
            }
        }

        if let Some(max) = max_sequence {
            self.next_sequence = max + 1;
        }

        RecoveredLog {
            samples,
            truncated_at,
        }
    }

    /// Flushes all pending bytes to stable storage.
    pub fn checkpoint(&mut self) -> Result<(), DbError> {
        if let Some(file) = self.log_file.as_mut() {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Truncates the log and resets the sequence counter to 0.
    ///
    /// Only safe once everything previously appended is durably reflected
    /// in sealed chunk files.
    pub fn clear(&mut self) -> Result<(), DbError> {
        self.log_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)
            .map_err(DbError::Io)?;
        file.sync_data()?;
        drop(file);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(DbError::Io)?;
        self.log_file = Some(BufWriter::new(file));
        self.next_sequence = 0;
        Ok(())
    }

    /// Flushes and releases the file handle (used before directory removal).
    pub fn close(&mut self) -> Result<(), DbError> {
        if let Some(file) = self.log_file.as_mut() {
            file.flush()?;
        }
        self.log_file = None;
        Ok(())
    }

    /// Next sequence number that `append` would assign.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

fn encode_record(sequence: u64, sample: &Sample) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + sample.metric.len());
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(&sample.timestamp.to_le_bytes());
    payload.extend_from_slice(&sample.value.to_le_bytes());

    let metric = sample.metric.as_bytes();
    payload.extend_from_slice(&(metric.len() as u32).to_le_bytes());
    payload.extend_from_slice(metric);

    let pairs = sorted_tag_pairs(&sample.tags);
    payload.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (key, value) in pairs {
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
    }

    let mut record = Vec::with_capacity(4 + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    record
}

fn decode_record(payload: &[u8]) -> Option<(u64, Sample)> {
    let mut cur = std::io::Cursor::new(payload);

    let sequence = read_u64(&mut cur)?;
    let timestamp = read_u64(&mut cur)?;
    let value = f64::from_le_bytes(read_u64(&mut cur)?.to_le_bytes());

    let metric_len = read_u32(&mut cur)? as usize;
    if metric_len > MAX_METRIC_LEN {
        return None;
    }
    let metric = read_string(&mut cur, metric_len)?;

    let tag_count = read_u32(&mut cur)? as usize;
    if tag_count > MAX_TAG_COUNT {
        return None;
    }
    let mut tags = TagSet::with_capacity(tag_count);
    for _ in 0..tag_count {
        let key_len = read_u32(&mut cur)? as usize;
        if key_len > MAX_TAG_STR_LEN {
            return None;
        }
        let key = read_string(&mut cur, key_len)?;
        let value_len = read_u32(&mut cur)? as usize;
        if value_len > MAX_TAG_STR_LEN {
            return None;
        }
        let value = read_string(&mut cur, value_len)?;
        tags.insert(key, value);
    }

    Some((
        sequence,
        Sample {
            metric,
            timestamp,
            value,
            tags,
        },
    ))
}

fn read_u64(cur: &mut std::io::Cursor<&[u8]>) -> Option<u64> {
    let mut b = [0u8; 8];
    cur.read_exact(&mut b).ok()?;
    Some(u64::from_le_bytes(b))
}

fn read_u32(cur: &mut std::io::Cursor<&[u8]>) -> Option<u32> {
    let mut b = [0u8; 4];
    cur.read_exact(&mut b).ok()?;
    Some(u32::from_le_bytes(b))
}

fn read_string(cur: &mut std::io::Cursor<&[u8]>, len: usize) -> Option<String> {
    let mut b = vec![0u8; len];
    cur.read_exact(&mut b).ok()?;
    String::from_utf8(b).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::tempdir;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn append_then_recover_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();

        let s1 = Sample::with_tags("cpu", 100, 1.5, tags(&[("host", "a")]));
        let s2 = Sample::with_tags("cpu", 90, 2.5, tags(&[("host", "b"), ("region", "eu")]));
        let s3 = Sample::new("mem", 110, 3.5);

        assert_eq!(wal.append(&s1).unwrap(), 0);
        assert_eq!(wal.append(&s2).unwrap(), 1);
        assert_eq!(wal.append(&s3).unwrap(), 2);
        wal.checkpoint().unwrap();
        drop(wal);

        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        let recovered = wal.recover();
        assert!(recovered.truncated_at.is_none());
        assert_eq!(recovered.samples, vec![s1, s2, s3]);
        assert_eq!(wal.next_sequence(), 3);
    }

    #[test]
    fn append_batch_assigns_monotone_sequences() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();

        let batch: Vec<Sample> = (0..10).map(|i| Sample::new("m", i, i as f64)).collect();
        wal.append_batch(&batch).unwrap();
        assert_eq!(wal.next_sequence(), 10);

        let recovered = wal.recover();
        assert_eq!(recovered.samples.len(), 10);
        for (i, s) in recovered.samples.iter().enumerate() {
            assert_eq!(s.timestamp, i as u64);
        }
    }

    #[test]
    fn incomplete_trailing_record_is_cut() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        wal.append(&Sample::new("cpu", 1, 1.0)).unwrap();
        wal.append(&Sample::new("cpu", 2, 2.0)).unwrap();
        wal.checkpoint().unwrap();
        drop(wal);

        // Chop a few bytes off the tail to simulate a torn write.
        let path = dir.path().join("wal.log");
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        let recovered = wal.recover();
        assert_eq!(recovered.samples.len(), 1);
        assert_eq!(recovered.samples[0].timestamp, 1);
        assert!(recovered.truncated_at.is_some());
    }

    #[test]
    fn oversized_metric_len_truncates_recovery() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        wal.append(&Sample::new("cpu", 1, 1.0)).unwrap();
        wal.checkpoint().unwrap();
        drop(wal);

        // Hand-craft a second record whose metric_len exceeds the limit but
        // whose frame is otherwise intact.
        let path = dir.path().join("wal.log");
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&2u64.to_le_bytes());
        payload.extend_from_slice(&2.0f64.to_le_bytes());
        payload.extend_from_slice(&2048u32.to_le_bytes());
        payload.extend_from_slice(&vec![b'x'; 2048]);
        payload.extend_from_slice(&0u32.to_le_bytes());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();
        let bad_offset = file.stream_position().unwrap() - (payload.len() as u64 + 4);
        drop(file);

        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        let recovered = wal.recover();
        assert_eq!(recovered.samples.len(), 1);
        assert_eq!(recovered.truncated_at, Some(bad_offset));
    }

    #[test]
    fn clear_truncates_and_resets_sequence() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        wal.append(&Sample::new("cpu", 1, 1.0)).unwrap();
        wal.append(&Sample::new("cpu", 2, 2.0)).unwrap();
        wal.clear().unwrap();

        assert_eq!(wal.next_sequence(), 0);
        let recovered = wal.recover();
        assert!(recovered.samples.is_empty());
        assert_eq!(fs::metadata(dir.path().join("wal.log")).unwrap().len(), 0);

        // The log accepts appends again after a clear.
        assert_eq!(wal.append(&Sample::new("cpu", 3, 3.0)).unwrap(), 0);
    }

    #[test]
    fn recover_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let mut wal = WriteAheadLog::open(dir.path()).unwrap();
        fs::remove_file(dir.path().join("wal.log")).unwrap();
        let recovered = wal.recover();
        assert!(recovered.samples.is_empty());
        assert!(recovered.truncated_at.is_none());
    }
}
