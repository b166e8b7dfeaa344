//! Column codecs: timestamp delta encoding, run-length encoding for values,
//! bit-packing for small integers, and the per-flush codec selector.
//!
//! Encoded blocks carry a header with the codec identifier (a short UTF-8
//! string), the uncompressed element count, and a CRC32 of the encoded
//! bytes; decompression verifies both before decoding.

use crate::error::DbError;
use std::collections::HashMap;
use std::io::Read;

/// The codec set. The selector is a pure function of the column: timestamps
/// always take `Delta`; values take `Rle` when the run heuristics fire and
/// `None` otherwise. `BitPack` is available for integer columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Delta,
    Rle,
    BitPack,
    None,
}

impl CodecKind {
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Delta => "delta",
            CodecKind::Rle => "rle",
            CodecKind::BitPack => "bitpacking",
            CodecKind::None => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<CodecKind> {
        match name {
            "delta" => Some(CodecKind::Delta),
            "rle" => Some(CodecKind::Rle),
            "bitpacking" => Some(CodecKind::BitPack),
            "none" => Some(CodecKind::None),
            _ => Option::None,
        }
    }
}

/// Metadata recorded alongside each compressed column.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    /// Codec identifier as a short UTF-8 string (`"delta"`, `"rle"`, ...).
    pub codec: String,
    pub uncompressed_count: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone)]
pub struct CompressedBlock {
    pub header: BlockHeader,
    pub data: Vec<u8>,
}

impl CompressedBlock {
    fn new(codec: CodecKind, uncompressed_count: usize, data: Vec<u8>) -> Self {
        CompressedBlock {
            header: BlockHeader {
                codec: codec.name().to_string(),
                uncompressed_count: uncompressed_count as u64,
                checksum: crc32fast::hash(&data),
            },
            data,
        }
    }

    fn verify(&self) -> Result<CodecKind, DbError> {
        let codec = CodecKind::from_name(&self.header.codec).ok_or_else(|| DbError::Corruption {
            details: format!("Unknown codec identifier {:?}", self.header.codec),
            metric: None,
            timestamp: None,
        })?;
        if crc32fast::hash(&self.data) != self.header.checksum {
            return Err(DbError::Corruption {
                details: "Compressed block checksum mismatch".to_string(),
                metric: None,
                timestamp: None,
            });
        }
        Ok(codec)
    }
}

/// Both columns of a chunk in compressed form.
#[derive(Debug, Clone)]
pub struct CompressedColumns {
    pub timestamps: CompressedBlock,
    pub values: CompressedBlock,
}

/// Timestamps are always delta encoded.
pub fn select_timestamp_codec(_timestamps: &[u64]) -> CodecKind {
    CodecKind::Delta
}

/// RLE when unique-value cardinality is below count/10 or identical-value
/// runs cover more than half the column; raw otherwise. Short columns are
/// never worth the run bookkeeping.
pub fn select_value_codec(values: &[f64]) -> CodecKind {
    let count = values.len();
    if count < 10 {
        return CodecKind::None;
    }

    let mut value_counts: HashMap<u64, usize> = HashMap::new();
    for v in values {
        *value_counts.entry(v.to_bits()).or_insert(0) += 1;
    }
    if value_counts.len() < count / 10 {
        return CodecKind::Rle;
    }

    let mut run_coverage = 0usize;
    let mut i = 0usize;
    while i < count {
        let mut run = 1usize;
        while i + run < count && values[i + run].to_bits() == values[i].to_bits() {
            run += 1;
        }
        if run > 1 {
            run_coverage += run;
        }
        i += run;
    }
    if run_coverage > count / 2 {
        return CodecKind::Rle;
    }

    CodecKind::None
}

/// Applies the selector policy to both columns.
pub fn compress_columns(timestamps: &[u64], values: &[f64]) -> CompressedColumns {
    let ts_block = CompressedBlock::new(
        CodecKind::Delta,
        timestamps.len(),
        compress_timestamps(timestamps),
    );
    let value_codec = select_value_codec(values);
    let value_bytes = match value_codec {
        CodecKind::Rle => compress_doubles_rle(values),
        _ => encode_doubles_raw(values),
    };
    let values_block = CompressedBlock::new(value_codec, values.len(), value_bytes);
    CompressedColumns {
        timestamps: ts_block,
        values: values_block,
    }
}

/// Verifies headers and decodes both columns.
pub fn decompress_columns(columns: &CompressedColumns) -> Result<(Vec<u64>, Vec<f64>), DbError> {
    let ts_codec = columns.timestamps.verify()?;
    let timestamps = match ts_codec {
        CodecKind::Delta => decompress_timestamps(&columns.timestamps.data)?,
        other => {
            return Err(DbError::Corruption {
                details: format!("Timestamp column encoded with {:?}", other.name()),
                metric: None,
                timestamp: None,
            })
        }
    };
    if timestamps.len() as u64 != columns.timestamps.header.uncompressed_count {
        return Err(DbError::Corruption {
            details: "Timestamp column count mismatch".to_string(),
            metric: None,
            timestamp: None,
        });
    }

    let value_codec = columns.values.verify()?;
    let values = match value_codec {
        CodecKind::Rle => decompress_doubles_rle(&columns.values.data)?,
        CodecKind::None => decode_doubles_raw(&columns.values.data),
        other => {
            return Err(DbError::Corruption {
                details: format!("Value column encoded with {:?}", other.name()),
                metric: None,
                timestamp: None,
            })
        }
    };
    if values.len() as u64 != columns.values.header.uncompressed_count {
        return Err(DbError::Corruption {
            details: "Value column count mismatch".to_string(),
            metric: None,
            timestamp: None,
        });
    }

    Ok((timestamps, values))
}

// --- delta-of-timestamps ---

/// Layout: `t0 u64 | count u64 | bytes_per_delta u8 | deltas`, all
/// little-endian. The delta width is the smallest of {1, 2, 4, 8} bytes
/// that expresses `max |d|` as a signed value.
pub fn compress_timestamps(timestamps: &[u64]) -> Vec<u8> {
    if timestamps.is_empty() {
        return Vec::new();
    }

    let deltas: Vec<i64> = timestamps
        .windows(2)
        .map(|w| w[1].wrapping_sub(w[0]) as i64)
        .collect();
    let max_abs = deltas.iter().map(|d| d.unsigned_abs()).max().unwrap_or(0);
    let bytes_per_delta: u8 = if max_abs <= i8::MAX as u64 {
        1
    } else if max_abs <= i16::MAX as u64 {
        2
    } else if max_abs <= i32::MAX as u64 {
        4
    } else {
        8
    };

    let mut out = Vec::with_capacity(17 + deltas.len() * bytes_per_delta as usize);
    out.extend_from_slice(&timestamps[0].to_le_bytes());
    out.extend_from_slice(&(timestamps.len() as u64).to_le_bytes());
    out.push(bytes_per_delta);
    for d in deltas {
        match bytes_per_delta {
            1 => out.extend_from_slice(&(d as i8).to_le_bytes()),
            2 => out.extend_from_slice(&(d as i16).to_le_bytes()),
            4 => out.extend_from_slice(&(d as i32).to_le_bytes()),
            _ => out.extend_from_slice(&d.to_le_bytes()),
        }
    }
    out
}

pub fn decompress_timestamps(data: &[u8]) -> Result<Vec<u64>, DbError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let corrupt = |details: &str| DbError::Corruption {
        details: details.to_string(),
        metric: None,
        timestamp: None,
    };

    let mut cur = std::io::Cursor::new(data);
    let first = read_u64_le(&mut cur).ok_or_else(|| corrupt("Delta block too short"))?;
    let count = read_u64_le(&mut cur).ok_or_else(|| corrupt("Delta block too short"))? as usize;
    let mut width = [0u8; 1];
    cur.read_exact(&mut width)
        .map_err(|_| corrupt("Delta block too short"))?;
    let width = width[0] as usize;
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(corrupt("Invalid delta width"));
    }
    if count == 0 {
        return Err(corrupt("Delta block with zero count"));
    }
    let expected = (count - 1) * width;
    let body = &data[cur.position() as usize..];
    if body.len() != expected {
        return Err(corrupt("Delta block length mismatch"));
    }

    let mut out = Vec::with_capacity(count);
    out.push(first);
    let mut current = first;
    for raw in body.chunks_exact(width) {
        let delta: i64 = match width {
            1 => i8::from_le_bytes([raw[0]]) as i64,
            2 => i16::from_le_bytes([raw[0], raw[1]]) as i64,
            4 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            _ => i64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
        };
        current = current.wrapping_add(delta as u64);
        out.push(current);
    }
    Ok(out)
}

// --- run-length values ---

/// Layout: `count u64 | (run_len u16, value f64) x runs`. Runs compare by
/// bit pattern so NaN payloads and signed zeroes survive the round trip.
pub fn compress_doubles_rle(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&(values.len() as u64).to_le_bytes());

    let mut i = 0usize;
    while i < values.len() {
        let bits = values[i].to_bits();
        let mut run = 1usize;
        while i + run < values.len() && values[i + run].to_bits() == bits && run < u16::MAX as usize
        {
            run += 1;
        }
        out.extend_from_slice(&(run as u16).to_le_bytes());
        out.extend_from_slice(&values[i].to_le_bytes());
        i += run;
    }
    out
}

pub fn decompress_doubles_rle(data: &[u8]) -> Result<Vec<f64>, DbError> {
    let corrupt = |details: &str| DbError::Corruption {
        details: details.to_string(),
        metric: None,
        timestamp: None,
    };
    let mut cur = std::io::Cursor::new(data);
    let count = read_u64_le(&mut cur).ok_or_else(|| corrupt("RLE block too short"))? as usize;

    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let mut run_bytes = [0u8; 2];
        cur.read_exact(&mut run_bytes)
            .map_err(|_| corrupt("RLE block truncated"))?;
        let run = u16::from_le_bytes(run_bytes) as usize;
        let mut value_bytes = [0u8; 8];
        cur.read_exact(&mut value_bytes)
            .map_err(|_| corrupt("RLE block truncated"))?;
        let value = f64::from_le_bytes(value_bytes);
        if run == 0 || out.len() + run > count {
            return Err(corrupt("RLE run overruns declared count"));
        }
        out.extend(std::iter::repeat(value).take(run));
    }
    Ok(out)
}

// --- raw doubles (codec "none") ---

fn encode_doubles_raw(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_doubles_raw(data: &[u8]) -> Vec<f64> {
    data.chunks_exact(8)
        .map(|raw| {
            f64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ])
        })
        .collect()
}

// --- bit-packing for small integers ---

/// Layout: `count u64 | bit_width u8 | packed bits, LSB-first`. The width
/// is the smallest that holds the column maximum.
pub fn pack_integers(values: &[u64]) -> Vec<u8> {
    let max = values.iter().copied().max().unwrap_or(0);
    let bit_width: u32 = if max == 0 { 1 } else { 64 - max.leading_zeros() };

    let total_bits = values.len() * bit_width as usize;
    let mut out = Vec::with_capacity(9 + total_bits.div_ceil(8));
    out.extend_from_slice(&(values.len() as u64).to_le_bytes());
    out.push(bit_width as u8);

    // 128-bit accumulator: at most 7 leftover bits plus a 64-bit value.
    let mut acc: u128 = 0;
    let mut filled: u32 = 0;
    for &v in values {
        acc |= (v as u128) << filled;
        filled += bit_width;
        while filled >= 8 {
            out.push((acc & 0xff) as u8);
            acc >>= 8;
            filled -= 8;
        }
    }
    if filled > 0 {
        out.push((acc & 0xff) as u8);
    }
    out
}

pub fn unpack_integers(data: &[u8]) -> Result<Vec<u64>, DbError> {
    let corrupt = |details: &str| DbError::Corruption {
        details: details.to_string(),
        metric: None,
        timestamp: None,
    };
    let mut cur = std::io::Cursor::new(data);
    let count = read_u64_le(&mut cur).ok_or_else(|| corrupt("Bit-pack block too short"))? as usize;
    let mut width_byte = [0u8; 1];
    cur.read_exact(&mut width_byte)
        .map_err(|_| corrupt("Bit-pack block too short"))?;
    let bit_width = width_byte[0] as u32;
    if bit_width == 0 || bit_width > 64 {
        return Err(corrupt("Invalid bit width"));
    }

    let body = &data[cur.position() as usize..];
    let needed_bits = count * bit_width as usize;
    if body.len() * 8 < needed_bits {
        return Err(corrupt("Bit-pack block truncated"));
    }

    let mut out = Vec::with_capacity(count);
    let mut acc: u128 = 0;
    let mut filled: u32 = 0;
    let mut bytes = body.iter();
    let mask: u128 = if bit_width == 64 {
        u64::MAX as u128
    } else {
        (1u128 << bit_width) - 1
    };
    for _ in 0..count {
        while filled < bit_width {
            let byte = *bytes
                .next()
                .ok_or_else(|| corrupt("Bit-pack block truncated"))?;
            acc |= (byte as u128) << filled;
            filled += 8;
        }
        out.push((acc & mask) as u64);
        acc >>= bit_width;
        filled -= bit_width;
    }
    Ok(out)
}

fn read_u64_le(cur: &mut std::io::Cursor<&[u8]>) -> Option<u64> {
    let mut b = [0u8; 8];
    cur.read_exact(&mut b).ok()?;
    Some(u64::from_le_bytes(b))
}
