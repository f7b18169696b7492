//! Ordered, partitioned set of discovered files.
//!
//! Paths are kept as a gzip blob so that a large listing stays small inside
//! a task descriptor. Tasks only reference entries by index.
//!
//! Blob layout, before compression:
//!
//! ```text
//! u32 BE count
//! count x { u32 BE byte length, utf-8 bytes }
//! ```

use crate::error::IngestError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};

/// Position of a file in the set and its size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: usize,
    pub size: u64,
}

/// Accumulates discovered files in order, then partitions them.
#[derive(Debug, Clone)]
pub struct FileSetBuilder {
    paths: Vec<String>,
    sizes: Vec<u64>,
    limit: usize,
    min_task_size: u64,
}

impl Default for FileSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSetBuilder {
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            sizes: Vec::new(),
            limit: usize::MAX,
            min_task_size: 0,
        }
    }

    pub fn limit_total_file_count(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_task_size(mut self, bytes: u64) -> Self {
        self.min_task_size = bytes;
        self
    }

    /// Appends a file. Returns `false`, and drops the file, once the limit is reached.
    pub fn add(&mut self, path: impl Into<String>, size: u64) -> bool {
        if !self.needs_more() {
            return false;
        }
        self.paths.push(path.into());
        self.sizes.push(size);
        true
    }

    pub fn size(&self) -> usize {
        self.paths.len()
    }

    pub fn needs_more(&self) -> bool {
        self.paths.len() < self.limit
    }

    /// Encodes the paths and groups entries greedily, in order: a group is
    /// closed as soon as its total size reaches `min_task_size`.
    pub fn build(self) -> Result<FileSet, IngestError> {
        let mut tasks = Vec::new();
        let mut current = Vec::new();
        let mut accumulated = 0u64;

        for (index, &size) in self.sizes.iter().enumerate() {
            current.push(Entry { index, size });
            accumulated = accumulated.saturating_add(size);
            if accumulated >= self.min_task_size {
                tasks.push(std::mem::take(&mut current));
                accumulated = 0;
            }
        }
        if !current.is_empty() {
            tasks.push(current);
        }

        Ok(FileSet {
            data: encode_paths(&self.paths)?,
            tasks,
            last: self.paths.last().cloned(),
        })
    }
}

/// Immutable result of discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(with = "base64_blob")]
    data: Vec<u8>,
    tasks: Vec<Vec<Entry>>,
    #[serde(default)]
    last: Option<String>,
}

impl FileSet {
    pub fn empty() -> Result<Self, IngestError> {
        FileSetBuilder::new().build()
    }

    /// Number of files across all tasks.
    pub fn len(&self) -> usize {
        self.tasks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> &[Vec<Entry>] {
        &self.tasks
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.tasks.iter().flatten()
    }

    /// Total size in bytes of every file in the set.
    pub fn total_size(&self) -> u64 {
        self.entries().map(|e| e.size).sum()
    }

    /// All paths, in discovery order.
    pub fn paths(&self) -> Result<Vec<String>, IngestError> {
        decode_paths(&self.data)
    }

    /// Paths of one task, decoding only as far as its last entry.
    pub fn task_paths(&self, task: usize) -> Result<Vec<String>, IngestError> {
        let entries = self.tasks.get(task).ok_or_else(|| {
            IngestError::Decode(format!(
                "task index {} out of range ({} tasks)",
                task,
                self.tasks.len()
            ))
        })?;
        let wanted: BTreeSet<usize> = entries.iter().map(|e| e.index).collect();
        decode_selected(&self.data, &wanted)
    }

    /// Last path added during discovery.
    pub fn last_path(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Last path, or `previous` when nothing was discovered.
    pub fn last_path_or(&self, previous: Option<&str>) -> Option<String> {
        self.last
            .clone()
            .or_else(|| previous.map(str::to_string))
    }
}

/// Gzip-compresses a path list in the blob layout.
pub fn encode_paths(paths: &[String]) -> Result<Vec<u8>, IngestError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&len_prefix(paths.len())?)?;
    for path in paths {
        encoder.write_all(&len_prefix(path.len())?)?;
        encoder.write_all(path.as_bytes())?;
    }
    Ok(encoder.finish()?)
}

fn len_prefix(len: usize) -> Result<[u8; 4], IngestError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| IngestError::Decode(format!("length {len} does not fit in u32")))
}

/// Decodes every path of a blob.
pub fn decode_paths(data: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut reader = PathReader::new(data)?;
    let mut paths = Vec::with_capacity(reader.remaining.min(1 << 16));
    while let Some(path) = reader.next_path()? {
        paths.push(path);
    }
    reader.expect_end()?;
    Ok(paths)
}

fn decode_selected(data: &[u8], wanted: &BTreeSet<usize>) -> Result<Vec<String>, IngestError> {
    let Some(&last_wanted) = wanted.last() else {
        return Ok(Vec::new());
    };
    let mut reader = PathReader::new(data)?;
    if last_wanted >= reader.remaining {
        return Err(IngestError::Decode(format!(
            "entry {} out of range ({} paths)",
            last_wanted, reader.remaining
        )));
    }

    let mut selected = Vec::with_capacity(wanted.len());
    for index in 0..=last_wanted {
        match reader.next_path()? {
            Some(path) if wanted.contains(&index) => selected.push(path),
            Some(_) => {}
            None => break,
        }
    }
    Ok(selected)
}

struct PathReader<'a> {
    decoder: GzDecoder<&'a [u8]>,
    remaining: usize,
}

impl<'a> PathReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self, IngestError> {
        let mut decoder = GzDecoder::new(data);
        let remaining = read_u32(&mut decoder, "path count")? as usize;
        Ok(Self { decoder, remaining })
    }

    fn next_path(&mut self) -> Result<Option<String>, IngestError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let len = read_u32(&mut self.decoder, "path length")? as usize;
        let mut buf = Vec::with_capacity(len.min(4096));
        (&mut self.decoder)
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| IngestError::Decode(format!("corrupt path data: {e}")))?;
        if buf.len() != len {
            return Err(IngestError::Decode(format!(
                "truncated path: expected {} bytes, got {}",
                len,
                buf.len()
            )));
        }
        self.remaining -= 1;
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| IngestError::Decode(format!("path is not valid utf-8: {e}")))
    }

    fn expect_end(&mut self) -> Result<(), IngestError> {
        let mut peek = [0u8; 1];
        match self.decoder.read(&mut peek) {
            Ok(0) => Ok(()),
            Ok(_) => Err(IngestError::Decode("trailing data after last path".to_string())),
            Err(e) => Err(IngestError::Decode(format!("corrupt trailer: {e}"))),
        }
    }
}

fn read_u32(reader: &mut impl Read, what: &str) -> Result<u32, IngestError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| IngestError::Decode(format!("failed to read {what}: {e}")))?;
    Ok(u32::from_be_bytes(buf))
}

mod base64_blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
