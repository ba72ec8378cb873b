//! Archive decoding and validation.
//!
//! [`ArchiveReader::parse`] accepts a blob only if every declared length fits
//! in the remaining input, every length-delimited region is consumed exactly,
//! every bytecode index names an existing table entry, every table entry
//! hashes to its recorded content hash, and no bytes trail the last table.

use xxhash_rust::xxh3::xxh3_64;

use super::ResourceKind;
use super::serializer::{ARCHIVE_FORMAT_VERSION, ARCHIVE_MAGIC};
use crate::backend::BackendType;
use crate::errors::{EmberError, Result};

/// Per-backend payload of a decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendData {
    /// Raw bytes (resource signatures, render passes).
    Inline(Vec<u8>),
    /// Indices into the backend's bytecode table (shaders, pipelines).
    Indices(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub kind: ResourceKind,
    pub name: String,
    pub common: Vec<u8>,
    pub backends: [Option<BackendData>; BackendType::COUNT],
}

impl DecodedRecord {
    #[must_use]
    pub fn backend(&self, backend: BackendType) -> Option<&BackendData> {
        self.backends[backend.index()].as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBytecode {
    pub hash: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArchive {
    pub content_version: u32,
    pub records: Vec<DecodedRecord>,
    pub bytecode_tables: [Vec<DecodedBytecode>; BackendType::COUNT],
}

impl DecodedArchive {
    #[must_use]
    pub fn record(&self, kind: ResourceKind, name: &str) -> Option<&DecodedRecord> {
        self.records
            .iter()
            .find(|record| record.kind == kind && record.name == name)
    }

    #[must_use]
    pub fn bytecode_table(&self, backend: BackendType) -> &[DecodedBytecode] {
        &self.bytecode_tables[backend.index()]
    }

    /// Resolves the bytecode list of `record` for `backend`.
    #[must_use]
    pub fn resolve_bytecode(&self, record: &DecodedRecord, backend: BackendType) -> Option<Vec<&[u8]>> {
        let Some(BackendData::Indices(indices)) = record.backend(backend) else {
            return None;
        };
        let table = self.bytecode_table(backend);
        indices
            .iter()
            .map(|&index| table.get(index as usize).map(|entry| entry.bytes.as_slice()))
            .collect()
    }
}

/// Bounds-checked little-endian cursor over an archive blob.
pub struct ArchiveReader<'a> {
    data: &'a [u8],
    position: usize,
}

fn malformed(message: impl Into<String>) -> EmberError {
    EmberError::MalformedArchive(message.into())
}

impl<'a> ArchiveReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Decodes and validates a complete archive blob.
    pub fn parse(blob: &[u8]) -> Result<DecodedArchive> {
        let mut reader = ArchiveReader::new(blob);

        let magic = reader.take(ARCHIVE_MAGIC.len(), "magic")?;
        if magic != ARCHIVE_MAGIC.as_slice() {
            return Err(malformed("bad magic"));
        }
        let format_version = reader.read_u32("format version")?;
        if format_version != ARCHIVE_FORMAT_VERSION {
            return Err(malformed(format!(
                "unsupported format version {format_version} (expected {ARCHIVE_FORMAT_VERSION})"
            )));
        }
        let content_version = reader.read_u32("content version")?;
        let record_count = reader.read_u32("record count")?;

        let mut raw_records = Vec::new();
        for _ in 0..record_count {
            raw_records.push(reader.read_record()?);
        }

        let mut bytecode_tables: [Vec<DecodedBytecode>; BackendType::COUNT] = Default::default();
        for backend in BackendType::ALL {
            let entry_count = reader.read_u32("bytecode entry count")?;
            let table = &mut bytecode_tables[backend.index()];
            for _ in 0..entry_count {
                let hash = reader.read_u64("bytecode hash")?;
                let bytes = reader.read_blob("bytecode")?;
                if xxh3_64(bytes) != hash {
                    return Err(malformed(format!(
                        "{} bytecode #{} does not match its content hash",
                        backend.name(),
                        table.len()
                    )));
                }
                table.push(DecodedBytecode {
                    hash,
                    bytes: bytes.to_vec(),
                });
            }
        }

        if !reader.is_ended() {
            return Err(malformed(format!(
                "{} trailing byte(s) after the bytecode tables",
                reader.remaining()
            )));
        }

        let records = raw_records
            .into_iter()
            .map(|raw| raw.decode(&bytecode_tables))
            .collect::<Result<Vec<_>>>()?;

        Ok(DecodedArchive {
            content_version,
            records,
            bytecode_tables,
        })
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.position == self.data.len()
    }

    pub fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(malformed(format!(
                "{what} needs {len} byte(s) at offset {}, only {} left",
                self.position,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self, what: &str) -> Result<u64> {
        let bytes = self.take(8, what)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(le))
    }

    /// Length-prefixed byte string.
    pub fn read_blob(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.read_u32(what)?;
        self.take(len as usize, what)
    }

    fn read_record(&mut self) -> Result<RawRecord<'a>> {
        let tag = self.read_u32("record kind")?;
        let kind = ResourceKind::from_tag(tag).ok_or_else(|| malformed(format!("unknown record kind {tag}")))?;
        let name = std::str::from_utf8(self.read_blob("record name")?)
            .map_err(|_| malformed("record name is not valid UTF-8"))?;
        let common = self.read_blob("common data")?;

        let mut backends = [None; BackendType::COUNT];
        for slot in &mut backends {
            let data = self.read_blob("backend data")?;
            *slot = (!data.is_empty()).then_some(data);
        }

        Ok(RawRecord {
            kind,
            name,
            common,
            backends,
        })
    }
}

struct RawRecord<'a> {
    kind: ResourceKind,
    name: &'a str,
    common: &'a [u8],
    backends: [Option<&'a [u8]>; BackendType::COUNT],
}

impl RawRecord<'_> {
    fn decode(self, tables: &[Vec<DecodedBytecode>; BackendType::COUNT]) -> Result<DecodedRecord> {
        let mut backends: [Option<BackendData>; BackendType::COUNT] = Default::default();
        for backend in BackendType::ALL {
            let Some(data) = self.backends[backend.index()] else {
                continue;
            };
            backends[backend.index()] = Some(if self.kind.uses_bytecode() {
                let indices = decode_index_list(data).map_err(|err| {
                    malformed(format!("{:?} '{}' ({}): {err}", self.kind, self.name, backend.name()))
                })?;
                let table_len = tables[backend.index()].len();
                if let Some(&bad) = indices.iter().find(|&&index| index as usize >= table_len) {
                    return Err(malformed(format!(
                        "{:?} '{}' references {} bytecode #{bad}, table has {table_len} entries",
                        self.kind,
                        self.name,
                        backend.name()
                    )));
                }
                BackendData::Indices(indices)
            } else {
                BackendData::Inline(data.to_vec())
            });
        }

        Ok(DecodedRecord {
            kind: self.kind,
            name: self.name.to_owned(),
            common: self.common.to_vec(),
            backends,
        })
    }
}

fn decode_index_list(data: &[u8]) -> std::result::Result<Vec<u32>, String> {
    let mut reader = ArchiveReader::new(data);
    let count = reader.read_u32("index count").map_err(|err| err.to_string())?;
    if count as usize > reader.remaining() / 4 {
        return Err(format!("index list declares {count} entries in {} bytes", data.len()));
    }
    let indices = (0..count)
        .map(|_| reader.read_u32("index"))
        .collect::<Result<Vec<_>>>()
        .map_err(|err| err.to_string())?;
    if !reader.is_ended() {
        return Err(format!("{} trailing byte(s) after the index list", reader.remaining()));
    }
    Ok(indices)
}
