//! Archive encoding.
//!
//! The blob is produced in two passes over the same encode routine: a
//! [`Measurer`] sums the sizes, the output buffer is reserved once at that
//! exact size, then a [`Writer`] fills it and must end exactly at the last
//! byte.
//!
//! ```text
//!   header   "EMBA" | format_version u32 | content_version u32 | record_count u32
//!   record   kind u32 | name_len u32 | name | common_len u32 | common
//!            | 6 × (data_len u32 | data)                       data_len 0 = absent
//!   tables   6 × (entry_count u32 | entry_count × (hash u64 | len u32 | bytes))
//! ```
//!
//! All integers are little-endian. Backends appear in [`BackendType::ALL`] order.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use super::{ArchiveObject, BackendPayload, ResourceKind};
use crate::backend::BackendType;
use crate::errors::{EmberError, Result};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"EMBA";
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

// ─── Sinks ───────────────────────────────────────────────────────────────────

pub(crate) trait ByteSink {
    fn put(&mut self, bytes: &[u8]);

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// Length-prefixed byte string.
    fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(len_u32(bytes.len()));
        self.put(bytes);
    }
}

/// Length prefix for an already-checked field.
///
/// [`ArchiveContents::collect`] rejects every oversized field with
/// [`EmberError::ArchiveFieldTooLarge`] before encoding starts.
#[inline]
fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| panic!("unchecked archive field of {len} bytes reached the encoder"))
}

fn checked_len(len: usize, object: &str, field: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        log::error!("Archive field '{field}' of '{object}' is {len} bytes, over the u32 length limit");
        EmberError::ArchiveFieldTooLarge {
            object: object.to_owned(),
            field,
            len,
        }
    })
}

/// Byte length of an encoded index list: the count followed by the indices.
fn index_list_len(count: usize) -> usize {
    count.checked_mul(4).and_then(|bytes| bytes.checked_add(4)).unwrap_or(usize::MAX)
}

#[derive(Default)]
pub(crate) struct Measurer {
    size: usize,
}

impl ByteSink for Measurer {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.size += bytes.len();
    }
}

pub(crate) struct Writer<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.position == self.buffer.len()
    }
}

impl ByteSink for Writer<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        assert!(
            end <= self.buffer.len(),
            "archive writer overran the measured size ({end} > {})",
            self.buffer.len()
        );
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }
}

// ─── Build Contents ──────────────────────────────────────────────────────────

/// Per-backend bytecode deduplicated by content hash.
#[derive(Default)]
pub(crate) struct BytecodeTable<'a> {
    entries: Vec<(u64, &'a [u8])>,
    index_by_hash: FxHashMap<u64, u32>,
}

impl<'a> BytecodeTable<'a> {
    /// Index of `bytecode` in the table, adding it if its hash is new.
    ///
    /// `owner` names the object the bytecode belongs to in errors.
    pub(crate) fn intern(&mut self, bytecode: &'a [u8], owner: &str) -> Result<u32> {
        checked_len(bytecode.len(), owner, "bytecode")?;
        let hash = xxh3_64(bytecode);
        if let Some(&index) = self.index_by_hash.get(&hash) {
            return Ok(index);
        }

        self.entries
            .try_reserve(1)
            .and_then(|()| self.index_by_hash.try_reserve(1))
            .map_err(|_| EmberError::OutOfHostMemory {
                context: "archive bytecode table",
            })?;

        let index = checked_len(self.entries.len(), owner, "bytecode table")?;
        self.entries.push((hash, bytecode));
        self.index_by_hash.insert(hash, index);
        Ok(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

enum RecordData<'a> {
    Inline(&'a [u8]),
    Indices(SmallVec<[u32; 8]>),
}

struct Record<'a> {
    kind: ResourceKind,
    name: &'a str,
    common: &'a [u8],
    backends: [Option<RecordData<'a>>; BackendType::COUNT],
}

/// Everything that goes into one blob, borrowed from the registered objects.
pub(crate) struct ArchiveContents<'a> {
    content_version: u32,
    records: Vec<Record<'a>>,
    tables: [BytecodeTable<'a>; BackendType::COUNT],
}

impl<'a> ArchiveContents<'a> {
    /// Interns every bytecode of `objects` and lays out one record per object.
    pub(crate) fn collect(content_version: u32, objects: &'a [std::sync::Arc<ArchiveObject>]) -> Result<Self> {
        let mut records = Vec::new();
        records
            .try_reserve_exact(objects.len())
            .map_err(|_| EmberError::OutOfHostMemory {
                context: "archive record list",
            })?;
        let mut tables: [BytecodeTable<'a>; BackendType::COUNT] = Default::default();

        for object in objects {
            let name = object.name();
            checked_len(name.len(), name, "name")?;
            checked_len(object.common().len(), name, "common data")?;

            let mut backends: [Option<RecordData<'a>>; BackendType::COUNT] = Default::default();
            for backend in BackendType::ALL {
                let i = backend.index();
                backends[i] = match object.backend_payload(backend) {
                    None => None,
                    Some(BackendPayload::Inline(bytes)) => {
                        checked_len(bytes.len(), name, "inline data")?;
                        Some(RecordData::Inline(bytes))
                    }
                    Some(BackendPayload::Bytecode(list)) => {
                        checked_len(index_list_len(list.len()), name, "bytecode index list")?;
                        let indices = list
                            .iter()
                            .map(|code| tables[i].intern(code, name))
                            .collect::<Result<SmallVec<[u32; 8]>>>()?;
                        Some(RecordData::Indices(indices))
                    }
                };
            }

            records.push(Record {
                kind: object.kind(),
                name,
                common: object.common(),
                backends,
            });
        }

        checked_len(records.len(), "archive", "record count")?;

        Ok(Self {
            content_version,
            records,
            tables,
        })
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of distinct bytecodes stored for `backend`.
    pub(crate) fn bytecode_count(&self, backend: BackendType) -> usize {
        self.tables[backend.index()].len()
    }

    fn encode(&self, sink: &mut dyn ByteSink) {
        sink.put(&ARCHIVE_MAGIC);
        sink.put_u32(ARCHIVE_FORMAT_VERSION);
        sink.put_u32(self.content_version);
        sink.put_u32(len_u32(self.records.len()));

        for record in &self.records {
            sink.put_u32(record.kind.tag());
            sink.put_blob(record.name.as_bytes());
            sink.put_blob(record.common);
            for data in &record.backends {
                match data {
                    None => sink.put_u32(0),
                    Some(RecordData::Inline(bytes)) => sink.put_blob(bytes),
                    Some(RecordData::Indices(indices)) => {
                        sink.put_u32(len_u32(index_list_len(indices.len())));
                        sink.put_u32(len_u32(indices.len()));
                        for &index in indices {
                            sink.put_u32(index);
                        }
                    }
                }
            }
        }

        for table in &self.tables {
            sink.put_u32(len_u32(table.entries.len()));
            for &(hash, bytes) in &table.entries {
                sink.put_u64(hash);
                sink.put_blob(bytes);
            }
        }
    }

    /// Serializes into a buffer allocated once at the measured size.
    pub(crate) fn to_blob(&self) -> Result<Vec<u8>> {
        let mut measurer = Measurer::default();
        self.encode(&mut measurer);
        let size = measurer.size;

        let mut blob = Vec::new();
        blob.try_reserve_exact(size)
            .map_err(|_| EmberError::OutOfHostMemory { context: "archive blob" })?;
        blob.resize(size, 0);

        let mut writer = Writer::new(&mut blob);
        self.encode(&mut writer);
        assert!(writer.is_ended(), "archive writer stopped short of the measured size {size}");

        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_fills_exactly() {
        let mut buffer = [0u8; 12];
        let mut writer = Writer::new(&mut buffer);
        writer.put_u32(7);
        assert!(!writer.is_ended());
        writer.put_u64(u64::MAX);
        assert!(writer.is_ended());
        assert_eq!(&buffer[..4], &7u32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "overran")]
    fn writer_rejects_overrun() {
        let mut buffer = [0u8; 4];
        let mut writer = Writer::new(&mut buffer);
        writer.put_blob(b"x");
    }

    #[test]
    fn identical_bytecode_is_interned_once() {
        let a = vec![1u8, 2, 3];
        let b = vec![1u8, 2, 3];
        let c = vec![9u8];
        let mut table = BytecodeTable::default();
        assert_eq!(table.intern(&a, "vs").unwrap(), 0);
        assert_eq!(table.intern(&b, "vs").unwrap(), 0);
        assert_eq!(table.intern(&c, "ps").unwrap(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn lengths_within_u32_are_accepted() {
        assert_eq!(checked_len(u32::MAX as usize, "sig", "common data").unwrap(), u32::MAX);
        assert_eq!(index_list_len(3), 16);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_fields_are_errors() {
        let len = u32::MAX as usize + 1;
        match checked_len(len, "gbuffer", "inline data") {
            Err(EmberError::ArchiveFieldTooLarge { object, field, len: reported }) => {
                assert_eq!(object, "gbuffer");
                assert_eq!(field, "inline data");
                assert_eq!(reported, len);
            }
            other => panic!("expected ArchiveFieldTooLarge, got {other:?}"),
        }

        // The index list's prefix counts four bytes per index plus the count
        let count = (u32::MAX as usize) / 4;
        assert!(checked_len(index_list_len(count), "gbuffer", "bytecode index list").is_err());
        assert_eq!(index_list_len(usize::MAX), usize::MAX);
    }
}
