use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::durability::encoder::{Decoder, Encoder};
use crate::error::{Result, UmbraError};
use crate::storage::property_value::PropertyValue;
use crate::storage::types::Gid;

pub const WAL_MAGIC: &[u8; 4] = b"MGwl";
pub const WAL_VERSION: u32 = 1;

const OP_CREATE_VERTEX: u8 = 0;
const OP_DELETE_VERTEX: u8 = 1;
const OP_ADD_LABEL: u8 = 2;
const OP_REMOVE_LABEL: u8 = 3;
const OP_SET_VERTEX_PROPERTY: u8 = 4;
const OP_CREATE_EDGE: u8 = 5;
const OP_DELETE_EDGE: u8 = 6;
const OP_SET_EDGE_PROPERTY: u8 = 7;
const OP_TRANSACTION_END: u8 = 8;
const OP_LABEL_INDEX_CREATE: u8 = 9;
const OP_LABEL_INDEX_DROP: u8 = 10;
const OP_LABEL_PROPERTY_INDEX_CREATE: u8 = 11;
const OP_LABEL_PROPERTY_INDEX_DROP: u8 = 12;

/// A single redo operation. Names are stored instead of ids so every WAL
/// segment is self-contained and can be applied by a replica with a
/// different dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum WalOp {
    CreateVertex {
        gid: Gid,
    },
    DeleteVertex {
        gid: Gid,
    },
    AddLabel {
        gid: Gid,
        label: String,
    },
    RemoveLabel {
        gid: Gid,
        label: String,
    },
    SetVertexProperty {
        gid: Gid,
        property: String,
        value: PropertyValue,
    },
    CreateEdge {
        gid: Gid,
        edge_type: String,
        from_vertex: Gid,
        to_vertex: Gid,
    },
    DeleteEdge {
        gid: Gid,
        edge_type: String,
        from_vertex: Gid,
        to_vertex: Gid,
    },
    SetEdgeProperty {
        gid: Gid,
        property: String,
        value: PropertyValue,
    },
    /// Terminates the contiguous run of one transaction.
    TransactionEnd,
    LabelIndexCreate {
        label: String,
    },
    LabelIndexDrop {
        label: String,
    },
    LabelPropertyIndexCreate {
        label: String,
        property: String,
    },
    LabelPropertyIndexDrop {
        label: String,
        property: String,
    },
}

/// One WAL record: `timestamp, transaction_id, kind, payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Final commit timestamp of the producing transaction.
    pub timestamp: u64,
    pub transaction_id: u64,
    pub op: WalOp,
}

impl WalEntry {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u64(self.timestamp);
        encoder.write_u64(self.transaction_id);
        match &self.op {
            WalOp::CreateVertex { gid } => {
                encoder.write_u8(OP_CREATE_VERTEX);
                encoder.write_gid(*gid);
            }
            WalOp::DeleteVertex { gid } => {
                encoder.write_u8(OP_DELETE_VERTEX);
                encoder.write_gid(*gid);
            }
            WalOp::AddLabel { gid, label } => {
                encoder.write_u8(OP_ADD_LABEL);
                encoder.write_gid(*gid);
                encoder.write_string(label);
            }
            WalOp::RemoveLabel { gid, label } => {
                encoder.write_u8(OP_REMOVE_LABEL);
                encoder.write_gid(*gid);
                encoder.write_string(label);
            }
            WalOp::SetVertexProperty {
                gid,
                property,
                value,
            } => {
                encoder.write_u8(OP_SET_VERTEX_PROPERTY);
                encoder.write_gid(*gid);
                encoder.write_string(property);
                encoder.write_property_value(value);
            }
            WalOp::CreateEdge {
                gid,
                edge_type,
                from_vertex,
                to_vertex,
            } => {
                encoder.write_u8(OP_CREATE_EDGE);
                encoder.write_gid(*gid);
                encoder.write_string(edge_type);
                encoder.write_gid(*from_vertex);
                encoder.write_gid(*to_vertex);
            }
            WalOp::DeleteEdge {
                gid,
                edge_type,
                from_vertex,
                to_vertex,
            } => {
                encoder.write_u8(OP_DELETE_EDGE);
                encoder.write_gid(*gid);
                encoder.write_string(edge_type);
                encoder.write_gid(*from_vertex);
                encoder.write_gid(*to_vertex);
            }
            WalOp::SetEdgeProperty {
                gid,
                property,
                value,
            } => {
                encoder.write_u8(OP_SET_EDGE_PROPERTY);
                encoder.write_gid(*gid);
                encoder.write_string(property);
                encoder.write_property_value(value);
            }
            WalOp::TransactionEnd => encoder.write_u8(OP_TRANSACTION_END),
            WalOp::LabelIndexCreate { label } => {
                encoder.write_u8(OP_LABEL_INDEX_CREATE);
                encoder.write_string(label);
            }
            WalOp::LabelIndexDrop { label } => {
                encoder.write_u8(OP_LABEL_INDEX_DROP);
                encoder.write_string(label);
            }
            WalOp::LabelPropertyIndexCreate { label, property } => {
                encoder.write_u8(OP_LABEL_PROPERTY_INDEX_CREATE);
                encoder.write_string(label);
                encoder.write_string(property);
            }
            WalOp::LabelPropertyIndexDrop { label, property } => {
                encoder.write_u8(OP_LABEL_PROPERTY_INDEX_DROP);
                encoder.write_string(label);
                encoder.write_string(property);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_bytes()
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let timestamp = decoder.read_u64()?;
        let transaction_id = decoder.read_u64()?;
        let op = match decoder.read_u8()? {
            OP_CREATE_VERTEX => WalOp::CreateVertex {
                gid: decoder.read_gid()?,
            },
            OP_DELETE_VERTEX => WalOp::DeleteVertex {
                gid: decoder.read_gid()?,
            },
            OP_ADD_LABEL => WalOp::AddLabel {
                gid: decoder.read_gid()?,
                label: decoder.read_string()?,
            },
            OP_REMOVE_LABEL => WalOp::RemoveLabel {
                gid: decoder.read_gid()?,
                label: decoder.read_string()?,
            },
            OP_SET_VERTEX_PROPERTY => WalOp::SetVertexProperty {
                gid: decoder.read_gid()?,
                property: decoder.read_string()?,
                value: decoder.read_property_value()?,
            },
            OP_CREATE_EDGE => WalOp::CreateEdge {
                gid: decoder.read_gid()?,
                edge_type: decoder.read_string()?,
                from_vertex: decoder.read_gid()?,
                to_vertex: decoder.read_gid()?,
            },
            OP_DELETE_EDGE => WalOp::DeleteEdge {
                gid: decoder.read_gid()?,
                edge_type: decoder.read_string()?,
                from_vertex: decoder.read_gid()?,
                to_vertex: decoder.read_gid()?,
            },
            OP_SET_EDGE_PROPERTY => WalOp::SetEdgeProperty {
                gid: decoder.read_gid()?,
                property: decoder.read_string()?,
                value: decoder.read_property_value()?,
            },
            OP_TRANSACTION_END => WalOp::TransactionEnd,
            OP_LABEL_INDEX_CREATE => WalOp::LabelIndexCreate {
                label: decoder.read_string()?,
            },
            OP_LABEL_INDEX_DROP => WalOp::LabelIndexDrop {
                label: decoder.read_string()?,
            },
            OP_LABEL_PROPERTY_INDEX_CREATE => WalOp::LabelPropertyIndexCreate {
                label: decoder.read_string()?,
                property: decoder.read_string()?,
            },
            OP_LABEL_PROPERTY_INDEX_DROP => WalOp::LabelPropertyIndexDrop {
                label: decoder.read_string()?,
                property: decoder.read_string()?,
            },
            _ => return Err(UmbraError::Corruption("unknown WAL entry kind")),
        };
        Ok(Self {
            timestamp,
            transaction_id,
            op,
        })
    }
}

fn wal_file_name(uuid: &str, seq_num: u64) -> String {
    format!("{uuid}_{seq_num:020}.wal")
}

fn encode_header(uuid: &str, epoch_id: &str, seq_num: u64) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(WAL_MAGIC);
    encoder.write_u32(WAL_VERSION);
    encoder.write_string(uuid);
    encoder.write_string(epoch_id);
    encoder.write_u64(seq_num);
    encoder.into_bytes()
}

/// The WAL segment currently accepting appends.
///
/// Appends land in an in-memory buffer first; the buffer is written and
/// synced by `flush_to_disk`, driven by the commit cadence. Replication
/// catch-up may temporarily freeze flushing to ship a consistent copy of
/// the file plus the pending buffer.
#[derive(Debug)]
pub struct WalFile {
    path: PathBuf,
    file: File,
    pub uuid: String,
    pub epoch_id: String,
    pub seq_num: u64,
    pub from_timestamp: Option<u64>,
    pub to_timestamp: u64,
    pub num_entries: u64,
    buffer: Vec<u8>,
    disk_size: u64,
    flushing_enabled: bool,
    finished_transactions: u64,
}

impl WalFile {
    pub fn create(directory: &Path, uuid: &str, epoch_id: &str, seq_num: u64) -> Result<Self> {
        let path = directory.join(wal_file_name(uuid, seq_num));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let header = encode_header(uuid, epoch_id, seq_num);
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(Self {
            path,
            file,
            uuid: uuid.to_owned(),
            epoch_id: epoch_id.to_owned(),
            seq_num,
            from_timestamp: None,
            to_timestamp: 0,
            num_entries: 0,
            buffer: Vec::new(),
            disk_size: header.len() as u64,
            flushing_enabled: true,
            finished_transactions: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sequence_number(&self) -> u64 {
        self.seq_num
    }

    /// Total size of the segment including the unflushed tail.
    pub fn size(&self) -> u64 {
        self.disk_size + self.buffer.len() as u64
    }

    pub fn append_entry(&mut self, entry: &WalEntry) {
        self.buffer.extend_from_slice(&entry.encode());
        self.from_timestamp.get_or_insert(entry.timestamp);
        self.to_timestamp = self.to_timestamp.max(entry.timestamp);
        self.num_entries += 1;
    }

    /// Called once per committed transaction; flushes when the configured
    /// cadence is reached.
    pub fn finish_transaction(&mut self, flush_every_n_tx: u64) -> Result<()> {
        self.finished_transactions += 1;
        if self.flushing_enabled && self.finished_transactions >= flush_every_n_tx.max(1) {
            self.flush_to_disk()?;
            self.finished_transactions = 0;
        }
        Ok(())
    }

    pub fn flush_to_disk(&mut self) -> Result<()> {
        if !self.flushing_enabled || self.buffer.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buffer)?;
        self.file.sync_data()?;
        self.disk_size += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Freezes the on-disk portion of the segment for streaming.
    pub fn disable_flushing(&mut self) {
        self.flushing_enabled = false;
    }

    pub fn enable_flushing(&mut self) -> Result<()> {
        self.flushing_enabled = true;
        self.flush_to_disk()
    }

    pub fn is_flushing_enabled(&self) -> bool {
        self.flushing_enabled
    }

    /// Appends not yet written to the file.
    pub fn current_buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Flushes everything and drops the handle; the segment will no longer
    /// accept appends.
    pub fn finalize(mut self) -> Result<PathBuf> {
        self.flushing_enabled = true;
        self.flush_to_disk()?;
        Ok(self.path)
    }
}

/// Metadata of a WAL segment on disk, read back by recovery and the
/// replication catch-up planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalInfo {
    pub path: PathBuf,
    pub uuid: String,
    pub epoch_id: String,
    pub seq_num: u64,
    pub from_timestamp: u64,
    pub to_timestamp: u64,
    pub num_entries: u64,
}

impl WalInfo {
    /// Scans a segment, deriving the covered timestamp range from its
    /// entries. A torn tail (crash during append) ends the scan early.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut decoder = Decoder::new(&bytes);
        let (uuid, epoch_id, seq_num) = read_header(&mut decoder)?;
        let mut from_timestamp = None;
        let mut to_timestamp = 0;
        let mut num_entries = 0u64;
        while !decoder.is_exhausted() {
            let position = decoder.position();
            match WalEntry::decode(&mut decoder) {
                Ok(entry) => {
                    from_timestamp.get_or_insert(entry.timestamp);
                    to_timestamp = to_timestamp.max(entry.timestamp);
                    num_entries += 1;
                }
                Err(_) => {
                    warn!(path = %path.display(), position, "torn WAL tail ignored");
                    break;
                }
            }
        }
        Ok(Self {
            path: path.to_owned(),
            uuid,
            epoch_id,
            seq_num,
            from_timestamp: from_timestamp.unwrap_or(0),
            to_timestamp,
            num_entries,
        })
    }
}

/// Reads every decodable entry of a segment.
pub fn read_wal_entries(path: &Path) -> Result<Vec<WalEntry>> {
    let bytes = std::fs::read(path)?;
    let mut decoder = Decoder::new(&bytes);
    read_header(&mut decoder)?;
    let mut entries = Vec::new();
    while !decoder.is_exhausted() {
        match WalEntry::decode(&mut decoder) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
    }
    Ok(entries)
}

fn read_header(decoder: &mut Decoder<'_>) -> Result<(String, String, u64)> {
    let magic = decoder.read_exact(WAL_MAGIC.len())?;
    if magic != WAL_MAGIC {
        return Err(UmbraError::Corruption("invalid WAL magic"));
    }
    let version = decoder.read_u32()?;
    if version != WAL_VERSION {
        return Err(UmbraError::Corruption("unsupported WAL version"));
    }
    let uuid = decoder.read_string()?;
    let epoch_id = decoder.read_string()?;
    let seq_num = decoder.read_u64()?;
    Ok((uuid, epoch_id, seq_num))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(timestamp: u64, op: WalOp) -> WalEntry {
        WalEntry {
            timestamp,
            transaction_id: 900 + timestamp,
            op,
        }
    }

    #[test]
    fn entry_encoding_roundtrip() {
        let entries = vec![
            entry(1, WalOp::CreateVertex { gid: Gid::from_u64(0) }),
            entry(
                1,
                WalOp::AddLabel {
                    gid: Gid::from_u64(0),
                    label: "Person".into(),
                },
            ),
            entry(
                1,
                WalOp::SetVertexProperty {
                    gid: Gid::from_u64(0),
                    property: "name".into(),
                    value: PropertyValue::String("ada".into()),
                },
            ),
            entry(
                2,
                WalOp::CreateEdge {
                    gid: Gid::from_u64(5),
                    edge_type: "KNOWS".into(),
                    from_vertex: Gid::from_u64(0),
                    to_vertex: Gid::from_u64(1),
                },
            ),
            entry(2, WalOp::TransactionEnd),
            entry(
                3,
                WalOp::LabelPropertyIndexCreate {
                    label: "Person".into(),
                    property: "name".into(),
                },
            ),
        ];
        let mut encoder = Encoder::new();
        for e in &entries {
            e.encode_into(&mut encoder);
        }
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        for e in &entries {
            assert_eq!(&WalEntry::decode(&mut decoder).unwrap(), e);
        }
        assert!(decoder.is_exhausted());
    }

    #[test]
    fn segment_scan_reports_timestamp_range() {
        let dir = tempdir().expect("tempdir");
        let mut wal = WalFile::create(dir.path(), "uuid-1", "epoch-1", 4).unwrap();
        wal.append_entry(&entry(10, WalOp::CreateVertex { gid: Gid::from_u64(1) }));
        wal.append_entry(&entry(10, WalOp::TransactionEnd));
        wal.append_entry(&entry(12, WalOp::DeleteVertex { gid: Gid::from_u64(1) }));
        wal.append_entry(&entry(12, WalOp::TransactionEnd));
        let path = wal.finalize().unwrap();

        let info = WalInfo::read(&path).unwrap();
        assert_eq!(info.uuid, "uuid-1");
        assert_eq!(info.epoch_id, "epoch-1");
        assert_eq!(info.seq_num, 4);
        assert_eq!(info.from_timestamp, 10);
        assert_eq!(info.to_timestamp, 12);
        assert_eq!(info.num_entries, 4);
        assert_eq!(read_wal_entries(&path).unwrap().len(), 4);
    }

    #[test]
    fn buffer_is_visible_before_flush() {
        let dir = tempdir().expect("tempdir");
        let mut wal = WalFile::create(dir.path(), "uuid-2", "epoch-2", 0).unwrap();
        wal.disable_flushing();
        wal.append_entry(&entry(1, WalOp::CreateVertex { gid: Gid::from_u64(0) }));
        assert!(!wal.current_buffer().is_empty());
        // Nothing reaches the file while flushing is frozen.
        wal.finish_transaction(1).unwrap();
        assert!(!wal.current_buffer().is_empty());
        wal.enable_flushing().unwrap();
        assert!(wal.current_buffer().is_empty());
        let info = WalInfo::read(wal.path()).unwrap();
        assert_eq!(info.num_entries, 1);
    }
}
