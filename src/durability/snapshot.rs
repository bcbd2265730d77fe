use std::path::{Path, PathBuf};

use crate::durability::encoder::{Decoder, Encoder};
use crate::error::{Result, UmbraError};
use crate::storage::types::{Gid, View};
use crate::storage::Accessor;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"MGsn";
pub const SNAPSHOT_VERSION: u32 = 1;

fn snapshot_file_name(uuid: &str, start_timestamp: u64) -> String {
    format!("{uuid}_{start_timestamp:020}.snapshot")
}

/// Header metadata of a snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub uuid: String,
    pub epoch_id: String,
    pub start_timestamp: u64,
}

impl SnapshotInfo {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut decoder = Decoder::new(&bytes);
        let (uuid, epoch_id, start_timestamp) = read_header(&mut decoder)?;
        Ok(Self {
            path: path.to_owned(),
            uuid,
            epoch_id,
            start_timestamp,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SnapshotVertex {
    pub gid: Gid,
    pub labels: Vec<u32>,
    pub properties: Vec<(u32, crate::storage::property_value::PropertyValue)>,
}

#[derive(Debug, Clone)]
pub(crate) struct SnapshotEdge {
    pub gid: Gid,
    pub from_vertex: Gid,
    pub to_vertex: Gid,
    pub edge_type: u32,
    pub properties: Vec<(u32, crate::storage::property_value::PropertyValue)>,
}

/// Fully parsed snapshot, ready to be loaded into an empty storage.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotContents {
    pub uuid: String,
    pub epoch_id: String,
    pub start_timestamp: u64,
    pub name_mappings: Vec<(u32, String)>,
    pub label_indices: Vec<u32>,
    pub label_property_indices: Vec<(u32, u32)>,
    pub vertices: Vec<SnapshotVertex>,
    pub edges: Vec<SnapshotEdge>,
}

/// Writes a consistent point-in-time dump of the accessor's view.
///
/// Layout: header, name-id-mapper, indexes, vertices, edges, then a footer
/// with the section offsets and a crc32 over everything before it. The file
/// appears atomically via a temp-file rename.
pub(crate) fn create_snapshot_file(accessor: &Accessor, directory: &Path) -> Result<PathBuf> {
    let storage = &accessor.storage;
    let start_timestamp = accessor.start_timestamp();
    let path = directory.join(snapshot_file_name(&storage.uuid, start_timestamp));
    if path.exists() {
        // Nothing committed since the previous snapshot.
        return Ok(path);
    }

    let mut encoder = Encoder::new();
    encoder.write_bytes(SNAPSHOT_MAGIC);
    encoder.write_u32(SNAPSHOT_VERSION);
    encoder.write_string(&storage.uuid);
    encoder.write_string(&storage.epoch_id);
    encoder.write_u64(start_timestamp);

    let mapper_offset = encoder.position();
    let mappings = storage.dict.entries();
    encoder.write_u32(mappings.len() as u32);
    for (id, name) in &mappings {
        encoder.write_u32(*id);
        encoder.write_string(name);
    }

    let indices_offset = encoder.position();
    let label_indices = storage.indices.label_definitions();
    encoder.write_u32(label_indices.len() as u32);
    for label in &label_indices {
        encoder.write_u32(label.0);
    }
    let label_property_indices = storage.indices.label_property_definitions();
    encoder.write_u32(label_property_indices.len() as u32);
    for (label, property) in &label_property_indices {
        encoder.write_u32(label.0);
        encoder.write_u32(property.0);
    }

    let vertices_offset = encoder.position();
    let vertices = accessor.vertices(View::Old);
    encoder.write_u64(vertices.len() as u64);
    for vertex in &vertices {
        encoder.write_gid(vertex.gid());
        let labels = vertex.labels(View::Old)?;
        encoder.write_u32(labels.len() as u32);
        for label in labels {
            encoder.write_u32(label.0);
        }
        let mut properties: Vec<_> = vertex.properties(View::Old)?.into_iter().collect();
        properties.sort_by_key(|(key, _)| *key);
        encoder.write_u32(properties.len() as u32);
        for (key, value) in properties {
            encoder.write_u32(key.0);
            encoder.write_property_value(&value);
        }
    }

    let edges_offset = encoder.position();
    let edges: Vec<_> = storage.edges.read().values().cloned().collect();
    let mut visible_edges = Vec::new();
    for edge in edges {
        let state = crate::storage::mvcc::edge_state(
            &storage.deltas,
            &edge,
            &accessor.transaction,
            View::Old,
        );
        if !state.deleted {
            visible_edges.push((edge, state));
        }
    }
    encoder.write_u64(visible_edges.len() as u64);
    for (edge, state) in &visible_edges {
        encoder.write_gid(edge.gid);
        encoder.write_gid(edge.from_vertex);
        encoder.write_gid(edge.to_vertex);
        encoder.write_u32(edge.edge_type.0);
        let mut properties: Vec<_> = state.properties.iter().collect();
        properties.sort_by_key(|(key, _)| **key);
        encoder.write_u32(properties.len() as u32);
        for (key, value) in properties {
            encoder.write_u32(key.0);
            encoder.write_property_value(value);
        }
    }

    encoder.write_u64(mapper_offset);
    encoder.write_u64(indices_offset);
    encoder.write_u64(vertices_offset);
    encoder.write_u64(edges_offset);
    let bytes = encoder.into_bytes();
    let crc = crc32fast::hash(&bytes);
    let mut bytes = bytes;
    bytes.extend_from_slice(&crc.to_le_bytes());

    let tmp_path = path.with_extension("snapshot.tmp");
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// Reads a snapshot back, verifying the trailing checksum.
pub(crate) fn load_snapshot(path: &Path) -> Result<SnapshotContents> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(UmbraError::Corruption("snapshot file too short"));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("length checked"));
    if crc32fast::hash(body) != stored_crc {
        return Err(UmbraError::Corruption("snapshot checksum mismatch"));
    }

    let mut decoder = Decoder::new(body);
    let (uuid, epoch_id, start_timestamp) = read_header(&mut decoder)?;

    let mapping_count = decoder.read_u32()? as usize;
    let mut name_mappings = Vec::with_capacity(mapping_count);
    for _ in 0..mapping_count {
        let id = decoder.read_u32()?;
        let name = decoder.read_string()?;
        name_mappings.push((id, name));
    }

    let label_index_count = decoder.read_u32()? as usize;
    let mut label_indices = Vec::with_capacity(label_index_count);
    for _ in 0..label_index_count {
        label_indices.push(decoder.read_u32()?);
    }
    let label_property_index_count = decoder.read_u32()? as usize;
    let mut label_property_indices = Vec::with_capacity(label_property_index_count);
    for _ in 0..label_property_index_count {
        let label = decoder.read_u32()?;
        let property = decoder.read_u32()?;
        label_property_indices.push((label, property));
    }

    let vertex_count = decoder.read_u64()? as usize;
    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        let gid = decoder.read_gid()?;
        let label_count = decoder.read_u32()? as usize;
        let mut labels = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            labels.push(decoder.read_u32()?);
        }
        let property_count = decoder.read_u32()? as usize;
        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            let key = decoder.read_u32()?;
            let value = decoder.read_property_value()?;
            properties.push((key, value));
        }
        vertices.push(SnapshotVertex {
            gid,
            labels,
            properties,
        });
    }

    let edge_count = decoder.read_u64()? as usize;
    let mut edges = Vec::with_capacity(edge_count);
    for _ in 0..edge_count {
        let gid = decoder.read_gid()?;
        let from_vertex = decoder.read_gid()?;
        let to_vertex = decoder.read_gid()?;
        let edge_type = decoder.read_u32()?;
        let property_count = decoder.read_u32()? as usize;
        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            let key = decoder.read_u32()?;
            let value = decoder.read_property_value()?;
            properties.push((key, value));
        }
        edges.push(SnapshotEdge {
            gid,
            from_vertex,
            to_vertex,
            edge_type,
            properties,
        });
    }

    Ok(SnapshotContents {
        uuid,
        epoch_id,
        start_timestamp,
        name_mappings,
        label_indices,
        label_property_indices,
        vertices,
        edges,
    })
}

fn read_header(decoder: &mut Decoder<'_>) -> Result<(String, String, u64)> {
    let magic = decoder.read_exact(SNAPSHOT_MAGIC.len())?;
    if magic != SNAPSHOT_MAGIC {
        return Err(UmbraError::Corruption("invalid snapshot magic"));
    }
    let version = decoder.read_u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(UmbraError::Corruption("unsupported snapshot version"));
    }
    let uuid = decoder.read_string()?;
    let epoch_id = decoder.read_string()?;
    let start_timestamp = decoder.read_u64()?;
    Ok((uuid, epoch_id, start_timestamp))
}
