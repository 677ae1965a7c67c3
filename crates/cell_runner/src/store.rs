//! File-backed cells.
//!
//! Data directory layout:
//!   conns-list.json        JSON array of cell ids (strings or numbers)
//!   conns-<id>.json        { "<group>": [ { "position": {x,y,z}, ... }, ... ], ... }
//!   meshes/<id>.bin        little-endian f32 triples
//!   meshes/<id>.json       flat [x, y, z, x, y, z, ...]
//!
//! Contact records may carry `post` instead of `position` (older exports).
//! Coordinates are either `{x, y, z}` objects or `[x, y, z]` arrays.
//!
//! Output goes to `<output-dir>/conns-<id>.json`: the input document with
//! `nearestVertexIndex` set on every record, group and record order unchanged.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use glam::Vec3;
use nearest_vertex::{BoxError, Cell, CellSink, CellSource, IndexArray};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const CELL_LIST_FILE: &str = "conns-list.json";
pub const RESULT_FIELD: &str = "nearestVertexIndex";

const POSITION_FIELDS: [&str; 2] = ["position", "post"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coords {
    Object { x: f32, y: f32, z: f32 },
    Array([f32; 3]),
}

impl From<Coords> for Vec3 {
    fn from(c: Coords) -> Self {
        match c {
            Coords::Object { x, y, z } => Vec3::new(x, y, z),
            Coords::Array(a) => Vec3::from_array(a),
        }
    }
}

pub fn contacts_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("conns-{id}.json"))
}

/// Read the list of cell ids to process.
pub fn read_cell_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("opening cell list {}", path.display()))?;
    let ids: Vec<Value> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing cell list {}", path.display()))?;

    ids.into_iter()
        .map(|v| -> anyhow::Result<String> {
            match v {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => bail!("cell id must be a string or number, got {other}"),
            }
        })
        .collect()
}

/// A cell's contact document, kept as JSON so unknown fields survive the round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnsDocument(Map<String, Value>);

impl ConnsDocument {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let doc = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> anyhow::Result<Self> {
        let Value::Object(groups) = doc else {
            bail!("contact document must be an object of named groups");
        };
        for (name, group) in &groups {
            let Value::Array(records) = group else {
                bail!("contact group {name:?} must be an array");
            };
            if let Some(i) = records.iter().position(|r| !r.is_object()) {
                bail!("contact group {name:?}: record {i} is not an object");
            }
        }
        Ok(Self(groups))
    }

    fn records(&self) -> impl Iterator<Item = &Map<String, Value>> {
        self.0
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(Value::as_object)
    }

    fn records_mut(&mut self) -> impl Iterator<Item = &mut Map<String, Value>> {
        self.0
            .values_mut()
            .filter_map(Value::as_array_mut)
            .flatten()
            .filter_map(Value::as_object_mut)
    }

    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.records().next().is_none()
    }

    /// Contact positions, group by group, in document order.
    pub fn contacts(&self) -> anyhow::Result<Vec<Vec3>> {
        self.records()
            .enumerate()
            .map(|(i, record)| -> anyhow::Result<Vec3> {
                let raw = POSITION_FIELDS
                    .iter()
                    .find_map(|f| record.get(*f))
                    .with_context(|| format!("contact {i} has no position"))?;
                let coords = Coords::deserialize(raw)
                    .with_context(|| format!("contact {i} has a malformed position"))?;
                Ok(coords.into())
            })
            .collect()
    }

    /// Set the result field on every record. Records past the end of
    /// `indices`, or resolved to position 0, get `null`.
    pub fn annotate(&mut self, indices: &IndexArray) -> anyhow::Result<()> {
        let records = self.len();
        if indices.len() > records {
            bail!("{} results for {records} contacts", indices.len());
        }

        let mut positions = indices.as_slice().iter();
        for record in self.records_mut() {
            let value = match positions.next() {
                Some(&p) if p > 0 => Value::from(p),
                _ => Value::Null,
            };
            record.insert(RESULT_FIELD.to_owned(), value);
        }
        Ok(())
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn write_atomic(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let file =
                File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &self.0)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

fn points_from_flat(values: &[f32]) -> anyhow::Result<Vec<Vec3>> {
    if values.len() % 3 != 0 {
        bail!("{} coordinates do not form whole xyz triples", values.len());
    }
    Ok(values.chunks_exact(3).map(Vec3::from_slice).collect())
}

fn decode_vertex_bin(bytes: &[u8]) -> anyhow::Result<Vec<Vec3>> {
    if bytes.len() % 4 != 0 {
        bail!("{} bytes is not a whole number of f32 values", bytes.len());
    }
    let floats: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    points_from_flat(&floats)
}

/// Mesh vertices for `id`; the binary form wins when both exist.
pub fn read_vertices(data_dir: &Path, id: &str) -> anyhow::Result<Vec<Vec3>> {
    let meshes = data_dir.join("meshes");
    let bin = meshes.join(format!("{id}.bin"));
    if bin.is_file() {
        let bytes = fs::read(&bin).with_context(|| format!("reading {}", bin.display()))?;
        return decode_vertex_bin(&bytes).with_context(|| format!("decoding {}", bin.display()));
    }

    let json = meshes.join(format!("{id}.json"));
    let file = File::open(&json).with_context(|| format!("opening {}", json.display()))?;
    let flat: Vec<f32> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", json.display()))?;
    points_from_flat(&flat).with_context(|| format!("decoding {}", json.display()))
}

pub struct FileCellSource {
    data_dir: PathBuf,
}

impl FileCellSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn load_cell(&self, id: &str) -> anyhow::Result<Cell> {
        let doc = ConnsDocument::read(&contacts_path(&self.data_dir, id))?;
        let contacts = doc.contacts()?;
        let vertices = read_vertices(&self.data_dir, id)?;
        tracing::debug!(
            contacts = contacts.len(),
            vertices = vertices.len(),
            "Loaded cell"
        );
        Ok(Cell {
            id: id.to_owned(),
            contacts,
            vertices,
        })
    }
}

impl CellSource for FileCellSource {
    fn load(&mut self, id: &str) -> Result<Cell, BoxError> {
        Ok(self.load_cell(id)?)
    }
}

/// Re-reads each cell's contact document and writes the annotated copy.
pub struct FileCellSink {
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl FileCellSink {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    fn write_cell(&self, cell: &Cell, indices: &IndexArray) -> anyhow::Result<PathBuf> {
        let mut doc = ConnsDocument::read(&contacts_path(&self.data_dir, &cell.id))?;
        if doc.len() != cell.contacts.len() {
            bail!(
                "contact document changed while cell was running: {} records, {} loaded",
                doc.len(),
                cell.contacts.len()
            );
        }
        doc.annotate(indices)?;

        let out = contacts_path(&self.output_dir, &cell.id);
        doc.write_atomic(&out)?;
        Ok(out)
    }
}

impl CellSink for FileCellSink {
    fn persist(&mut self, cell: &Cell, indices: &IndexArray) -> Result<(), BoxError> {
        let path = self.write_cell(cell, indices)?;
        tracing::debug!(path = %path.display(), "Wrote annotated contacts");
        Ok(())
    }
}
