//! The binary cache codec.
//!
//! Layout: magic `RSBL`, u16 format version, then the CRC-covered payload:
//! parse mode, dataset table, entity-name snapshot in canonical column
//! order, deduplicated string heap, the file and sidecar tables as
//! run-length-encoded sparse columns of heap references, and the optional
//! metadata block. A CRC32 trailer closes the file; the checksum is
//! computed streamingly on both ends, so a truncated or bit-flipped cache
//! fails `CacheIncompatible` before any half-built index escapes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use tracing::debug;

use crate::construct::LayoutIndex;
use crate::dataset::{Dataset, DatasetDescription, DatasetKind, DescriptionState};
use crate::entity;
use crate::error::{LayoutError, Result};
use crate::metadata::MetadataIndex;
use crate::parse::{ParseMode, ParsedPath};

const MAGIC: &[u8; 4] = b"RSBL";
const VERSION: u16 = 1;
const ABSENT: u32 = u32::MAX;
// Upper bound on any single length field; a corrupt length must fail before
// it turns into an allocation.
const MAX_BLOB: usize = 1 << 28;

fn incompatible(reason: impl Into<String>) -> LayoutError {
    LayoutError::CacheIncompatible(reason.into())
}

// ---------------- checksummed io ----------------

struct CrcWriter<'a, W: Write> {
    inner: &'a mut W,
    crc: Crc32,
}

impl<'a, W: Write> CrcWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }
    fn finalize(self) -> u32 {
        self.crc.finalize()
    }
}

impl<W: Write> Write for CrcWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.crc.update(&buf[..written]);
        Ok(written)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CrcReader<'a, R: Read> {
    inner: &'a mut R,
    crc: Crc32,
}

impl<'a, R: Read> CrcReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }
    fn finalize(self) -> u32 {
        self.crc.finalize()
    }
}

impl<R: Read> Read for CrcReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.crc.update(&buf[..read]);
        Ok(read)
    }
}

// ---------------- primitives ----------------

fn put_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn put_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_bytes(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    put_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

fn put_str(w: &mut impl Write, s: &str) -> io::Result<()> {
    put_bytes(w, s.as_bytes())
}

fn put_opt_str(w: &mut impl Write, s: Option<&str>) -> io::Result<()> {
    match s {
        Some(s) => {
            put_u8(w, 1)?;
            put_str(w, s)
        }
        None => put_u8(w, 0),
    }
}

fn get_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| incompatible("truncated cache file"))?;
    Ok(buf[0])
}

fn get_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)
        .map_err(|_| incompatible("truncated cache file"))?;
    Ok(u16::from_le_bytes(buf))
}

fn get_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| incompatible("truncated cache file"))?;
    Ok(u32::from_le_bytes(buf))
}

fn get_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = get_u32(r)? as usize;
    if len > MAX_BLOB {
        return Err(incompatible("length field out of range"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| incompatible("truncated cache file"))?;
    Ok(buf)
}

fn get_str(r: &mut impl Read) -> Result<String> {
    String::from_utf8(get_bytes(r)?).map_err(|_| incompatible("cache string is not valid utf-8"))
}

fn get_opt_str(r: &mut impl Read) -> Result<Option<String>> {
    match get_u8(r)? {
        0 => Ok(None),
        1 => Ok(Some(get_str(r)?)),
        _ => Err(incompatible("corrupt optional-string flag")),
    }
}

// ---------------- string heap ----------------

#[derive(Default)]
struct Heap {
    strings: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Heap {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(id) = self.ids.get(s) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }
}

fn heap_get(heap: &[String], id: u32) -> Result<&str> {
    heap.get(id as usize)
        .map(String::as_str)
        .ok_or_else(|| incompatible("heap reference out of range"))
}

// ---------------- run-length encoded columns ----------------

fn put_runs(w: &mut impl Write, values: &[u32]) -> io::Result<()> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((len, run_value)) if run_value == value => *len += 1,
            _ => runs.push((1, *value)),
        }
    }
    put_u32(w, runs.len() as u32)?;
    for (len, value) in runs {
        put_u32(w, len)?;
        put_u32(w, value)?;
    }
    Ok(())
}

fn get_runs(r: &mut impl Read, expected: usize) -> Result<Vec<u32>> {
    let run_count = get_u32(r)? as usize;
    let mut values = Vec::with_capacity(expected.min(MAX_BLOB));
    for _ in 0..run_count {
        let len = get_u32(r)? as usize;
        let value = get_u32(r)?;
        if values.len() + len > expected {
            return Err(incompatible("column run overflows the record count"));
        }
        values.extend(std::iter::repeat(value).take(len));
    }
    if values.len() != expected {
        return Err(incompatible("column length does not match record count"));
    }
    Ok(values)
}

// ---------------- record tables ----------------

fn record_value<'a>(record: &'a ParsedPath, name: &str) -> Option<&'a str> {
    match name {
        "datatype" => record.datatype.as_deref(),
        "suffix" => record.suffix.as_deref(),
        "extension" => record.extension.as_deref(),
        _ => record
            .entities
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str()),
    }
}

fn put_record_table(
    w: &mut impl Write,
    records: &[ParsedPath],
    snapshot: &[String],
    heap: &mut Heap,
) -> io::Result<()> {
    put_u32(w, records.len() as u32)?;
    let paths: Vec<u32> = records.iter().map(|r| heap.intern(&r.path)).collect();
    for path in &paths {
        put_u32(w, *path)?;
    }
    let datasets: Vec<u32> = records.iter().map(|r| r.dataset).collect();
    put_runs(w, &datasets)?;
    for name in snapshot {
        let column: Vec<u32> = records
            .iter()
            .map(|record| {
                record_value(record, name)
                    .map(|value| heap.intern(value))
                    .unwrap_or(ABSENT)
            })
            .collect();
        put_runs(w, &column)?;
    }
    for record in records {
        put_u32(w, record.parts.len() as u32)?;
        for part in &record.parts {
            put_u32(w, heap.intern(part))?;
        }
    }
    Ok(())
}

fn get_record_table(
    r: &mut impl Read,
    snapshot: &[String],
    heap: &[String],
) -> Result<Vec<ParsedPath>> {
    let count = get_u32(r)? as usize;
    let mut paths = Vec::with_capacity(count.min(MAX_BLOB));
    for _ in 0..count {
        paths.push(heap_get(heap, get_u32(r)?)?.to_string());
    }
    let datasets = get_runs(r, count)?;
    let mut columns: Vec<Vec<u32>> = Vec::with_capacity(snapshot.len());
    for _ in snapshot {
        columns.push(get_runs(r, count)?);
    }
    let mut records = Vec::with_capacity(count.min(MAX_BLOB));
    for (i, path) in paths.into_iter().enumerate() {
        let mut record = ParsedPath {
            path,
            dataset: datasets[i],
            entities: Vec::new(),
            datatype: None,
            suffix: None,
            extension: None,
            parts: Vec::new(),
        };
        for (name, column) in snapshot.iter().zip(&columns) {
            if column[i] == ABSENT {
                continue;
            }
            let value = heap_get(heap, column[i])?.to_string();
            match name.as_str() {
                "datatype" => record.datatype = Some(value),
                "suffix" => record.suffix = Some(value),
                "extension" => record.extension = Some(value),
                _ => record.entities.push((name.clone(), value)),
            }
        }
        records.push(record);
    }
    for record in &mut records {
        let part_count = get_u32(r)? as usize;
        for _ in 0..part_count {
            record.parts.push(heap_get(heap, get_u32(r)?)?.to_string());
        }
    }
    Ok(records)
}

// ---------------- datasets ----------------

fn put_dataset(w: &mut impl Write, dataset: &Dataset) -> io::Result<()> {
    put_str(w, &dataset.root)?;
    put_u8(
        w,
        match dataset.kind {
            DatasetKind::Raw => 0,
            DatasetKind::Derivative => 1,
        },
    )?;
    put_opt_str(w, dataset.label.as_deref())?;
    match &dataset.description {
        DescriptionState::Missing => put_u8(w, 0)?,
        DescriptionState::Parsed(description) => {
            put_u8(w, 1)?;
            let blob = serde_json::to_vec(description)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            put_bytes(w, &blob)?;
        }
        DescriptionState::Invalid(cause) => {
            put_u8(w, 2)?;
            put_str(w, cause)?;
        }
    }
    put_u32(w, dataset.pipelines.len() as u32)?;
    for pipeline in &dataset.pipelines {
        put_str(w, pipeline)?;
    }
    Ok(())
}

fn get_dataset(r: &mut impl Read) -> Result<Dataset> {
    let root = get_str(r)?;
    let kind = match get_u8(r)? {
        0 => DatasetKind::Raw,
        1 => DatasetKind::Derivative,
        _ => return Err(incompatible("corrupt dataset kind")),
    };
    let label = get_opt_str(r)?;
    let description = match get_u8(r)? {
        0 => DescriptionState::Missing,
        1 => {
            let blob = get_bytes(r)?;
            let description: DatasetDescription = serde_json::from_slice(&blob)
                .map_err(|err| incompatible(format!("corrupt description blob: {err}")))?;
            DescriptionState::Parsed(description)
        }
        2 => DescriptionState::Invalid(get_str(r)?),
        _ => return Err(incompatible("corrupt description flag")),
    };
    let mut pipelines = Vec::new();
    for _ in 0..get_u32(r)? {
        pipelines.push(get_str(r)?);
    }
    Ok(Dataset {
        root,
        kind,
        label,
        description,
        pipelines,
    })
}

// ---------------- save / load ----------------

fn entity_snapshot(index: &LayoutIndex) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for record in index.files().iter().chain(index.sidecars()) {
        for (name, _) in &record.entities {
            push(name);
        }
        if record.datatype.is_some() {
            push("datatype");
        }
        if record.suffix.is_some() {
            push("suffix");
        }
        if record.extension.is_some() {
            push("extension");
        }
    }
    entity::canonical_sort(&mut names);
    names
}

/// Serialize a complete index to `path`.
pub fn save(index: &LayoutIndex, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|err| LayoutError::io(path, err))?;
    let mut out = BufWriter::new(file);
    let io = |err: io::Error| LayoutError::io(path, err);

    out.write_all(MAGIC).map_err(io)?;
    put_u16(&mut out, VERSION).map_err(io)?;

    let mut payload = CrcWriter::new(&mut out);
    put_u8(
        &mut payload,
        match index.mode() {
            ParseMode::Permissive => 0,
            ParseMode::Strict => 1,
        },
    )
    .map_err(io)?;
    put_u32(&mut payload, index.datasets().len() as u32).map_err(io)?;
    for dataset in index.datasets() {
        put_dataset(&mut payload, dataset).map_err(io)?;
    }

    let snapshot = entity_snapshot(index);
    put_u32(&mut payload, snapshot.len() as u32).map_err(io)?;
    for name in &snapshot {
        put_str(&mut payload, name).map_err(io)?;
    }

    // Stage both record tables so the heap is complete before it is
    // written; the heap precedes the columns in the file.
    let mut heap = Heap::default();
    let mut staged = Vec::new();
    put_record_table(&mut staged, index.files(), &snapshot, &mut heap).map_err(io)?;
    put_record_table(&mut staged, index.sidecars(), &snapshot, &mut heap).map_err(io)?;

    let mut metadata_block = Vec::new();
    match index.metadata() {
        Some(metadata) => {
            put_u8(&mut metadata_block, 1).map_err(io)?;
            let mut keys: Vec<&String> = metadata.tables().entities().collect();
            keys.sort();
            put_u32(&mut metadata_block, keys.len() as u32).map_err(io)?;
            for key in keys {
                put_str(&mut metadata_block, key).map_err(io)?;
                let column: Vec<u32> = (0..index.files().len() as u64)
                    .map(|id| {
                        metadata
                            .resolved(id)
                            .and_then(|values| values.get(key))
                            .map(|value| heap.intern(value))
                            .unwrap_or(ABSENT)
                    })
                    .collect();
                put_runs(&mut metadata_block, &column).map_err(io)?;
            }
        }
        None => put_u8(&mut metadata_block, 0).map_err(io)?,
    }

    put_u32(&mut payload, heap.strings.len() as u32).map_err(io)?;
    for string in &heap.strings {
        put_str(&mut payload, string).map_err(io)?;
    }
    payload.write_all(&staged).map_err(io)?;
    payload.write_all(&metadata_block).map_err(io)?;

    let crc = payload.finalize();
    put_u32(&mut out, crc).map_err(io)?;
    out.flush().map_err(io)?;
    debug!(cache = %path.display(), "layout cache written");
    Ok(())
}

/// Load an index from a cache file, validating magic, version and CRC.
pub fn load(path: &Path) -> Result<LayoutIndex> {
    let file = File::open(path).map_err(|err| LayoutError::io(path, err))?;
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 4];
    input
        .read_exact(&mut magic)
        .map_err(|_| incompatible("file is too short for a cache header"))?;
    if &magic != MAGIC {
        return Err(incompatible("bad magic; not a layout cache file"));
    }
    let version = get_u16(&mut input)?;
    if version != VERSION {
        return Err(incompatible(format!(
            "unsupported cache format version {version}"
        )));
    }

    let mut payload = CrcReader::new(&mut input);
    let mode = match get_u8(&mut payload)? {
        0 => ParseMode::Permissive,
        1 => ParseMode::Strict,
        _ => return Err(incompatible("corrupt parse-mode flag")),
    };
    let dataset_count = get_u32(&mut payload)? as usize;
    let mut datasets = Vec::with_capacity(dataset_count.min(1024));
    for _ in 0..dataset_count {
        datasets.push(get_dataset(&mut payload)?);
    }

    let snapshot_count = get_u32(&mut payload)? as usize;
    let mut snapshot = Vec::with_capacity(snapshot_count.min(1024));
    for _ in 0..snapshot_count {
        snapshot.push(get_str(&mut payload)?);
    }

    let heap_count = get_u32(&mut payload)? as usize;
    let mut heap = Vec::with_capacity(heap_count.min(MAX_BLOB));
    for _ in 0..heap_count {
        heap.push(get_str(&mut payload)?);
    }

    let mut records = get_record_table(&mut payload, &snapshot, &heap)?;
    let sidecars = get_record_table(&mut payload, &snapshot, &heap)?;
    let file_count = records.len();
    records.extend(sidecars);

    let metadata = match get_u8(&mut payload)? {
        0 => None,
        1 => {
            let key_count = get_u32(&mut payload)? as usize;
            let mut resolved: HashMap<u64, HashMap<String, String>, _> = HashMap::default();
            for _ in 0..key_count {
                let key = get_str(&mut payload)?;
                let column = get_runs(&mut payload, file_count)?;
                for (id, value) in column.into_iter().enumerate() {
                    if value != ABSENT {
                        resolved
                            .entry(id as u64)
                            .or_default()
                            .insert(key.clone(), heap_get(&heap, value)?.to_string());
                    }
                }
            }
            Some(MetadataIndex::from_resolved(resolved))
        }
        _ => return Err(incompatible("corrupt metadata flag")),
    };

    let computed = payload.finalize();
    let expected = get_u32(&mut input)?;
    if computed != expected {
        return Err(incompatible("checksum mismatch"));
    }

    let index = LayoutIndex::from_parts(datasets, records, mode);
    if let Some(metadata) = metadata {
        index.restore_metadata(metadata);
    }
    Ok(index)
}

/// Does a cached index answer exactly this construction request? The root
/// set, kinds, labels (order included) and parse mode must all match.
pub fn matches_request(index: &LayoutIndex, datasets: &[Dataset], mode: ParseMode) -> bool {
    index.mode() == mode
        && index.datasets().len() == datasets.len()
        && index
            .datasets()
            .iter()
            .zip(datasets)
            .all(|(cached, requested)| {
                cached.root == requested.root
                    && cached.kind == requested.kind
                    && cached.label == requested.label
            })
}
