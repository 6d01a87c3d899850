//! On-disk manifest and partition files of a cache entry.
//!
//! Layout of one entry directory:
//!
//! ```text
//! <root>/<fingerprint name>/
//!     manifest.json
//!     train.jsonl
//!     eval.jsonl
//!     test.jsonl
//! ```

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::Result;
use crate::domain::sample::{SampleRecord, Split};
use crate::fingerprint::Fingerprint;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Partition schema identifier written into every manifest.
pub const PARTITION_SCHEMA: &str = "sift.sample_record.jsonl/v1";

/// A named slice of a materialized dataset, one per split.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub split: Split,
    pub records: Vec<SampleRecord>,
}

impl Partition {
    pub fn new(split: Split, records: Vec<SampleRecord>) -> Self {
        Self { split, records }
    }

    /// Group records by originating split. Always yields all three splits,
    /// possibly empty, so every manifest has the same shape.
    pub fn group(records: impl IntoIterator<Item = SampleRecord>) -> Vec<Partition> {
        let mut parts: Vec<Partition> = Split::ALL
            .iter()
            .map(|s| Partition::new(*s, Vec::new()))
            .collect();
        for record in records {
            let idx = Split::ALL
                .iter()
                .position(|s| *s == record.originating_split)
                .unwrap_or(0);
            parts[idx].records.push(record);
        }
        parts
    }

    pub fn file_name(&self) -> String {
        format!("{}.jsonl", self.split)
    }
}

/// Expected shape of one partition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub split: Split,
    pub file: String,
    pub records: usize,
    pub bytes: u64,
}

/// Recorded at creation, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub schema: String,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub source_parameters: serde_json::Value,
    pub partitions: Vec<PartitionManifest>,
}

impl CacheManifest {
    pub fn total_records(&self) -> usize {
        self.partitions.iter().map(|p| p.records).sum()
    }

    pub fn partition(&self, split: Split) -> Option<&PartitionManifest> {
        self.partitions.iter().find(|p| p.split == split)
    }
}

/// Write partition files and the manifest into `dir`.
///
/// `dir` is a staging directory; the caller publishes it with a rename.
pub(crate) fn materialize(
    dir: &Path,
    fingerprint: &Fingerprint,
    source_parameters: serde_json::Value,
    partitions: &[Partition],
) -> Result<CacheManifest> {
    let mut entries = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let file = partition.file_name();
        let path = dir.join(&file);
        let mut writer = BufWriter::new(File::create(&path)?);
        for record in &partition.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        entries.push(PartitionManifest {
            split: partition.split,
            file,
            records: partition.records.len(),
            bytes: fs::metadata(&path)?.len(),
        });
    }

    let manifest = CacheManifest {
        schema: PARTITION_SCHEMA.to_string(),
        fingerprint: fingerprint.clone(),
        created_at: Utc::now(),
        source_parameters,
        partitions: entries,
    };
    // Manifest goes last: a directory without one is never a finished entry.
    fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
    Ok(manifest)
}

pub(crate) fn read_manifest(dir: &Path) -> std::result::Result<CacheManifest, String> {
    let raw = fs::read(dir.join(MANIFEST_FILE)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "manifest missing; entry was never completed".to_string()
        } else {
            format!("manifest unreadable: {e}")
        }
    })?;
    serde_json::from_slice(&raw).map_err(|e| format!("manifest corrupt: {e}"))
}

/// Compare the files in `dir` against `manifest`. Returns the first mismatch.
pub(crate) fn verify(dir: &Path, manifest: &CacheManifest) -> std::result::Result<(), String> {
    if manifest.schema != PARTITION_SCHEMA {
        return Err(format!(
            "schema {} does not match expected {}",
            manifest.schema, PARTITION_SCHEMA
        ));
    }
    for part in &manifest.partitions {
        let path = dir.join(&part.file);
        let meta = fs::metadata(&path).map_err(|e| format!("{}: {e}", part.file))?;
        if meta.len() != part.bytes {
            return Err(format!(
                "{}: {} bytes on disk, manifest records {}",
                part.file,
                meta.len(),
                part.bytes
            ));
        }
        let file = File::open(&path).map_err(|e| format!("{}: {e}", part.file))?;
        let lines = BufReader::new(file)
            .lines()
            .filter(|l| l.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
            .count();
        if lines != part.records {
            return Err(format!(
                "{}: {} records on disk, manifest records {}",
                part.file, lines, part.records
            ));
        }
    }
    Ok(())
}

pub(crate) fn read_partition(path: &Path) -> Result<Vec<SampleRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
