//! Intermediate store: deterministic file naming plus record encoding for
//! everything that flows between the Map and Reduce phases.
//!
//! Every (map index, reduce index) pair owns exactly one location, and every
//! write is an atomic full overwrite, so re-running a map task after a
//! presumed crash replaces stale data instead of appending to it.

use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use fnv::FnvHasher;
use log::trace;

use crate::KeyValue;

/// Location of the records map task `map_idx` produced for reducer `reduce_idx`.
pub fn intermediate_path(dir: &Path, map_idx: usize, reduce_idx: usize) -> PathBuf {
    dir.join(format!("mr-{}-{}", map_idx, reduce_idx))
}

/// Location of reducer `reduce_idx`'s final output.
pub fn output_path(dir: &Path, reduce_idx: usize) -> PathBuf {
    dir.join(format!("mr-out-{}", reduce_idx))
}

/// Reducer index a key is routed to. FNV keeps the routing stable across
/// workers, so all records for one key land in the same partition.
pub fn partition(key: &str, nreduce: usize) -> usize {
    let mut hasher = FnvHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % nreduce
}

/// Write a bucket of intermediate records, one JSON record per line,
/// replacing whatever was at `path` before.
pub fn write_records(path: &Path, records: &[KeyValue]) -> Result<()> {
    let mut buf = String::new();
    for kv in records {
        buf.push_str(&serde_json::to_string(kv)?);
        buf.push('\n');
    }
    let af = AtomicFile::new(path, AllowOverwrite);
    af.write(|f| f.write_all(buf.as_bytes()))
        .map_err(|e| anyhow!("cannot write {}: {}", path.display(), e))?;
    trace!("wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// Read one intermediate location back. Fails if the file is missing or holds
/// a malformed record; callers treat that as a fatal local error.
pub fn read_records(path: &Path) -> Result<Vec<KeyValue>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("cannot read {}", path.display()))?;
        if line.is_empty() {
            continue;
        }
        records.push(
            serde_json::from_str(&line)
                .with_context(|| format!("malformed record in {}", path.display()))?,
        );
    }
    Ok(records)
}

/// Write final output lines, `key value` per group, replacing prior contents.
pub fn write_output(path: &Path, groups: &[(String, String)]) -> Result<()> {
    let mut buf = String::new();
    for (key, value) in groups {
        buf.push_str(key);
        buf.push(' ');
        buf.push_str(value);
        buf.push('\n');
    }
    let af = AtomicFile::new(path, AllowOverwrite);
    af.write(|f| f.write_all(buf.as_bytes()))
        .map_err(|e| anyhow!("cannot write {}: {}", path.display(), e))?;
    trace!("wrote {} groups to {}", groups.len(), path.display());
    Ok(())
}
