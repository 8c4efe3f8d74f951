//! Point-in-time JSON snapshots of the database.
//!
//! A backup is streamed straight from the snapshot into an optional gzip
//! encoder and onto disk under a temporary name; the file is fsynced and
//! renamed into place only once complete. The SHA-256 of the bytes on disk
//! goes into a `sha256sum`-compatible sidecar next to it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::digest::{HashingWriter, sha256_reader};
use crate::models::{Snapshot, TableCounts};

const FILE_SUFFIX: &str = "-backup_data.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    /// Write compact JSON instead of indented.
    pub minimize: bool,
    pub gzip: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            minimize: false,
            gzip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub checksum: String,
    pub bytes: u64,
    pub counts: TableCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub has_checksum: bool,
}

#[must_use]
pub fn backup_file_name(now: DateTime<Utc>, gzip: bool) -> String {
    let stamp = now.format("%Y-%m-%d_%H-%M-%SZ");
    if gzip {
        format!("{stamp}{FILE_SUFFIX}.gz")
    } else {
        format!("{stamp}{FILE_SUFFIX}")
    }
}

#[must_use]
pub fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    path.with_file_name(name)
}

fn write_json<W: Write>(writer: W, snapshot: &Snapshot, minimize: bool) -> Result<()> {
    if minimize {
        serde_json::to_writer(writer, snapshot)?;
    } else {
        serde_json::to_writer_pretty(writer, snapshot)?;
    }
    Ok(())
}

/// Encode a snapshot in memory, for downloads.
pub fn encode_snapshot(snapshot: &Snapshot, opts: BackupOptions) -> Result<Vec<u8>> {
    if opts.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        write_json(&mut encoder, snapshot, opts.minimize)?;
        Ok(encoder.finish()?)
    } else {
        let mut out = Vec::new();
        write_json(&mut out, snapshot, opts.minimize)?;
        Ok(out)
    }
}

/// Stream `snapshot` to `path` through a temporary file. Returns the hex
/// digest and size of what landed on disk.
fn write_snapshot_atomic(
    path: &Path,
    snapshot: &Snapshot,
    opts: BackupOptions,
) -> Result<(String, u64)> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| -> Result<(String, u64)> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut hashing = HashingWriter::new(BufWriter::new(file));

        if opts.gzip {
            let mut encoder = GzEncoder::new(&mut hashing, Compression::default());
            write_json(&mut encoder, snapshot, opts.minimize)?;
            encoder.finish()?;
        } else {
            write_json(&mut hashing, snapshot, opts.minimize)?;
        }

        let (writer, digest, bytes) = hashing.finish();
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move backup into place: {}", path.display()))?;
        Ok((digest, bytes))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Names have one-second resolution; a taken name moves the stamp forward
/// so listings stay in creation order.
fn free_backup_path(dir: &Path, now: DateTime<Utc>, gzip: bool) -> Result<PathBuf> {
    for offset in 0..60 {
        let path = dir.join(backup_file_name(now + TimeDelta::seconds(offset), gzip));
        if !path.exists() {
            return Ok(path);
        }
    }
    bail!("Too many backups created at {}", now.to_rfc3339());
}

pub fn create_backup(db: &Database, dir: &Path, opts: BackupOptions) -> Result<BackupInfo> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create backup directory: {}", dir.display()))?;
    let path = free_backup_path(dir, Utc::now(), opts.gzip)?;

    info!("Creating database backup...");
    let snapshot = db.export_snapshot()?;
    let (checksum, bytes) = write_snapshot_atomic(&path, &snapshot, opts)?;

    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    fs::write(checksum_path(&path), format!("{checksum}  {file_name}\n"))
        .context("Failed to write checksum file")?;

    info!(path = %path.display(), bytes, "Backup created successfully");
    Ok(BackupInfo {
        path,
        checksum,
        bytes,
        counts: snapshot.counts(),
    })
}

/// Recompute the file digest and compare it with the sidecar. Returns the
/// verified digest.
pub fn verify_backup(path: &Path) -> Result<String> {
    let sidecar = checksum_path(path);
    let recorded = fs::read_to_string(&sidecar)
        .with_context(|| format!("No checksum file: {}", sidecar.display()))?;
    let Some(expected) = recorded.split_whitespace().next() else {
        bail!("Checksum file is empty: {}", sidecar.display());
    };

    let file =
        File::open(path).with_context(|| format!("Failed to open backup: {}", path.display()))?;
    let actual = sha256_reader(BufReader::new(file))?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "Checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        );
    }
    debug!(path = %path.display(), "Backup checksum verified");
    Ok(actual)
}

/// Parse a snapshot from raw JSON or gzip-compressed JSON.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let snapshot: Snapshot = if bytes.starts_with(&GZIP_MAGIC) {
        serde_json::from_reader(GzDecoder::new(bytes)).context("Invalid compressed backup")?
    } else {
        serde_json::from_slice(bytes).context("Invalid backup JSON")?
    };
    Ok(snapshot)
}

pub fn read_backup(path: &Path) -> Result<Snapshot> {
    if checksum_path(path).exists() {
        verify_backup(path)?;
    } else {
        warn!(path = %path.display(), "Backup has no checksum file; skipping verification");
    }
    let mut bytes = Vec::new();
    File::open(path)
        .with_context(|| format!("Failed to open backup: {}", path.display()))?
        .read_to_end(&mut bytes)?;
    decode_snapshot(&bytes)
}

pub fn restore_backup(db: &Database, path: &Path) -> Result<TableCounts> {
    let snapshot = read_backup(path)?;
    info!(path = %path.display(), "Restoring backup");
    db.restore_snapshot(&snapshot)
}

/// Back up, then empty every table.
pub fn backup_and_truncate(
    db: &Database,
    dir: &Path,
    opts: BackupOptions,
) -> Result<(BackupInfo, TableCounts)> {
    let info = create_backup(db, dir, opts)?;
    let removed = db.truncate_all()?;
    Ok((info, removed))
}

/// Backup files in `dir`, newest first.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !(name.ends_with(FILE_SUFFIX) || name.ends_with(&format!("{FILE_SUFFIX}.gz"))) {
            continue;
        }
        let path = entry.path();
        backups.push(BackupFile {
            bytes: entry.metadata()?.len(),
            has_checksum: checksum_path(&path).exists(),
            name,
            path,
        });
    }
    // Names start with a UTC timestamp.
    backups.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(backups)
}
