use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::{db_path, DB_FILE_NAME};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/timetable.sqlite3";
pub const BUNDLE_FORMAT: &str = "timetable-backup-v1";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    app_version: String,
    exported_at: String,
    db_sha256: String,
    db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes the workspace database into a zip bundle at `out_path`.
///
/// The caller is expected to checkpoint the WAL first so the file on disk is complete.
pub fn export_backup(workspace: &Path, out_path: &Path) -> anyhow::Result<BackupSummary> {
    let src = db_path(workspace);
    if !src.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            src.to_string_lossy()
        ));
    }
    let db_bytes = std::fs::read(&src)
        .with_context(|| format!("failed to read database {}", src.to_string_lossy()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = Manifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_sha256: db_sha256.clone(),
        db_bytes: db_bytes.len() as u64,
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize backup bundle")?;

    Ok(BackupSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Replaces the workspace database with the one stored in `in_path`.
///
/// The caller must close its connection before calling and reopen afterwards.
pub fn import_backup(in_path: &Path, workspace: &Path) -> anyhow::Result<BackupSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .with_context(|| format!("bundle missing {DB_ENTRY}"))?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != manifest.db_sha256 {
        return Err(anyhow!(
            "database checksum mismatch: manifest {} actual {}",
            manifest.db_sha256,
            actual
        ));
    }

    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let tmp_dst = workspace.join(format!("{DB_FILE_NAME}.importing"));
    std::fs::write(&tmp_dst, &db_bytes).with_context(|| {
        format!(
            "failed to write temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;

    let dst = db_path(workspace);
    for sidecar in ["-wal", "-shm"] {
        let p = workspace.join(format!("{DB_FILE_NAME}{sidecar}"));
        if p.exists() {
            let _ = std::fs::remove_file(&p);
        }
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(BackupSummary {
        bundle_format: manifest.format,
        db_sha256: actual,
        db_bytes: db_bytes.len() as u64,
    })
}
