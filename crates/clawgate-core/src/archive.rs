//! Archive export and import for worker state
//!
//! Export streams the worker data directory as a gzipped tarball
//! without buffering it in memory. Import accepts a bounded upload,
//! extracts it with path-traversal defenses into a temp directory,
//! then swaps it into place and reconciles the embedded auth token
//! with the gateway's own.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

/// Hard cap on the compressed size of an imported archive.
pub const IMPORT_SIZE_LIMIT: u64 = 256 * 1024 * 1024;

/// Top-level directory name inside exported archives.
const ARCHIVE_ROOT: &str = "openclaw";

/// Directory name used by exports from older gateway versions.
const LEGACY_ROOT: &str = "gateway";

/// Buffer size for the export pipe between the blocking tar writer
/// and the async response body.
const EXPORT_PIPE_CAPACITY: usize = 64 * 1024;

/// Paths and naming conventions for worker state archives.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    /// Worker data directory (tree that gets exported/replaced)
    pub data_dir: PathBuf,
    /// File inside the data dir holding the worker's auth token
    pub token_file: PathBuf,
}

impl ArchiveLayout {
    /// Layout rooted at `data_dir`, with the conventional token file.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let token_file = data_dir.join("auth-token");
        Self {
            data_dir,
            token_file,
        }
    }

    /// Suggested download filename, timestamped.
    #[must_use]
    pub fn export_filename(&self) -> String {
        format!(
            "openclaw-export-{}.tar.gz",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        )
    }
}

/// Summary of an import, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// Regular files written into the data dir
    pub files_written: usize,
    /// Entries rejected as unsafe (traversal, absolute, link escapes)
    pub entries_skipped: usize,
    /// Whether the archive used the legacy `gateway/` root
    pub legacy_layout: bool,
    /// Whether the embedded token was replaced with the gateway's own
    pub token_reconciled: bool,
}

// ── export ──────────────────────────────────────────────────────────

/// Stream the data directory as a gzipped tarball.
///
/// Returns an async reader suitable for a streaming response body; the
/// tarball is produced on a blocking task and piped through a bounded
/// in-memory duplex, so the full archive never lives in memory.
pub fn export_archive(layout: &ArchiveLayout) -> Result<DuplexStream> {
    let data_dir = layout.data_dir.clone();
    if !data_dir.is_dir() {
        return Err(Error::Io(format!(
            "data directory {} does not exist",
            data_dir.display()
        )));
    }

    let (writer, reader) = tokio::io::duplex(EXPORT_PIPE_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(writer);
        let encoder = GzEncoder::new(bridge, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let result = builder
            .append_dir_all(ARCHIVE_ROOT, &data_dir)
            .and_then(|()| builder.into_inner())
            .and_then(|encoder| encoder.finish());
        match result {
            Ok(_) => debug!(dir = %data_dir.display(), "export archive finished"),
            // Reader dropped (client went away) surfaces as a broken
            // pipe here; nothing to clean up.
            Err(e) => debug!(error = %e, "export archive aborted"),
        }
    });

    Ok(reader)
}

// ── import ──────────────────────────────────────────────────────────

/// Read a bounded upload, extract it safely, and replace the data dir.
///
/// The upload is buffered up to [`IMPORT_SIZE_LIMIT`]; anything larger
/// is rejected before extraction starts. Extraction happens in a temp
/// directory sibling to the data dir, and the swap is performed only
/// after the whole archive extracted cleanly.
pub async fn import_archive<R>(layout: &ArchiveLayout, mut upload: R) -> Result<ImportReport>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut upload).take(IMPORT_SIZE_LIMIT + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() as u64 > IMPORT_SIZE_LIMIT {
        return Err(Error::PayloadTooLarge {
            size: buf.len() as u64,
            limit: IMPORT_SIZE_LIMIT,
        });
    }

    let layout = layout.clone();
    let gateway_token = match tokio::fs::read_to_string(&layout.token_file).await {
        Ok(t) => Some(t.trim().to_string()),
        Err(_) => None,
    };

    tokio::task::spawn_blocking(move || extract_and_swap(&layout, &buf, gateway_token))
        .await
        .map_err(|e| Error::Internal(format!("import task panicked: {e}")))?
}

fn extract_and_swap(
    layout: &ArchiveLayout,
    archive: &[u8],
    gateway_token: Option<String>,
) -> Result<ImportReport> {
    let parent = layout
        .data_dir
        .parent()
        .ok_or_else(|| Error::Io("data directory has no parent".into()))?;
    std::fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".import-")
        .tempdir_in(parent)?;

    let mut report = extract_into(archive, staging.path())?;

    // Accept both the current and the legacy top-level directory.
    let current = staging.path().join(ARCHIVE_ROOT);
    let legacy = staging.path().join(LEGACY_ROOT);
    let extracted_root = if current.is_dir() {
        current
    } else if legacy.is_dir() {
        info!("import uses legacy archive layout, renaming");
        report.legacy_layout = true;
        legacy
    } else {
        return Err(Error::Io(
            "archive does not contain an openclaw data directory".into(),
        ));
    };

    // Keep the gateway's token authoritative over the imported one,
    // otherwise the running gateway locks itself out of the worker.
    if let Some(token) = gateway_token {
        let imported_token = extracted_root.join(
            layout
                .token_file
                .strip_prefix(&layout.data_dir)
                .unwrap_or(Path::new("auth-token")),
        );
        let differs = match std::fs::read_to_string(&imported_token) {
            Ok(existing) => existing.trim() != token,
            Err(_) => true,
        };
        if differs {
            std::fs::write(&imported_token, &token)?;
            report.token_reconciled = true;
        }
    }

    // Swap: move the old tree aside, move the new one in, then drop
    // the old. If the second rename fails, restore the original.
    let backup = parent.join(".import-prev");
    let _ = std::fs::remove_dir_all(&backup);
    let had_previous = layout.data_dir.exists();
    if had_previous {
        std::fs::rename(&layout.data_dir, &backup)?;
    }
    if let Err(e) = std::fs::rename(&extracted_root, &layout.data_dir) {
        if had_previous {
            let _ = std::fs::rename(&backup, &layout.data_dir);
        }
        return Err(e.into());
    }
    let _ = std::fs::remove_dir_all(&backup);

    info!(
        files = report.files_written,
        skipped = report.entries_skipped,
        "import completed"
    );
    Ok(report)
}

/// Unpack `archive` under `dest`, skipping every entry whose path
/// could land outside `dest`.
fn extract_into(archive: &[u8], dest: &Path) -> Result<ImportReport> {
    let decoder = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);

    let mut report = ImportReport {
        files_written: 0,
        entries_skipped: 0,
        legacy_layout: false,
        token_reconciled: false,
    };

    for entry in tar.entries().map_err(|e| Error::Io(e.to_string()))? {
        let mut entry = entry.map_err(|e| Error::Io(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::Io(e.to_string()))?
            .into_owned();

        if !entry_path_is_safe(&path) {
            let err = Error::ArchiveEntryUnsafe(path.to_string_lossy().into_owned());
            warn!("skipping archive entry: {err}");
            report.entries_skipped += 1;
            continue;
        }
        match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            // Links could escape the staging dir even with a safe
            // member path, so they are dropped wholesale.
            _ => {
                report.entries_skipped += 1;
                continue;
            }
        }

        let target = dest.join(&path);
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if entry.header().entry_type() == tar::EntryType::Directory {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        report.files_written += 1;
    }

    Ok(report)
}

/// A member path is safe only if it is relative and never steps up.
fn entry_path_is_safe(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components().all(|c| match c {
        Component::Normal(_) | Component::CurDir => true,
        Component::ParentDir | Component::RootDir | Component::Prefix(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // `Builder::append_data` refuses hostile member names, so the
    // header name bytes are written directly; imports must cope with
    // archives no well-behaved writer would produce.
    fn build_archive(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let path = if root.is_empty() {
                (*name).to_string()
            } else {
                format!("{root}/{name}")
            };
            let mut header = tar::Header::new_gnu();
            {
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name[..path.len()].copy_from_slice(path.as_bytes());
            }
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        assert!(!entry_path_is_safe(Path::new("../../etc/passwd")));
        assert!(!entry_path_is_safe(Path::new("a/../../b")));
        assert!(!entry_path_is_safe(Path::new("/etc/passwd")));
        assert!(entry_path_is_safe(Path::new("data/file.json")));
        assert!(entry_path_is_safe(Path::new("./data/file.json")));
    }

    #[tokio::test]
    async fn import_skips_unsafe_entries_and_writes_safe_ones() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("state"));

        let archive = build_archive(
            "",
            &[
                ("../../etc/passwd", "owned"),
                ("a/../../b", "owned"),
                ("openclaw/data/file.json", "{\"ok\":true}"),
            ],
        );

        let report = import_archive(&layout, archive.as_slice()).await.unwrap();
        assert_eq!(report.files_written, 1);
        assert_eq!(report.entries_skipped, 2);

        let content =
            std::fs::read_to_string(layout.data_dir.join("data/file.json")).unwrap();
        assert_eq!(content, "{\"ok\":true}");
        assert!(!dir.path().join("etc/passwd").exists());
    }

    #[tokio::test]
    async fn import_renames_legacy_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("state"));

        let archive = build_archive("gateway", &[("settings.json", "{}")]);
        let report = import_archive(&layout, archive.as_slice()).await.unwrap();

        assert!(report.legacy_layout);
        assert!(layout.data_dir.join("settings.json").is_file());
    }

    #[tokio::test]
    async fn import_keeps_gateway_token_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("state"));
        std::fs::create_dir_all(&layout.data_dir).unwrap();
        std::fs::write(&layout.token_file, "gateway-token\n").unwrap();

        let archive = build_archive("openclaw", &[("auth-token", "imported-token")]);
        let report = import_archive(&layout, archive.as_slice()).await.unwrap();

        assert!(report.token_reconciled);
        let token = std::fs::read_to_string(&layout.token_file).unwrap();
        assert_eq!(token.trim(), "gateway-token");
    }

    #[tokio::test]
    async fn import_rejects_oversized_upload() {
        struct Endless;
        impl AsyncRead for Endless {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let chunk = vec![0u8; buf.remaining()];
                buf.put_slice(&chunk);
                std::task::Poll::Ready(Ok(()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("state"));
        let err = import_archive(&layout, Endless).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn export_then_import_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("state"));
        std::fs::create_dir_all(layout.data_dir.join("sessions")).unwrap();
        let mut f = std::fs::File::create(layout.data_dir.join("sessions/log.json")).unwrap();
        f.write_all(b"[1,2,3]").unwrap();

        let mut reader = export_archive(&layout).unwrap();
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes)
            .await
            .unwrap();

        let restored = ArchiveLayout::new(dir.path().join("restored"));
        let report = import_archive(&restored, bytes.as_slice()).await.unwrap();
        assert!(report.files_written >= 1);
        let content =
            std::fs::read_to_string(restored.data_dir.join("sessions/log.json")).unwrap();
        assert_eq!(content, "[1,2,3]");
    }
}
