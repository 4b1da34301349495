use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::metainfo::TorrentMeta;
use crate::piece_map::PieceMap;

struct StoreFile {
    path: PathBuf,
    length: u64,
    handle: File,
}

/// Owns the output files and turns verified piece buffers into positioned
/// writes through the piece map. Exclusive-borrow access keeps the writes
/// serialized; the scheduler task is the only writer.
pub struct FileStore {
    files: Vec<StoreFile>,
    map: PieceMap,
}

impl FileStore {
    /// Open (and size) every output file. Single-file torrents land at
    /// `<output_dir>/<name>`; multi-file torrents under
    /// `<output_dir>/<name>/<path segments...>`.
    pub async fn create(
        output_dir: impl AsRef<Path>,
        meta: &TorrentMeta,
        map: PieceMap,
    ) -> std::io::Result<Self> {
        let single_file = meta.files().len() == 1;
        let mut files = Vec::with_capacity(meta.files().len());
        for entry in meta.files() {
            let mut path = output_dir.as_ref().to_path_buf();
            if !single_file {
                path.push(meta.name());
            }
            for segment in &entry.path {
                path.push(segment);
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .await?;
            // Extend to the declared size by writing a single zero byte at
            // the end; the filesystem may keep the rest sparse.
            if entry.length > 0 {
                handle.seek(SeekFrom::Start(entry.length - 1)).await?;
                handle.write_all(&[0]).await?;
            }
            debug!(path = %path.display(), length = entry.length, "opened output file");
            files.push(StoreFile {
                path,
                length: entry.length,
                handle,
            });
        }
        Ok(Self { files, map })
    }

    /// Write one verified piece to its mapped file segments, left to
    /// right, then sync the touched files.
    pub async fn write_piece(&mut self, piece_index: u32, data: &[u8]) -> std::io::Result<()> {
        let segments = self
            .map
            .segments(piece_index)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        let expected: u64 = segments.iter().map(|s| s.length).sum();
        if data.len() as u64 != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "piece {} data length {} does not match mapped length {}",
                    piece_index,
                    data.len(),
                    expected
                ),
            ));
        }

        let mut cursor = 0usize;
        let mut touched = Vec::new();
        for segment in segments {
            let file = &mut self.files[segment.file_index];
            debug_assert!(segment.file_offset + segment.length <= file.length);
            file.handle.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.handle
                .write_all(&data[cursor..cursor + segment.length as usize])
                .await?;
            cursor += segment.length as usize;
            if !touched.contains(&segment.file_index) {
                touched.push(segment.file_index);
            }
        }
        for index in touched {
            self.files[index].handle.sync_all().await?;
        }
        Ok(())
    }

    /// Sync every file; called once at shutdown.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        for file in &mut self.files {
            file.handle.sync_all().await?;
        }
        Ok(())
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }
}
