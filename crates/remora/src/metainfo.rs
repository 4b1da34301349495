use bendy::decoding::Decoder;
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::error::EngineError;

/// Characters never allowed in a path segment of a torrent file entry.
const FORBIDDEN_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// One file declared by the metainfo. `path` holds the relative path
/// segments; for a single-file torrent it is the torrent name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

/// Parsed, validated torrent metadata. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    announce: String,
    name: String,
    info_hash: [u8; 20],
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    total_length: u64,
    files: Vec<FileEntry>,
}

impl TorrentMeta {
    /// Read and parse a `.torrent` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Parse bencoded metainfo.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| EngineError::Metainfo("empty torrent file".into()))?
            .try_into_dictionary()?;

        let mut announce = None;
        let mut info_bytes = None;
        while let Some((key, value)) = dict.next_pair()? {
            match key {
                b"announce" => {
                    let val = value.try_into_bytes()?;
                    announce = Some(String::from_utf8_lossy(val).into_owned());
                }
                b"info" => {
                    let dict = value.try_into_dictionary()?;
                    let raw = dict.into_raw()?;
                    info_bytes = Some(raw.to_vec());
                }
                _ => {}
            }
        }

        let announce =
            announce.ok_or_else(|| EngineError::Metainfo("missing announce".into()))?;
        let info =
            info_bytes.ok_or_else(|| EngineError::Metainfo("missing info dict".into()))?;

        let mut hasher = Sha1::new();
        hasher.update(&info);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&hasher.finalize());

        let (name, piece_length, piece_hashes, files) = parse_info(&info)?;
        Self::from_parts(announce, name, info_hash, piece_length, piece_hashes, files)
    }

    /// Assemble metadata from already-parsed parts, running the
    /// cross-field validation. Also the test-suite entry point.
    pub fn from_parts(
        announce: String,
        name: String,
        info_hash: [u8; 20],
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<FileEntry>,
    ) -> Result<Self, EngineError> {
        if piece_length == 0 {
            return Err(EngineError::Metainfo("piece length is zero".into()));
        }
        if files.is_empty() {
            return Err(EngineError::Metainfo("no files declared".into()));
        }
        for entry in &files {
            if entry.path.is_empty() {
                return Err(EngineError::Metainfo("file with empty path".into()));
            }
            for segment in &entry.path {
                validate_segment(segment)?;
            }
        }
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(EngineError::Metainfo(format!(
                "declared {} piece hashes, lengths require {}",
                piece_hashes.len(),
                expected_pieces
            )));
        }
        Ok(Self {
            announce,
            name,
            info_hash,
            piece_length,
            piece_hashes,
            total_length,
            files,
        })
    }

    pub fn announce(&self) -> &str {
        &self.announce
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Length of one piece; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        (end - start) as u32
    }
}

fn validate_segment(segment: &str) -> Result<(), EngineError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(EngineError::Metainfo(format!(
            "illegal path segment {:?}",
            segment
        )));
    }
    if segment.contains(FORBIDDEN_PATH_CHARS) {
        return Err(EngineError::Metainfo(format!(
            "forbidden character in path segment {:?}",
            segment
        )));
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn parse_info(bytes: &[u8]) -> Result<(String, u32, Vec<[u8; 20]>, Vec<FileEntry>), EngineError> {
    let mut decoder = Decoder::new(bytes);
    let mut dict = decoder
        .next_object()?
        .ok_or_else(|| EngineError::Metainfo("empty info dict".into()))?
        .try_into_dictionary()?;

    let mut name = None;
    let mut piece_length = None;
    let mut pieces = None;
    let mut files = Vec::new();
    let mut single_file_length = None;

    while let Some((key, value)) = dict.next_pair()? {
        match key {
            b"name" => {
                name = Some(String::from_utf8_lossy(value.try_into_bytes()?).into_owned());
            }
            b"piece length" => {
                let len = value.try_into_integer()?;
                piece_length = Some(
                    len.parse::<u32>()
                        .map_err(|e| EngineError::Metainfo(e.to_string()))?,
                );
            }
            b"pieces" => {
                let blob = value.try_into_bytes()?;
                if blob.len() % 20 != 0 {
                    return Err(EngineError::Metainfo(
                        "pieces blob not a multiple of 20 bytes".into(),
                    ));
                }
                let hashes = blob
                    .chunks_exact(20)
                    .map(|chunk| {
                        let mut arr = [0u8; 20];
                        arr.copy_from_slice(chunk);
                        arr
                    })
                    .collect();
                pieces = Some(hashes);
            }
            b"files" => {
                files = parse_file_list(value)?;
            }
            b"length" => {
                let len = value.try_into_integer()?;
                single_file_length = Some(
                    len.parse::<u64>()
                        .map_err(|e| EngineError::Metainfo(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| EngineError::Metainfo("missing name".into()))?;
    if files.is_empty() {
        let length =
            single_file_length.ok_or_else(|| EngineError::Metainfo("missing length".into()))?;
        files.push(FileEntry {
            length,
            path: vec![name.clone()],
        });
    }
    let piece_length =
        piece_length.ok_or_else(|| EngineError::Metainfo("missing piece length".into()))?;
    let pieces = pieces.ok_or_else(|| EngineError::Metainfo("missing pieces".into()))?;
    Ok((name, piece_length, pieces, files))
}

fn parse_file_list(list_obj: bendy::decoding::Object) -> Result<Vec<FileEntry>, EngineError> {
    let mut list = list_obj.try_into_list()?;
    let mut files = Vec::new();
    while let Some(entry) = list.next_object()? {
        let mut dict = entry.try_into_dictionary()?;
        let mut length = None;
        let mut path = Vec::new();
        while let Some((key, value)) = dict.next_pair()? {
            match key {
                b"length" => {
                    length = Some(
                        value
                            .try_into_integer()?
                            .parse::<u64>()
                            .map_err(|e| EngineError::Metainfo(e.to_string()))?,
                    );
                }
                b"path" => {
                    let mut segments = value.try_into_list()?;
                    while let Some(component) = segments.next_object()? {
                        let bytes = component.try_into_bytes()?;
                        path.push(String::from_utf8_lossy(bytes).into_owned());
                    }
                }
                _ => {}
            }
        }
        files.push(FileEntry {
            length: length.ok_or_else(|| EngineError::Metainfo("file missing length".into()))?,
            path,
        });
    }
    Ok(files)
}
