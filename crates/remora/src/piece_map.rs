use crate::error::EngineError;
use crate::metainfo::TorrentMeta;

/// A contiguous byte range of one output file covered by a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index into the metainfo file table.
    pub file_index: usize,
    /// Offset within that file.
    pub file_offset: u64,
    /// Number of bytes.
    pub length: u64,
}

/// Precomputed piece-to-file mapping. For each piece, the ordered list of
/// file segments its bytes land in; the order matches the piece buffer
/// left to right.
#[derive(Debug)]
pub struct PieceMap {
    segments: Vec<Vec<Segment>>,
}

impl PieceMap {
    pub fn new(meta: &TorrentMeta) -> Self {
        let piece_count = meta.piece_count() as usize;
        let piece_length = meta.piece_length() as u64;
        let total = meta.total_length();

        // File table with cumulative start offsets.
        let mut starts = Vec::with_capacity(meta.files().len());
        let mut offset = 0u64;
        for file in meta.files() {
            starts.push(offset);
            offset += file.length;
        }

        let mut segments = Vec::with_capacity(piece_count);
        for piece in 0..piece_count as u64 {
            let piece_start = piece * piece_length;
            let piece_end = (piece_start + piece_length).min(total);
            let mut ranges = Vec::new();
            for (file_index, file) in meta.files().iter().enumerate() {
                let file_start = starts[file_index];
                let file_end = file_start + file.length;
                if piece_start < file_end && piece_end > file_start {
                    let overlap_start = piece_start.max(file_start);
                    let overlap_end = piece_end.min(file_end);
                    ranges.push(Segment {
                        file_index,
                        file_offset: overlap_start - file_start,
                        length: overlap_end - overlap_start,
                    });
                }
            }
            segments.push(ranges);
        }

        Self { segments }
    }

    pub fn piece_count(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Ordered segment list for one piece.
    pub fn segments(&self, piece_index: u32) -> Result<&[Segment], EngineError> {
        self.segments
            .get(piece_index as usize)
            .map(Vec::as_slice)
            .ok_or(EngineError::InvalidPieceIndex(piece_index))
    }
}
