use crate::metainfo::FileEntry;

/// A byte range within one file of the torrent layout.
#[derive(Debug, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps a logical byte range of the concatenated torrent data onto the file
/// list. The range may cross file boundaries, producing one span per file
/// touched, in layout order.
pub fn spans_for(files: &[FileEntry], start: u64, length: u64) -> Vec<FileSpan> {
    let end = start + length;
    let mut spans = Vec::new();

    for (file_index, file) in files.iter().enumerate() {
        let file_end = file.offset + file.length;

        if end <= file.offset || start >= file_end {
            continue;
        }

        let span_start = start.max(file.offset);
        let span_end = end.min(file_end);

        spans.push(FileSpan {
            file_index,
            file_offset: span_start - file.offset,
            length: span_end - span_start,
        });
    }

    spans
}
