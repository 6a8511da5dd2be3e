use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index {0}")]
    InvalidPiece(u32),

    #[error("invalid block {block} for piece {piece}")]
    InvalidBlock { piece: u32, block: u32 },

    #[error("file path escapes the download directory: {0}")]
    PathTraversal(String),
}
