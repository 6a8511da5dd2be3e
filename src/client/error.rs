use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("metainfo error: {0}")]
    Metainfo(#[from] crate::metainfo::MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid resume record: {0}")]
    InvalidRecord(&'static str),

    #[error("session already stopped")]
    AlreadyStopped,
}
