use std::io;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("out of data blocks")]
    OutOfBlocks,
    #[error("out of inode numbers")]
    NoInums,
    #[error("path component too long")]
    NameTooLong,
    #[error("non-directory component in path")]
    NotADirectory,
    #[error("entry not found")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("offset out of range")]
    BadOffset,
    #[error("empty or malformed path")]
    InvalidPath,
    #[error("operation not supported for this inode type")]
    WrongType,
    #[error("block device: {0}")]
    Io(#[from] io::Error),
}
