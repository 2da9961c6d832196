use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Boot resource unavailable: {0}")]
    BootResource(String),

    #[error("{0}")]
    Other(String),
}
