use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Algorithm not found: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to allocate {bytes} bytes for {site}")]
    Allocation { site: &'static str, bytes: usize },

    #[error("Failed to spawn join thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
}
