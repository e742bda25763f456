use std::path::PathBuf;

/// Internal watch event types after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared in the watched directory (created or moved in).
    Created(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Created(path) => path,
        }
    }
}
