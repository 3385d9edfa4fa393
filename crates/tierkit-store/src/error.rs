use std::fmt;
use std::path::PathBuf;

use tierkit_core::CatalogError;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    NotFound(String),
    InvalidData(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::NotFound(account) => write!(f, "no subscription for account '{account}'"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug)]
pub enum CatalogFileError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    Invalid(CatalogError),
}

impl fmt::Display for CatalogFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogFileError::Io { path, source } => {
                write!(f, "failed to read catalog {}: {source}", path.display())
            }
            CatalogFileError::Parse(e) => write!(f, "malformed catalog: {e}"),
            CatalogFileError::Invalid(e) => write!(f, "invalid catalog: {e}"),
        }
    }
}

impl std::error::Error for CatalogFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CatalogFileError::Io { source, .. } => Some(source),
            CatalogFileError::Parse(e) => Some(e),
            CatalogFileError::Invalid(e) => Some(e),
        }
    }
}

impl From<toml::de::Error> for CatalogFileError {
    fn from(e: toml::de::Error) -> Self {
        CatalogFileError::Parse(e)
    }
}

impl From<CatalogError> for CatalogFileError {
    fn from(e: CatalogError) -> Self {
        CatalogFileError::Invalid(e)
    }
}
