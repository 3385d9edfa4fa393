pub mod catalog_file;
pub mod error;
pub mod paths;
pub mod schema;
pub mod store;

pub use catalog_file::{load_catalog, parse_catalog};
pub use error::{CatalogFileError, Result, StoreError};
pub use paths::{catalog_path, database_path, default_base_dir, open_in_dir};
pub use store::Store;
