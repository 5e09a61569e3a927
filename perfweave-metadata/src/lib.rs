pub mod collectors;
pub mod metadata_provider;
pub mod namespace;
pub mod process;
pub mod types;
pub mod version;
