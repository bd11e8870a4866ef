//! Local model files: discovery, hashing, the per-file pipeline and organization

pub mod discovery;
pub mod hash;
pub mod organizer;
pub mod processor;

pub use discovery::{find_model_files, metadata_path, preview_path, without_metadata};
pub use hash::{HashAlgorithm, compute_file_hash};
pub use organizer::{FileOrganizer, OrganizeOptions};
pub use processor::{ModelProcessor, ProcessorOptions};
