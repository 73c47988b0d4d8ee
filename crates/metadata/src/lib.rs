pub mod error;
pub mod memory;
pub mod seed;
pub mod store;

pub use error::MetadataError;
pub use memory::MemoryMetadataStore;
pub use seed::MetadataSeed;
pub use store::MetadataStore;
