pub mod blob;
pub mod compression;
pub mod convert;
pub mod error;
pub mod extract;
pub mod layout;
pub mod legacy;
pub mod manifest;
pub mod notifier;
pub mod translate;

// Re-exports for easy access
pub use blob::{Blob, BlobStore};
pub use compression::Compression;
pub use convert::{ConvertOptions, Converter};
pub use error::ConvertError;
pub use extract::{ExtractStats, Extractor, UnknownEntryPolicy};
pub use layout::{verify_layout, LayoutWriter};
pub use manifest::ManifestEntry;
pub use notifier::Notifier;
