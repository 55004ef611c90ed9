//! Storage module
//!
//! Blob providers and the streams they hand out.

pub mod builtin;
pub mod local;
pub mod provider;
pub mod read_stream;
pub mod selector;

pub use builtin::{BuiltInBlobProvider, BUILT_IN_PROVIDER_NAME};
pub use local::{LocalBlobData, LocalBlobProvider, LOCAL_PROVIDER_NAME};
pub use provider::{
    BlobProvider, BlobReadStream, BlobStorageContext, BlobWriteStream, ProviderData, ProviderHandle,
};
pub use read_stream::{BinaryReadStream, FragmentReader};
pub use selector::BlobProviderSelector;
