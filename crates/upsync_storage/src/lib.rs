pub mod memory;
pub mod repository;
pub mod store;

pub use memory::InMemoryUploadStore;
pub use repository::{
    BatchRunRecord, BatchRunStatus, NewUpload, StorageConfig, UploadRow, UpsyncStorage,
};
pub use store::{StoreError, UploadStore};
