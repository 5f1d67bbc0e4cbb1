pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;

pub use backends::{FileStateStore, FileStateStoreBuilder, MemoryStateStore, TestStateStore};
pub use config::{MemoryConfig, StoreConfig, StoreHandles};
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use r#trait::{DeliveryStateStore, OtpStore, TimeRange};
