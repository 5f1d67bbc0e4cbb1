use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileStateStore, MemoryStateStore},
    r#trait::{DeliveryStateStore, OtpStore},
};

/// Configuration for the state store
///
/// File-backed store in RON config:
/// ```ron
/// Courier (
///     store: (
///         type: "File",
///         path: "/var/lib/courier",
///     ),
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// Courier (
///     store: (
///         type: "Memory",
///         capacity: 1000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// File-based store (production)
    File(FileStateStore),
    /// Memory-based store (testing/development)
    Memory(MemoryConfig),
}

/// Configuration for the memory-backed store
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileStateStore::default())
    }
}

/// The two views of one backend the engine works with
#[derive(Debug, Clone)]
pub struct StoreHandles {
    pub messages: Arc<dyn DeliveryStateStore>,
    pub otps: Arc<dyn OtpStore>,
}

impl StoreHandles {
    /// Share a single backend between both views
    #[must_use]
    pub fn from_backend<S>(store: S) -> Self
    where
        S: DeliveryStateStore + OtpStore + Clone + 'static,
    {
        Self {
            messages: Arc::new(store.clone()),
            otps: Arc::new(store),
        }
    }
}

impl StoreConfig {
    /// Filesystem path for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Initialise the configured backend and hand out its views
    ///
    /// # Errors
    /// Returns an error if the file-backed store cannot be initialised
    pub fn into_stores(self) -> crate::Result<StoreHandles> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(StoreHandles::from_backend(store))
            }
            Self::Memory(config) => Ok(StoreHandles::from_backend(
                config
                    .capacity
                    .map_or_else(MemoryStateStore::new, MemoryStateStore::with_capacity),
            )),
        }
    }
}
