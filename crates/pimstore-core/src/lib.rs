pub mod config;
pub mod error;
pub mod events;
pub mod paths;
pub mod types;

pub use config::{DbEngine, DriverSettings, GeneralConfig, ServerConfig};
pub use error::{PimError, Result};
pub use events::{ChangeNotification, CollectionScope};
pub use paths::StoragePaths;
pub use types::*;
