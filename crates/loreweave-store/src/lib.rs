pub mod db;
pub mod error;
pub mod hotcache;
pub mod rules;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use hotcache::HotCache;
pub use rules::RulesStore;
pub use store::ChatStore;
pub use types::{ContextMessage, MemoryLevel, MemoryNode, MessageRecord, SessionRow};
