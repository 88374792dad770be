pub mod db;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use store::SessionStore;
