pub mod adapter;
pub mod delivery;
pub mod error;
pub mod followups;
pub mod handler;
pub mod send;

pub use adapter::DiscordAdapter;
pub use error::DiscordError;
