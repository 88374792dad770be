pub mod image;
pub mod openai;
pub mod pipeline;
pub mod provider;
pub mod search;
pub mod stream;
