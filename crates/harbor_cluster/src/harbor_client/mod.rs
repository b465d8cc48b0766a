pub mod client;
pub mod types;

pub use client::HarborClient;
pub use types::*;
