pub mod api;
pub mod apply;
pub mod controllers;
pub mod harbor_client;
pub mod images;
pub mod render;
pub mod util;
mod tests;
