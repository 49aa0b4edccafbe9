pub mod config;
pub mod deck;
pub mod extract;
pub mod prompt;
pub mod render;
pub mod sync;
