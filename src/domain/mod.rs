pub mod input;
pub mod models;
pub mod settings;
