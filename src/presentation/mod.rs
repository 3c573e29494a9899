pub mod app;
pub mod components;
pub mod messages;
pub mod screens;
pub mod theme;
