pub mod dashboard;
pub mod picker;
