pub mod bluetooth;
pub mod gamepad;
pub mod logging;
