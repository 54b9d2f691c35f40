pub mod camera;
pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod stream;
pub mod teleop;
