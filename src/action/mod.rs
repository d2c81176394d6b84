pub mod coords;
pub mod decoder;
pub mod repair;
pub mod types;
