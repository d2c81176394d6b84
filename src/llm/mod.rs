pub mod gateway;
pub mod prompt;
pub mod providers;
pub mod types;
