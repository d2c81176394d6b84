pub mod adb;
pub mod apps;
pub mod executor;
pub mod traits;
