pub mod collector;
pub mod config;
pub mod db;
pub mod retention;
pub mod sensor;
pub mod session;
pub mod supervisor;
