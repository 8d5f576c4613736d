pub mod ports;
pub mod process_runner;
