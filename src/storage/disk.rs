//! Raw disk I/O for the page file.

pub mod file_manager;

pub use file_manager::FileManager;
