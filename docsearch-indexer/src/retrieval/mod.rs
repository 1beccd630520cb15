pub mod change_tracker;
pub mod directory_watcher;
pub mod file_index;
pub mod indexing_engine;
pub mod parser;
pub mod task_queue;
