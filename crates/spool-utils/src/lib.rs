mod assert;
mod thread;

pub use thread::{ThreadPriority, spawn_stage, thread_boot};
