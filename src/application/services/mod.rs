pub mod scheduler;
pub mod sender;
