pub mod log;
pub mod relay;

pub use log::LogSender;
pub use relay::HttpRelaySender;
