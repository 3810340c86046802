pub mod get_message_attempts;
pub mod list_failed_messages;
pub mod retry_message;
pub mod schedule_message;
