pub mod attempt;
pub mod job;
pub mod message;
pub mod recurrence;
pub mod user;

pub use attempt::{AttemptOutcome, DeliveryAttempt};
pub use job::{DeliveryJob, JobState, NewJob};
pub use message::{DeliveryChannel, Message, MessageDraft, MessageParts, MessageStatus};
pub use recurrence::RecurrencePattern;
pub use user::User;
