use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::recurrence::{RecurrencePattern, resolve_timezone};
use crate::domain::errors::{DomainError, DomainResult};

/// Upper bound for the reminder lead time: 30 days.
pub const MAX_REMINDER_MINUTES: u32 = 43_200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    Delivered,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(MessageStatus::Scheduled),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            "cancelled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Cancelled)
    }

    /// The legal-transition table. Staying in the same state is not a transition.
    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, to),
            (Scheduled, Delivered)
                | (Scheduled, Failed)
                | (Scheduled, Cancelled)
                | (Failed, Scheduled)
                | (Failed, Cancelled)
        )
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, MessageStatus::Scheduled)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Email,
    Push,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Email => "email",
            DeliveryChannel::Push => "push",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "email" => Some(DeliveryChannel::Email),
            "push" => Some(DeliveryChannel::Push),
            _ => None,
        }
    }
}

/// Input for [`Message::new`].
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub deliver_at: DateTime<Utc>,
    pub timezone: String,
    pub channel: DeliveryChannel,
    pub recurrence: RecurrencePattern,
    pub reminder_minutes: Option<u32>,
}

/// Every stored field of a message, used to rehydrate it from storage.
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub deliver_at: DateTime<Utc>,
    pub timezone: String,
    pub status: MessageStatus,
    pub channel: DeliveryChannel,
    pub recurrence: RecurrencePattern,
    pub reminder_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A user-authored message awaiting delivery.
///
/// Values are immutable: every mutation consumes the message and returns a
/// new one with the same id. Only a repository persists the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    user_id: Uuid,
    title: String,
    body: String,
    deliver_at: DateTime<Utc>,
    timezone: String,
    status: MessageStatus,
    channel: DeliveryChannel,
    recurrence: RecurrencePattern,
    reminder_minutes: Option<u32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(draft: MessageDraft, now: DateTime<Utc>) -> DomainResult<Self> {
        if draft.title.trim().is_empty() {
            return Err(DomainError::Validation("title must not be empty".into()));
        }
        if draft.deliver_at <= now {
            return Err(DomainError::Validation(
                "delivery time must be in the future".into(),
            ));
        }
        resolve_timezone(&draft.timezone)?;
        if let Some(minutes) = draft.reminder_minutes {
            if minutes > MAX_REMINDER_MINUTES {
                return Err(DomainError::Validation(format!(
                    "reminder lead time must be at most {MAX_REMINDER_MINUTES} minutes"
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            title: draft.title,
            body: draft.body,
            deliver_at: draft.deliver_at,
            timezone: draft.timezone,
            status: MessageStatus::Scheduled,
            channel: draft.channel,
            recurrence: draft.recurrence,
            reminder_minutes: draft.reminder_minutes,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        })
    }

    pub fn restore(parts: MessageParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            title: parts.title,
            body: parts.body,
            deliver_at: parts.deliver_at,
            timezone: parts.timezone,
            status: parts.status,
            channel: parts.channel,
            recurrence: parts.recurrence,
            reminder_minutes: parts.reminder_minutes,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            delivered_at: parts.delivered_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn deliver_at(&self) -> DateTime<Utc> {
        self.deliver_at
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    pub fn recurrence(&self) -> RecurrencePattern {
        self.recurrence
    }

    pub fn reminder_minutes(&self) -> Option<u32> {
        self.reminder_minutes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence != RecurrencePattern::None
    }

    /// When the reminder should fire, if one was requested.
    pub fn reminder_at(&self) -> Option<DateTime<Utc>> {
        self.reminder_minutes
            .map(|minutes| self.deliver_at - chrono::Duration::minutes(i64::from(minutes)))
    }

    pub fn transition(self, to: MessageStatus, now: DateTime<Utc>) -> DomainResult<Self> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let delivered_at = match to {
            MessageStatus::Delivered => Some(now),
            _ => self.delivered_at,
        };
        Ok(Self {
            status: to,
            updated_at: now,
            delivered_at,
            ..self
        })
    }

    pub fn mark_delivered(self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.transition(MessageStatus::Delivered, now)
    }

    pub fn mark_failed(self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.transition(MessageStatus::Failed, now)
    }

    pub fn cancel(self, now: DateTime<Utc>) -> DomainResult<Self> {
        self.transition(MessageStatus::Cancelled, now)
    }

    /// Sets the delivery time and leaves the message `scheduled`.
    ///
    /// A scheduled message only moves its time; a failed one transitions back
    /// to scheduled; terminal messages are rejected.
    pub fn schedule_at(self, deliver_at: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<Self> {
        let message = match self.status {
            MessageStatus::Scheduled => self,
            _ => self.transition(MessageStatus::Scheduled, now)?,
        };
        Ok(Self {
            deliver_at,
            updated_at: now,
            ..message
        })
    }

    pub fn edit(
        self,
        title: String,
        body: String,
        deliver_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if !self.status.can_edit() {
            return Err(DomainError::Validation(format!(
                "message in status {} cannot be edited",
                self.status
            )));
        }
        if title.trim().is_empty() {
            return Err(DomainError::Validation("title must not be empty".into()));
        }
        if deliver_at <= now {
            return Err(DomainError::Validation(
                "delivery time must be in the future".into(),
            ));
        }
        Ok(Self {
            title,
            body,
            deliver_at,
            updated_at: now,
            ..self
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    pub(crate) fn draft(user_id: Uuid, deliver_at: DateTime<Utc>) -> MessageDraft {
        MessageDraft {
            user_id,
            title: "Happy birthday".to_string(),
            body: "Hope the year treats you well.".to_string(),
            deliver_at,
            timezone: "Europe/Berlin".to_string(),
            channel: DeliveryChannel::Email,
            recurrence: RecurrencePattern::None,
            reminder_minutes: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn scheduled() -> Message {
        Message::new(draft(Uuid::new_v4(), now() + Duration::hours(1)), now()).unwrap()
    }

    #[test]
    fn new_message_starts_scheduled() {
        let message = scheduled();
        assert_eq!(message.status(), MessageStatus::Scheduled);
        assert_eq!(message.delivered_at(), None);
        assert_eq!(message.created_at(), now());
    }

    #[test]
    fn rejects_past_delivery_time() {
        let err = Message::new(draft(Uuid::new_v4(), now()), now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut input = draft(Uuid::new_v4(), now() + Duration::hours(1));
        input.timezone = "Atlantis/Capital".to_string();
        let err = Message::new(input, now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTimezone(tz) if tz == "Atlantis/Capital"));
    }

    #[test]
    fn reminder_lead_time_is_bounded() {
        let mut input = draft(Uuid::new_v4(), now() + Duration::days(40));
        input.reminder_minutes = Some(MAX_REMINDER_MINUTES);
        let message = Message::new(input.clone(), now()).unwrap();
        assert_eq!(
            message.reminder_at(),
            Some(now() + Duration::days(40) - Duration::days(30))
        );

        input.reminder_minutes = Some(MAX_REMINDER_MINUTES + 1);
        assert!(Message::new(input, now()).is_err());
    }

    #[test]
    fn delivering_stamps_timestamp_once() {
        let delivered = scheduled().mark_delivered(now()).unwrap();
        assert_eq!(delivered.status(), MessageStatus::Delivered);
        assert_eq!(delivered.delivered_at(), Some(now()));
    }

    #[test]
    fn delivered_is_terminal() {
        let delivered = scheduled().mark_delivered(now()).unwrap();
        for to in [
            MessageStatus::Scheduled,
            MessageStatus::Failed,
            MessageStatus::Cancelled,
            MessageStatus::Delivered,
        ] {
            let err = delivered.clone().transition(to, now()).unwrap_err();
            assert!(matches!(
                err,
                DomainError::InvalidTransition { from: MessageStatus::Delivered, to: t } if t == to
            ));
        }
        assert!(delivered.schedule_at(now(), now()).is_err());
    }

    #[test]
    fn failed_can_be_rescheduled_or_cancelled() {
        let failed = scheduled().mark_failed(now()).unwrap();
        let retried = failed
            .clone()
            .schedule_at(now() + Duration::minutes(5), now())
            .unwrap();
        assert_eq!(retried.status(), MessageStatus::Scheduled);
        assert_eq!(retried.deliver_at(), now() + Duration::minutes(5));

        let cancelled = failed.cancel(now()).unwrap();
        assert_eq!(cancelled.status(), MessageStatus::Cancelled);
        assert!(cancelled.mark_failed(now()).is_err());
    }

    #[test]
    fn failed_cannot_be_delivered_directly() {
        let failed = scheduled().mark_failed(now()).unwrap();
        assert!(failed.mark_delivered(now()).is_err());
    }

    #[test]
    fn schedule_at_keeps_identity() {
        let message = scheduled();
        let id = message.id();
        let moved = message.schedule_at(now() + Duration::days(2), now()).unwrap();
        assert_eq!(moved.id(), id);
        assert_eq!(moved.status(), MessageStatus::Scheduled);
    }

    #[test]
    fn edit_only_while_scheduled() {
        let edited = scheduled()
            .edit(
                "New title".into(),
                "New body".into(),
                now() + Duration::hours(3),
                now(),
            )
            .unwrap();
        assert_eq!(edited.title(), "New title");

        let failed = edited.mark_failed(now()).unwrap();
        assert!(failed.status().can_delete());
        assert!(
            failed
                .edit("x".into(), "y".into(), now() + Duration::hours(3), now())
                .is_err()
        );
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            MessageStatus::Scheduled,
            MessageStatus::Delivered,
            MessageStatus::Failed,
            MessageStatus::Cancelled,
        ] {
            assert_eq!(MessageStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::from_str("sent"), None);
    }
}
