// src/resource/message.rs

//! Notifications exchanged between resources, processes and listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dependency::DependencyKey;
use crate::resource::{DependencyStatus, ResourceId, ResourceState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    StateChanged {
        resource: ResourceId,
        state: ResourceState,
    },
    EndOfJob {
        job: ResourceId,
        code: i32,
        timestamp: DateTime<Utc>,
    },
    DependencyChanged {
        dependency: DependencyKey,
        from: Option<DependencyStatus>,
        to: DependencyStatus,
    },
    ResourceAdded {
        resource: ResourceId,
    },
    ResourceRemoved {
        resource: ResourceId,
    },
}

impl Message {
    pub fn end_of_job(job: ResourceId, code: i32) -> Self {
        Message::EndOfJob {
            job,
            code,
            timestamp: Utc::now(),
        }
    }

    /// The resource the message is about.
    pub fn subject(&self) -> ResourceId {
        match self {
            Message::StateChanged { resource, .. }
            | Message::ResourceAdded { resource }
            | Message::ResourceRemoved { resource } => *resource,
            Message::EndOfJob { job, .. } => *job,
            Message::DependencyChanged { dependency, .. } => dependency.to,
        }
    }
}

/// Channel used by process monitors to report back to the scheduler.
pub type MessageSender = mpsc::UnboundedSender<Message>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_messages_are_about_the_consumer() {
        let message = Message::DependencyChanged {
            dependency: DependencyKey::new(ResourceId(1), ResourceId(2)),
            from: None,
            to: DependencyStatus::Wait,
        };
        assert_eq!(message.subject(), ResourceId(2));
        assert_eq!(Message::end_of_job(ResourceId(7), 0).subject(), ResourceId(7));
    }
}
