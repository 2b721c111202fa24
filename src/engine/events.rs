// Notification channel for action run status changes
// Best-effort broadcast; the stored ActionRun stays authoritative

//! # Notification Channel
//!
//! Every action run status transition is published here. Subscribers (the
//! SSE endpoint, tests) receive a stream of [`ActionRunNotification`]s and
//! narrow it with a [`NotificationFilter`].
//!
//! Built on `tokio::sync::broadcast`: publishing never blocks and never
//! fails. With no subscribers the notification is dropped, and a lagging
//! subscriber skips what it missed. Neither affects run correctness since
//! clients can always re-read the run from storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{
    ActionInstanceId, ActionRun, ActionRunId, ActionRunStatus, AutomationId, CommunityId, PubId,
};

/// One status transition of one action run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunNotification {
    pub action_run_id: ActionRunId,
    pub action_instance_id: ActionInstanceId,
    pub automation_id: Option<AutomationId>,
    pub community_id: CommunityId,
    pub pub_id: Option<PubId>,
    pub status: ActionRunStatus,
    pub timestamp: DateTime<Utc>,
}

impl ActionRunNotification {
    pub fn from_run(run: &ActionRun) -> Self {
        Self {
            action_run_id: run.id,
            action_instance_id: run.action_instance_id,
            automation_id: run.automation_id,
            community_id: run.community_id.clone(),
            pub_id: run.pub_id,
            status: run.status,
            timestamp: run.updated_at,
        }
    }
}

/// Subscriber-side narrowing: one community, optionally one instance or run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFilter {
    pub community_id: CommunityId,
    pub action_instance_id: Option<ActionInstanceId>,
    pub action_run_id: Option<ActionRunId>,
}

impl NotificationFilter {
    pub fn community(community_id: impl Into<CommunityId>) -> Self {
        Self {
            community_id: community_id.into(),
            action_instance_id: None,
            action_run_id: None,
        }
    }

    pub fn with_action_instance(mut self, id: Option<ActionInstanceId>) -> Self {
        self.action_instance_id = id;
        self
    }

    pub fn with_action_run(mut self, id: Option<ActionRunId>) -> Self {
        self.action_run_id = id;
        self
    }

    pub fn matches(&self, notification: &ActionRunNotification) -> bool {
        notification.community_id == self.community_id
            && self
                .action_instance_id
                .map_or(true, |id| id == notification.action_instance_id)
            && self
                .action_run_id
                .map_or(true, |id| id == notification.action_run_id)
    }
}

#[derive(Clone)]
pub struct NotificationChannel {
    sender: broadcast::Sender<ActionRunNotification>,
}

impl NotificationChannel {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publish the run's current status, fire-and-forget
    pub fn publish(&self, run: &ActionRun) {
        let notification = ActionRunNotification::from_run(run);
        // Err only means nobody is listening
        let delivered = self.sender.send(notification).unwrap_or(0);
        trace!(
            action_run_id = %run.id,
            status = %run.status,
            subscribers = delivered,
            "published action run notification"
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionRunNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionInstance, AutomationEvent};
    use serde_json::json;

    fn run(community: &str) -> ActionRun {
        let instance = ActionInstance::new("Log", "log", "review", community, json!({}));
        ActionRun::running(&instance, Some(PubId::new()), AutomationEvent::PubEnteredStage, vec![])
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let channel = NotificationChannel::new(4);
        assert_eq!(channel.subscriber_count(), 0);
        channel.publish(&run("journal"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_status_transitions() {
        let channel = NotificationChannel::new(16);
        let mut rx = channel.subscribe();

        let mut run = run("journal");
        channel.publish(&run);
        run.succeed(json!({}));
        channel.publish(&run);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.status, ActionRunStatus::Running);
        assert_eq!(second.status, ActionRunStatus::Success);
        assert_eq!(second.action_run_id, run.id);
    }

    #[test]
    fn test_slow_subscriber_lags_instead_of_blocking() {
        let channel = NotificationChannel::new(2);
        let mut rx = channel.subscribe();

        for _ in 0..3 {
            channel.publish(&run("journal"));
        }

        tokio_test::assert_err!(rx.try_recv());
        tokio_test::assert_ok!(rx.try_recv());
        tokio_test::assert_ok!(rx.try_recv());
        tokio_test::assert_err!(rx.try_recv());
    }

    #[test]
    fn test_filter_by_community_and_run() {
        let journal = ActionRunNotification::from_run(&run("journal"));
        let other = ActionRunNotification::from_run(&run("other"));

        let by_community = NotificationFilter::community("journal");
        assert!(by_community.matches(&journal));
        assert!(!by_community.matches(&other));

        let by_run = NotificationFilter::community("journal")
            .with_action_run(Some(ActionRunId::new()));
        assert!(!by_run.matches(&journal));

        let by_instance = NotificationFilter::community("journal")
            .with_action_instance(Some(journal.action_instance_id));
        assert!(by_instance.matches(&journal));
    }
}
