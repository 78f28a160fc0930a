//! Domain convenience wrappers: thin builders over `queue_task` that fix the
//! task type, defaults and payload shape. No logic of their own.

use serde_json::json;

use meridian_core::{CorrelationId, TaskId, UserId};

use super::queue::{TaskQueue, TaskQueueError};
use super::types::{Priority, RetryConfig, TaskDefinition};

impl TaskQueue {
    /// Extract and index an uploaded file.
    pub fn queue_file_processing(
        &self,
        file_id: &str,
        path: &str,
        user_id: Option<UserId>,
    ) -> Result<TaskId, TaskQueueError> {
        let mut task = TaskDefinition::new(
            "file.process",
            json!({"file_id": file_id, "path": path}),
        );
        if let Some(user) = user_id {
            task = task.for_user(user);
        }
        self.queue_task(task)
    }

    /// Generate an embedding vector for a piece of source content.
    pub fn queue_embedding_generation(
        &self,
        source_id: &str,
        content: &str,
    ) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new(
                "embedding.generate",
                json!({"source_id": source_id, "content": content}),
            )
            .with_priority(Priority::Low),
        )
    }

    /// Generate a piece of content (article, summary, …) on a topic.
    pub fn queue_content_generation(
        &self,
        topic: &str,
        format: &str,
        user_id: Option<UserId>,
    ) -> Result<TaskId, TaskQueueError> {
        let mut task = TaskDefinition::new(
            "content.generate",
            json!({"topic": topic, "format": format}),
        );
        if let Some(user) = user_id {
            task = task.for_user(user);
        }
        self.queue_task(task)
    }

    /// Run an AI consultation. Correlated so the caller can wait for the
    /// matching `ai.consultation.completed` event.
    pub fn queue_consultation(
        &self,
        consultation_id: &str,
        question: &str,
        user_id: UserId,
        correlation_id: CorrelationId,
    ) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new(
                "consultation.run",
                json!({"consultation_id": consultation_id, "question": question}),
            )
            .with_priority(Priority::High)
            .for_user(user_id)
            .correlated(correlation_id),
        )
    }

    /// Collect current market data for a set of symbols. Provider hiccups
    /// are transient, so this retries more than most task types.
    pub fn queue_market_data_collection(&self, symbols: &[&str]) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new("market.collect", json!({"symbols": symbols}))
                .with_priority(Priority::High)
                .with_max_retries(5)
                .with_retry(RetryConfig::exponential(5, 1_000, 30_000)),
        )
    }

    /// Dispatch an outbound notification.
    pub fn queue_notification(
        &self,
        channel: &str,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new(
                "notification.send",
                json!({
                    "channel": channel,
                    "recipient": recipient,
                    "subject": subject,
                    "body": body,
                }),
            )
            .with_priority(Priority::Critical),
        )
    }

    /// Assemble a user's daily briefing.
    pub fn queue_briefing_generation(
        &self,
        user_id: UserId,
        briefing_date: &str,
    ) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new("briefing.generate", json!({"briefing_date": briefing_date}))
                .with_priority(Priority::High)
                .for_user(user_id),
        )
    }

    /// Run a named maintenance job. Best-effort: no retries.
    pub fn queue_maintenance(&self, job: &str) -> Result<TaskId, TaskQueueError> {
        self.queue_task(
            TaskDefinition::new("maintenance.run", json!({"job": job}))
                .with_priority(Priority::Low)
                .with_max_retries(0),
        )
    }
}
