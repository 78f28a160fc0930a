//! Integration tests for the full streaming pipeline.
//!
//! Tests: publish → stream log → consume loop → handler, and the
//! request/response pattern: a correlated consultation task executed by the
//! task queue, answered through `wait_for_event`.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use meridian_core::{CorrelationId, UserId};
    use meridian_events::{Envelope, Stream};

    use crate::config::{BusConfig, TaskQueueConfig};
    use crate::event_bus::{
        EventBus, HandlerVerdict, InMemoryLog, PublishOptions, SubscribeOptions,
    };
    use crate::tasks::TaskQueue;

    fn connected_bus() -> Arc<EventBus> {
        meridian_observability::init();
        let bus = EventBus::new(
            Arc::new(InMemoryLog::new()),
            BusConfig {
                default_block_ms: 20,
                error_pause_ms: 10,
                ..BusConfig::default()
            },
        );
        bus.connect().expect("connect");
        Arc::new(bus)
    }

    #[test]
    fn published_events_reach_group_subscribers_in_order() {
        let bus = connected_bus();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(
            Stream::User,
            &["user.registered"],
            move |envelope| {
                let email = envelope.data()["email"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                sink.lock().unwrap().push(email);
                HandlerVerdict::Handled
            },
            SubscribeOptions::group("mailer"),
        )
        .expect("subscribe");

        for i in 0..5 {
            bus.publish(
                Envelope::new(
                    Stream::User,
                    "user.registered",
                    1,
                    json!({"email": format!("user{i}@example.com")}),
                ),
                PublishOptions::default(),
            )
            .expect("publish");
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && seen.lock().unwrap().len() < 5 {
            thread::sleep(Duration::from_millis(10));
        }

        let emails = seen.lock().unwrap().clone();
        assert_eq!(
            emails,
            (0..5)
                .map(|i| format!("user{i}@example.com"))
                .collect::<Vec<_>>()
        );

        bus.disconnect();
    }

    #[test]
    fn consultation_round_trip_through_task_queue_and_correlation_wait() {
        let bus = connected_bus();

        let queue = TaskQueue::new(
            Arc::clone(&bus),
            TaskQueueConfig {
                max_concurrent: 2,
                backpressure_delay: Duration::from_millis(20),
                health_interval: Duration::from_secs(3600),
                consumer_name: "consultant".to_string(),
            },
        );

        // The consultation worker answers by publishing the completion event
        // carrying the task's correlation id.
        let responder = Arc::clone(&bus);
        queue.register_handler("consultation.run", move |task| {
            let consultation_id = task.payload["consultation_id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let mut reply = Envelope::new(
                Stream::Ai,
                "ai.consultation.completed",
                1,
                json!({"consultation_id": consultation_id, "answer": "hold"}),
            );
            if let Some(correlation) = task.correlation_id {
                reply = reply.correlated(correlation);
            }
            responder
                .publish(reply, PublishOptions::default())
                .map_err(|e| e.to_string())?;
            Ok(json!({"answered": true}))
        });
        queue.start().expect("start");

        let correlation = CorrelationId::new();

        // Start waiting before the task is queued so the ephemeral group is
        // in place when the reply lands.
        let waiter_bus = Arc::clone(&bus);
        let waiter = thread::spawn(move || {
            waiter_bus.wait_for_event(
                Stream::Ai,
                "ai.consultation.completed",
                correlation,
                Duration::from_secs(5),
            )
        });
        thread::sleep(Duration::from_millis(100));

        queue
            .queue_consultation("c-17", "should I rebalance?", UserId::new(), correlation)
            .expect("queue consultation");

        let reply = waiter.join().unwrap().expect("consultation reply");
        assert_eq!(reply.correlation_id(), Some(correlation));
        assert_eq!(reply.data()["consultation_id"], json!("c-17"));

        queue.stop();
        bus.disconnect();
    }
}
