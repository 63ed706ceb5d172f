//! Tiered retry routing.
//!
//! A failed record climbs `{main}.retry-1 ..= {main}.retry-N`, one stage per
//! failure, and lands on `{main}.dlt` once the chain is exhausted. Each hop
//! rewrites the retry headers; the envelope itself is never touched.
//!
//! Recovery headers on the inbound record are carried forward on every hop, so
//! the recovery loop's attempt counter survives a record failing again.

use chrono::Utc;
use tracing::{info, warn};

use taxflow_events::{headers, Headers, MessageBroker, PersonEnvelope, ProducerRecord};

use crate::config::MessagingConfig;
use crate::retry::policy::BackoffPolicy;

/// Longest error text copied into a header.
const MAX_HEADER_ERROR_LEN: usize = 1024;

/// Headers that survive a hop.
const CARRIED: [&str; 2] = [headers::RECOVERY_ATTEMPT, headers::RECOVERY_TIMESTAMP];

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },
}

/// Where a record went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published to a retry stage.
    Retried { stage: u32, topic: String },
    /// Published to the dead-letter topic.
    DeadLettered { retry_count: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryRouter<B> {
    broker: B,
    main_topic: String,
    dlt_topic: String,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl<B> RetryRouter<B>
where
    B: MessageBroker<PersonEnvelope>,
{
    pub fn new(broker: B, config: &MessagingConfig) -> Self {
        Self {
            broker,
            main_topic: config.main_topic.clone(),
            dlt_topic: config.dlt_topic(),
            max_retries: config.retry.max_retries,
            backoff: config.retry.backoff.clone(),
        }
    }

    pub fn stage_topic(&self, stage: u32) -> String {
        format!("{}.retry-{stage}", self.main_topic)
    }

    /// Escalate a failed record one stage, or dead-letter it when the chain is
    /// exhausted (`retry-count` then carries `max_retries + 1`).
    pub fn route_to_next_stage(
        &self,
        envelope: &PersonEnvelope,
        key: &str,
        current_attempt: u32,
        error: &str,
        inbound: &Headers,
    ) -> Result<RouteOutcome, RouterError> {
        let next = current_attempt.saturating_add(1);

        if next > self.max_retries {
            warn!(
                key = %key,
                event_id = %envelope.event_id(),
                retry_count = next,
                "retry chain exhausted; sending to dead-letter topic"
            );
            self.publish_dlt(envelope, key, "max-retries-exceeded", error, inbound, Some(next))?;
            return Ok(RouteOutcome::DeadLettered { retry_count: next });
        }

        let topic = self.stage_topic(next);
        let delay = self.backoff.delay_for_stage(next);
        let not_before = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let meta = carried(inbound)
            .with(headers::RETRY_COUNT, next)
            .with(headers::ERROR_MESSAGE, truncate(error))
            .with(headers::RETRY_DELAY_MS, delay.as_millis())
            .with(headers::RETRY_NOT_BEFORE, not_before)
            .with(headers::ORIGINAL_TOPIC, &self.main_topic);

        self.publish(&topic, key, envelope, meta)?;

        info!(
            key = %key,
            event_id = %envelope.event_id(),
            topic = %topic,
            retry_count = next,
            delay_ms = delay.as_millis() as u64,
            "routed to retry stage"
        );
        Ok(RouteOutcome::Retried { stage: next, topic })
    }

    /// Unconditional escalation to the dead-letter topic.
    pub fn send_to_dlt(
        &self,
        envelope: &PersonEnvelope,
        key: &str,
        reason: &str,
        error: &str,
        inbound: &Headers,
    ) -> Result<RouteOutcome, RouterError> {
        self.publish_dlt(envelope, key, reason, error, inbound, None)?;
        Ok(RouteOutcome::DeadLettered { retry_count: 0 })
    }

    fn publish_dlt(
        &self,
        envelope: &PersonEnvelope,
        key: &str,
        reason: &str,
        error: &str,
        inbound: &Headers,
        retry_count: Option<u32>,
    ) -> Result<(), RouterError> {
        let mut meta = carried(inbound)
            .with(headers::FINAL_ERROR, truncate(error))
            .with(headers::DLT_REASON, reason)
            .with(headers::ORIGINAL_TOPIC, &self.main_topic);
        if let Some(count) = retry_count {
            meta.set(headers::RETRY_COUNT, count);
        }

        self.publish(&self.dlt_topic, key, envelope, meta)?;

        warn!(
            key = %key,
            event_id = %envelope.event_id(),
            event_type = %envelope.event_type(),
            reason = %reason,
            error = %error,
            "sent to dead-letter topic"
        );
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: &PersonEnvelope,
        headers: Headers,
    ) -> Result<(), RouterError> {
        let record = ProducerRecord::new(topic, key, envelope.clone()).with_headers(headers);
        self.broker.send(record).map_err(|e| RouterError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })
    }
}

fn carried(inbound: &Headers) -> Headers {
    let mut out = Headers::new();
    for name in CARRIED {
        if let Some(value) = inbound.last(name) {
            out.set(name, value);
        }
    }
    out
}

fn truncate(error: &str) -> &str {
    if error.len() <= MAX_HEADER_ERROR_LEN {
        return error;
    }
    let mut end = MAX_HEADER_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}
