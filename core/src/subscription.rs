//! Consumer-side configuration for one channel.

use crate::message::RoutingKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which pump drives a subscription's performers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePumpType {
    /// Blocking pump on a dedicated thread.
    #[default]
    Reactor,
    /// Suspending pump on the async runtime.
    Proactor,
}

/// What a channel factory does when the broker channel does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissingChannel {
    /// Create the channel.
    #[default]
    Create,
    /// Fail if the channel is missing.
    Validate,
    /// Assume the channel exists.
    Assume,
}

/// Subscription to a channel.
///
/// `requeue_count` of `-1` means unlimited requeues. An
/// `unacceptable_message_limit` of `0` disables quarantine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Unique subscription name.
    pub name: String,
    /// Broker channel (queue) name.
    pub channel_name: String,
    /// Topic the channel is bound to.
    pub routing_key: RoutingKey,
    /// Number of parallel performers.
    pub no_of_performers: usize,
    /// Maximum messages fetched per receive.
    pub buffer_size: usize,
    /// How long one receive waits for messages.
    pub timeout: Duration,
    /// Maximum requeues per message, `-1` for unlimited.
    pub requeue_count: i32,
    /// Delay applied when requeueing.
    pub requeue_delay: Duration,
    /// Consecutive unacceptable messages before quarantine, `0` to disable.
    pub unacceptable_message_limit: u32,
    /// Back-off after an empty read.
    pub empty_channel_delay: Duration,
    /// Back-off after a channel failure.
    pub channel_failure_delay: Duration,
    /// Time budget for dispatching one message.
    ///
    /// The proactor abandons an overrunning dispatch and treats it as a
    /// recoverable handler failure. A reactor cannot interrupt a blocking
    /// handler: it logs the overrun and settles the message by the
    /// handler's own result.
    pub dispatch_timeout: Duration,
    /// Pump model.
    pub message_pump_type: MessagePumpType,
    /// Channel provisioning policy.
    pub make_channels: OnMissingChannel,
}

impl Subscription {
    /// Create a subscription with default tuning.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        channel_name: impl Into<String>,
        routing_key: impl Into<RoutingKey>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_name: channel_name.into(),
            routing_key: routing_key.into(),
            no_of_performers: 1,
            buffer_size: 1,
            timeout: Duration::from_millis(300),
            requeue_count: -1,
            requeue_delay: Duration::ZERO,
            unacceptable_message_limit: 0,
            empty_channel_delay: Duration::from_millis(500),
            channel_failure_delay: Duration::from_millis(1000),
            dispatch_timeout: Duration::from_secs(30),
            message_pump_type: MessagePumpType::Reactor,
            make_channels: OnMissingChannel::Create,
        }
    }

    /// Set the number of performers.
    #[must_use]
    pub const fn with_performers(mut self, performers: usize) -> Self {
        self.no_of_performers = performers;
        self
    }

    /// Set the receive batch size.
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the requeue bound (`-1` for unlimited).
    #[must_use]
    pub const fn with_requeue_count(mut self, count: i32) -> Self {
        self.requeue_count = count;
        self
    }

    /// Set the requeue delay.
    #[must_use]
    pub const fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Set the quarantine threshold (`0` disables).
    #[must_use]
    pub const fn with_unacceptable_message_limit(mut self, limit: u32) -> Self {
        self.unacceptable_message_limit = limit;
        self
    }

    /// Set the empty-read back-off.
    #[must_use]
    pub const fn with_empty_channel_delay(mut self, delay: Duration) -> Self {
        self.empty_channel_delay = delay;
        self
    }

    /// Set the channel-failure back-off.
    #[must_use]
    pub const fn with_channel_failure_delay(mut self, delay: Duration) -> Self {
        self.channel_failure_delay = delay;
        self
    }

    /// Set the per-message dispatch timeout.
    #[must_use]
    pub const fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the pump model.
    #[must_use]
    pub const fn with_pump(mut self, pump: MessagePumpType) -> Self {
        self.message_pump_type = pump;
        self
    }

    /// Set the provisioning policy.
    #[must_use]
    pub const fn with_make_channels(mut self, make_channels: OnMissingChannel) -> Self {
        self.make_channels = make_channels;
        self
    }

    /// Whether a message handled `handled_count` times has used up its requeues.
    #[must_use]
    pub const fn requeues_exhausted(&self, handled_count: u32) -> bool {
        if self.requeue_count < 0 {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let limit = self.requeue_count as u32;
        handled_count > limit
    }
}
