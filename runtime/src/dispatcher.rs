//! The dispatcher: supervises the performers of every subscription.
//!
//! Each subscription gets `no_of_performers` performers, each with its own
//! channel. Reactor performers run on dedicated threads; proactor performers
//! run as tasks on the tokio runtime that calls [`Dispatcher::receive`].
//!
//! Lifecycle: `Awaiting → Running → Stopping → Stopped`. Stopping posts the
//! quit sentinel to every channel, so in-flight messages finish first.

use crate::error::{ConfigurationError, ExecutionMode};
use crate::health::{HealthCheck, HealthReport};
use crate::metrics::DispatcherMetrics;
use crate::processor::CommandProcessor;
use crate::pump::{Proactor, PumpOutcome, PumpSnapshot, PumpStatistics, Reactor};
use futures::future::join_all;
use herald_core::channel::{AsyncChannel, Channel, ChannelError, ChannelFactory};
use herald_core::mapper::MessageMapper;
use herald_core::request::Request;
use herald_core::subscription::{MessagePumpType, Subscription};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherState {
    /// Built, not started.
    Awaiting,
    /// Performers are running.
    Running,
    /// Performers were told to quit.
    Stopping,
    /// All performers have ended.
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Awaiting => f.write_str("awaiting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Errors raised by the dispatcher.
#[derive(Error, Debug)]
pub enum DispatcherError {
    /// A subscription's request type cannot be dispatched.
    #[error("subscription '{subscription}' cannot be dispatched: {source}")]
    Configuration {
        /// Subscription name.
        subscription: String,
        /// Why.
        #[source]
        source: ConfigurationError,
    },

    /// A mapper is missing for a subscription's request type.
    #[error("no mapper for subscription '{subscription}': {source}")]
    MissingMapper {
        /// Subscription name.
        subscription: String,
        /// Why.
        #[source]
        source: ConfigurationError,
    },

    /// A channel could not be created.
    #[error("failed to create channel for performer '{performer}': {source}")]
    Channel {
        /// Performer name.
        performer: String,
        /// Why.
        #[source]
        source: ChannelError,
    },

    /// A performer thread could not be spawned.
    #[error("failed to spawn performer '{performer}': {source}")]
    Spawn {
        /// Performer name.
        performer: String,
        /// Why.
        #[source]
        source: std::io::Error,
    },

    /// Proactor performers need a tokio runtime.
    #[error("proactor subscription '{0}' requires a tokio runtime")]
    NoRuntime(String),

    /// Two subscriptions share a name.
    #[error("duplicate subscription name '{0}'")]
    DuplicateSubscription(String),

    /// A required builder part is missing.
    #[error("dispatcher builder is missing {0}")]
    Incomplete(&'static str),

    /// Performers did not stop in time.
    #[error("{0} performers did not stop within the shutdown timeout")]
    ShutdownTimeout(usize),
}

/// Channel a performer reads, kept to post the quit sentinel.
enum PerformerChannel {
    Blocking(Arc<Channel>),
    Suspending(Arc<AsyncChannel>),
}

impl PerformerChannel {
    fn stop(&self) {
        match self {
            Self::Blocking(channel) => channel.stop(),
            Self::Suspending(channel) => channel.stop(),
        }
    }
}

enum PerformerJoin {
    Thread(std::thread::JoinHandle<PumpOutcome>),
    Task(tokio::task::JoinHandle<PumpOutcome>),
}

/// One running pump and its channel.
struct Performer {
    name: String,
    channel: PerformerChannel,
    statistics: Arc<PumpStatistics>,
    join: Option<PerformerJoin>,
}

/// A subscription together with its request type.
trait TypedSubscription: Send + Sync {
    fn subscription(&self) -> &Subscription;

    fn validate(&self, processor: &CommandProcessor) -> Result<(), ConfigurationError>;

    fn start(
        &self,
        performer: String,
        processor: &Arc<CommandProcessor>,
        channels: &dyn ChannelFactory,
    ) -> Result<Performer, DispatcherError>;
}

struct Typed<R> {
    subscription: Subscription,
    mapper: Arc<dyn MessageMapper<R>>,
}

const fn mode_of(subscription: &Subscription) -> ExecutionMode {
    match subscription.message_pump_type {
        MessagePumpType::Reactor => ExecutionMode::Blocking,
        MessagePumpType::Proactor => ExecutionMode::Suspending,
    }
}

impl<R: Request> TypedSubscription for Typed<R> {
    fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    fn validate(&self, processor: &CommandProcessor) -> Result<(), ConfigurationError> {
        processor.validate::<R>(mode_of(&self.subscription))
    }

    fn start(
        &self,
        performer: String,
        processor: &Arc<CommandProcessor>,
        channels: &dyn ChannelFactory,
    ) -> Result<Performer, DispatcherError> {
        let channel_error = |source| DispatcherError::Channel {
            performer: performer.clone(),
            source,
        };
        match self.subscription.message_pump_type {
            MessagePumpType::Reactor => {
                let channel = Arc::new(
                    channels
                        .create_sync_channel(&self.subscription)
                        .map_err(channel_error)?,
                );
                let reactor = Reactor::new(
                    performer.clone(),
                    self.subscription.clone(),
                    Arc::clone(&channel),
                    Arc::clone(processor),
                    Arc::clone(&self.mapper),
                );
                let statistics = reactor.statistics();
                let thread = std::thread::Builder::new()
                    .name(performer.clone())
                    .spawn(move || reactor.run())
                    .map_err(|source| DispatcherError::Spawn {
                        performer: performer.clone(),
                        source,
                    })?;
                Ok(Performer {
                    name: performer,
                    channel: PerformerChannel::Blocking(channel),
                    statistics,
                    join: Some(PerformerJoin::Thread(thread)),
                })
            },
            MessagePumpType::Proactor => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| DispatcherError::NoRuntime(self.subscription.name.clone()))?;
                let channel = Arc::new(
                    channels
                        .create_async_channel(&self.subscription)
                        .map_err(channel_error)?,
                );
                let proactor = Proactor::new(
                    performer.clone(),
                    self.subscription.clone(),
                    Arc::clone(&channel),
                    Arc::clone(processor),
                    Arc::clone(&self.mapper),
                );
                let statistics = proactor.statistics();
                let task = runtime.spawn(proactor.run());
                Ok(Performer {
                    name: performer,
                    channel: PerformerChannel::Suspending(channel),
                    statistics,
                    join: Some(PerformerJoin::Task(task)),
                })
            },
        }
    }
}

/// Runs message pumps for a set of subscriptions.
pub struct Dispatcher {
    processor: Arc<CommandProcessor>,
    channels: Arc<dyn ChannelFactory>,
    subscriptions: Vec<Arc<dyn TypedSubscription>>,
    shutdown_timeout: Duration,
    state: Mutex<DispatcherState>,
    transitions: broadcast::Sender<DispatcherState>,
    performers: Mutex<Vec<Performer>>,
}

impl Dispatcher {
    /// Start building a dispatcher.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every subsequent state transition.
    #[must_use]
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<DispatcherState> {
        self.transitions.subscribe()
    }

    /// The subscriptions the dispatcher was built with.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|typed| typed.subscription().clone())
            .collect()
    }

    /// The processor pumps dispatch into.
    #[must_use]
    pub const fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
    }

    fn transition(&self, state: &mut DispatcherState, next: DispatcherState) {
        tracing::info!(from = %state, to = %next, "dispatcher state change");
        *state = next;
        let _ = self.transitions.send(next);
    }

    /// Start every performer.
    ///
    /// Pipelines are validated first, so a misconfigured subscription fails
    /// here instead of inside a performer. Does nothing unless the
    /// dispatcher is awaiting.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatcherError`] if validation fails, a channel cannot be
    /// created or a performer cannot be spawned. Performers started before
    /// the failure are told to quit.
    pub fn receive(&self) -> Result<(), DispatcherError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != DispatcherState::Awaiting {
            tracing::debug!(state = %state, "receive ignored");
            return Ok(());
        }

        for typed in &self.subscriptions {
            typed
                .validate(&self.processor)
                .map_err(|source| DispatcherError::Configuration {
                    subscription: typed.subscription().name.clone(),
                    source,
                })?;
        }

        let mut started = Vec::new();
        for typed in &self.subscriptions {
            let subscription = typed.subscription();
            for index in 0..subscription.no_of_performers {
                let name = format!("{}#{index}", subscription.name);
                match typed.start(name, &self.processor, self.channels.as_ref()) {
                    Ok(performer) => started.push(performer),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to start performer, stopping the others");
                        for performer in &started {
                            performer.channel.stop();
                        }
                        return Err(err);
                    },
                }
            }
        }

        DispatcherMetrics::record_running(started.len());
        tracing::info!(performers = started.len(), "dispatcher started");
        *self.performers.lock().unwrap_or_else(PoisonError::into_inner) = started;
        self.transition(&mut state, DispatcherState::Running);
        Ok(())
    }

    /// Stop every performer and wait for them, bounded by the shutdown timeout.
    ///
    /// Does nothing unless the dispatcher is running.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::ShutdownTimeout`] if performers were still
    /// running when the timeout elapsed. Proactor tasks are aborted; reactor
    /// threads are left to finish on their own.
    pub async fn end(&self) -> Result<(), DispatcherError> {
        let joins = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != DispatcherState::Running {
                tracing::debug!(state = %state, "end ignored");
                return Ok(());
            }
            self.transition(&mut state, DispatcherState::Stopping);

            let mut performers = self.performers.lock().unwrap_or_else(PoisonError::into_inner);
            for performer in performers.iter() {
                performer.channel.stop();
            }
            performers
                .iter_mut()
                .filter_map(|performer| performer.join.take().map(|join| (performer.name.clone(), join)))
                .collect::<Vec<_>>()
        };

        let aborts: Vec<AbortHandle> = joins
            .iter()
            .filter_map(|(_, join)| match join {
                PerformerJoin::Task(task) => Some(task.abort_handle()),
                PerformerJoin::Thread(_) => None,
            })
            .collect();
        let total = joins.len();
        let waits = joins.into_iter().map(|(name, join)| async move {
            let outcome = match join {
                PerformerJoin::Thread(thread) => tokio::task::spawn_blocking(move || thread.join())
                    .await
                    .map_err(|err| err.to_string())
                    .and_then(|joined| joined.map_err(|_| "performer thread panicked".to_string())),
                PerformerJoin::Task(task) => task.await.map_err(|err| err.to_string()),
            };
            match outcome {
                Ok(outcome) => tracing::debug!(performer = %name, ?outcome, "performer ended"),
                Err(err) => tracing::warn!(performer = %name, error = %err, "performer ended abnormally"),
            }
        });

        let result = match tokio::time::timeout(self.shutdown_timeout, join_all(waits)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                for abort in &aborts {
                    abort.abort();
                }
                let lingering = self
                    .performers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|performer| performer.statistics.is_running())
                    .count();
                tracing::warn!(lingering, total, "shutdown timeout elapsed");
                Err(DispatcherError::ShutdownTimeout(lingering))
            },
        };

        DispatcherMetrics::record_running(0);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.transition(&mut state, DispatcherState::Stopped);
        result
    }

    /// Counters of every performer, by performer name.
    #[must_use]
    pub fn statistics(&self) -> Vec<(String, PumpSnapshot)> {
        self.performers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|performer| (performer.name.clone(), performer.statistics.snapshot()))
            .collect()
    }

    /// Health of the dispatcher and each performer.
    ///
    /// Quarantined and misconfigured performers are unhealthy. A performer
    /// that quit while the dispatcher is running is degraded.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let state = self.state();
        let mut checks = vec![match state {
            DispatcherState::Running => HealthCheck::healthy("dispatcher"),
            other => HealthCheck::degraded("dispatcher", format!("dispatcher is {other}")),
        }];

        for (name, snapshot) in self.statistics() {
            let check = match &snapshot.outcome {
                _ if snapshot.running => HealthCheck::healthy(&name),
                Some(PumpOutcome::Quarantined { unacceptable_messages }) => HealthCheck::unhealthy(
                    &name,
                    format!("quarantined after {unacceptable_messages} unacceptable messages"),
                ),
                Some(PumpOutcome::ConfigurationFailure(reason)) => HealthCheck::unhealthy(&name, reason.clone()),
                Some(PumpOutcome::Quit) | None if state != DispatcherState::Running => HealthCheck::healthy(&name),
                _ => HealthCheck::degraded(&name, "performer is not running"),
            };
            checks.push(
                check
                    .with_metadata("received", snapshot.received)
                    .with_metadata("acknowledged", snapshot.acknowledged)
                    .with_metadata("requeued", snapshot.requeued)
                    .with_metadata("rejected", snapshot.rejected)
                    .with_metadata("unacceptable", snapshot.unacceptable)
                    .with_metadata("channel_failures", snapshot.channel_failures),
            );
        }
        HealthReport::new(checks)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field(
                "subscriptions",
                &self
                    .subscriptions
                    .iter()
                    .map(|typed| typed.subscription().name.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

type Resolve =
    Box<dyn FnOnce(&CommandProcessor) -> Result<Arc<dyn TypedSubscription>, DispatcherError> + Send>;

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    processor: Option<Arc<CommandProcessor>>,
    channels: Option<Arc<dyn ChannelFactory>>,
    subscriptions: Vec<Resolve>,
    shutdown_timeout: Duration,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            processor: None,
            channels: None,
            subscriptions: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherBuilder {
    /// Processor the pumps dispatch into.
    #[must_use]
    pub fn command_processor(mut self, processor: Arc<CommandProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Factory for performer channels.
    #[must_use]
    pub fn channel_factory(mut self, channels: Arc<dyn ChannelFactory>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Subscribe request type `R`, translated by the processor's mapper for `R`.
    #[must_use]
    pub fn subscription<R: Request>(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(Box::new(move |processor: &CommandProcessor| {
            let mapped = processor
                .mappers()
                .get::<R>()
                .map_err(|source| DispatcherError::MissingMapper {
                    subscription: subscription.name.clone(),
                    source,
                })?;
            let typed: Arc<dyn TypedSubscription> = Arc::new(Typed {
                subscription,
                mapper: Arc::clone(&mapped.mapper),
            });
            Ok(typed)
        }));
        self
    }

    /// Subscribe request type `R` with an explicit mapper.
    #[must_use]
    pub fn subscription_with_mapper<R: Request>(
        mut self,
        subscription: Subscription,
        mapper: Arc<dyn MessageMapper<R>>,
    ) -> Self {
        self.subscriptions.push(Box::new(move |_: &CommandProcessor| {
            let typed: Arc<dyn TypedSubscription> = Arc::new(Typed { subscription, mapper });
            Ok(typed)
        }));
        self
    }

    /// How long [`Dispatcher::end`] waits for performers.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::Incomplete`] without a processor or
    /// channel factory, [`DispatcherError::MissingMapper`] if a subscription
    /// has no mapper, and [`DispatcherError::DuplicateSubscription`] for
    /// repeated names.
    pub fn build(self) -> Result<Dispatcher, DispatcherError> {
        let processor = self.processor.ok_or(DispatcherError::Incomplete("a command processor"))?;
        let channels = self.channels.ok_or(DispatcherError::Incomplete("a channel factory"))?;

        let mut names = HashSet::new();
        let mut subscriptions = Vec::with_capacity(self.subscriptions.len());
        for resolve in self.subscriptions {
            let typed = resolve(&processor)?;
            let name = &typed.subscription().name;
            if !names.insert(name.clone()) {
                return Err(DispatcherError::DuplicateSubscription(name.clone()));
            }
            subscriptions.push(typed);
        }

        let (transitions, _) = broadcast::channel(16);
        Ok(Dispatcher {
            processor,
            channels,
            subscriptions,
            shutdown_timeout: self.shutdown_timeout,
            state: Mutex::new(DispatcherState::Awaiting),
            transitions,
            performers: Mutex::new(Vec::new()),
        })
    }
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("subscriptions", &self.subscriptions.len())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}
