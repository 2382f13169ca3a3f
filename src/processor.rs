//! Command queue and the single bus-owning consumer.
//!
//! Producers hold a cloneable [`CommandQueue`] and never block. One
//! [`CommandProcessor`] task drains the queue, routes each request and runs
//! the bus call on tokio's blocking pool. Every processed request, good or
//! bad, yields a [`CommandOutcome`] on a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{DaliBus, LevelReading};
use crate::config::ProcessorConfig;
use crate::error::DriverStatus;
use crate::frame::{opcode, Frame};
use crate::poller::{LevelPoller, StateReport};
use crate::router::{self, BusAction, LightPower, LightState, Route};

const OUTCOME_BROADCAST_CAPACITY: usize = 64;

/// An owned request, copied out of the producer's buffers at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Producer side of the bounded FIFO.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<CommandRequest>,
}

/// Consumer side; owned by the processor.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<CommandRequest>,
}

/// Create a bounded command queue. `capacity` must be non-zero.
pub fn command_queue(capacity: usize) -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandQueue { tx }, CommandReceiver { rx })
}

impl CommandQueue {
    /// Copy the request into the queue. Returns `false` when the queue is
    /// full or the processor is gone; never blocks.
    pub fn enqueue(&self, topic: &str, payload: &[u8]) -> bool {
        self.submit(topic, payload).is_ok()
    }

    /// Like [`CommandQueue::enqueue`] but reports the status.
    pub fn submit(&self, topic: &str, payload: &[u8]) -> Result<(), DriverStatus> {
        let request = CommandRequest {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(request)) => {
                debug!("Command queue full, dropping '{}'", request.topic);
                Err(DriverStatus::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!("Command processor stopped, dropping '{}'", request.topic);
                Err(DriverStatus::QueueFull)
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Stops the processor. Dropping the handle stops it too.
#[derive(Debug)]
#[must_use = "dropping the handle stops the processor"]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the handle is dropped.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Result of one processed request or one changed poll reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub topic: String,
    pub action: Option<BusAction>,
    pub status: DriverStatus,
    pub reply: Option<u8>,
    pub state: Option<LightState>,
    /// Why the request was not executed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub received: u64,
    pub executed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub polls: u64,
    pub state_reports: u64,
}

/// What a bus action produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionResult {
    pub status: DriverStatus,
    pub reply: Option<u8>,
}

impl ActionResult {
    fn status(status: DriverStatus) -> Self {
        Self {
            status,
            reply: None,
        }
    }
}

impl BusAction {
    /// Run the action on the bus. Blocks for up to one bus timeout per frame.
    pub fn execute(&self, bus: &DaliBus) -> ActionResult {
        match *self {
            BusAction::Command {
                address_type,
                address,
                command,
                repeat,
            } => ActionResult::status(bus.send_command(address_type, address, command, repeat)),
            BusAction::SetLevel {
                address_type,
                address,
                level,
            } => ActionResult::status(bus.set_level(address_type, address, level)),
            BusAction::Query {
                address_type,
                address,
                command,
            } => query(bus, Frame::command(address_type, address, command)),
            BusAction::QueryLevel {
                address_type,
                address,
            } => query(
                bus,
                Frame::command(address_type, address, opcode::QUERY_ACTUAL_LEVEL),
            ),
            BusAction::ManageGroup {
                short_address,
                group,
                add,
            } => ActionResult::status(bus.manage_group(short_address, group, add)),
        }
    }
}

fn query(bus: &DaliBus, frame: Result<Frame, crate::frame::AddressError>) -> ActionResult {
    match frame {
        Ok(frame) => {
            let result = bus.query(&frame);
            ActionResult {
                status: result.status,
                reply: result.backward_byte(),
            }
        }
        Err(e) => {
            warn!("Query not sent: {}", e);
            ActionResult::status(DriverStatus::FrameError)
        }
    }
}

/// Light state implied by a successfully executed light request.
fn light_state(route: &Route, result: &ActionResult) -> Option<LightState> {
    let target = route.target?;
    if !result.status.is_ok() {
        return None;
    }
    match route.action {
        BusAction::Command {
            command: opcode::OFF,
            ..
        } => Some(LightState::from_level(target, 0)),
        BusAction::Command {
            command: opcode::RECALL_MAX_LEVEL,
            ..
        } => Some(LightState {
            target,
            state: LightPower::On,
            brightness: None,
        }),
        BusAction::SetLevel { level, .. } => Some(LightState::from_level(target, level)),
        BusAction::QueryLevel { .. } => LevelReading::from_reply(result.reply)
            .level()
            .map(|level| LightState::from_level(target, level)),
        _ => None,
    }
}

pub struct CommandProcessor {
    bus: Arc<DaliBus>,
    config: ProcessorConfig,
    receiver: CommandReceiver,
    outcomes: broadcast::Sender<CommandOutcome>,
    poller: Option<LevelPoller>,
    stats: ProcessorStats,
}

impl CommandProcessor {
    pub fn new(bus: Arc<DaliBus>, config: ProcessorConfig, receiver: CommandReceiver) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_BROADCAST_CAPACITY);
        let poller = config
            .poll_interval_ms
            .map(|_| LevelPoller::from_config(&config));
        Self {
            bus,
            config,
            receiver,
            outcomes,
            poller,
            stats: ProcessorStats::default(),
        }
    }

    /// Outcome stream for the messaging bridge. Subscribe before spawning
    /// to see every outcome.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandOutcome> {
        self.outcomes.subscribe()
    }

    /// Run on the current tokio runtime.
    ///
    /// The processor stops as soon as the returned [`ShutdownHandle`] is
    /// dropped, so keep it alive for as long as the processor should run.
    /// Binding it to `_` stops the processor right away.
    #[must_use = "dropping the ShutdownHandle stops the processor"]
    pub fn spawn(self) -> (ShutdownHandle, JoinHandle<ProcessorStats>) {
        let (handle, signal) = shutdown_channel();
        let task = tokio::spawn(self.run(signal));
        (handle, task)
    }

    /// Drain the queue until shutdown or until every producer is gone.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> ProcessorStats {
        info!(
            "Command processor started (base topic '{}', queue capacity {})",
            self.config.base_topic, self.config.queue_capacity
        );

        let mut poll_interval = self.config.poll_interval_ms.map(|ms| {
            let period = Duration::from_millis(ms);
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Command processor shutting down");
                    break;
                }
                request = self.receiver.rx.recv() => match request {
                    Some(request) => self.process(request).await,
                    None => {
                        info!("All command producers dropped");
                        break;
                    }
                },
                _ = next_tick(&mut poll_interval) => self.poll().await,
            }
        }

        info!(
            "Command processor stopped: {} received, {} executed, {} failed, {} rejected",
            self.stats.received, self.stats.executed, self.stats.failed, self.stats.rejected
        );
        self.stats
    }

    async fn process(&mut self, request: CommandRequest) {
        self.stats.received += 1;

        let route = match router::route(&self.config.base_topic, &request.topic, &request.payload) {
            Ok(route) => route,
            Err(e) => {
                warn!("Rejected '{}': {}", request.topic, e);
                self.stats.rejected += 1;
                self.publish(CommandOutcome {
                    topic: request.topic,
                    action: None,
                    status: DriverStatus::FrameError,
                    reply: None,
                    state: None,
                    error: Some(e.to_string()),
                });
                return;
            }
        };

        let bus = Arc::clone(&self.bus);
        let action = route.action.clone();
        let result = match tokio::task::spawn_blocking(move || action.execute(&bus)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Bus task for '{}' failed: {}", request.topic, e);
                self.stats.failed += 1;
                self.publish(CommandOutcome {
                    topic: request.topic,
                    action: Some(route.action),
                    status: DriverStatus::Timeout,
                    reply: None,
                    state: None,
                    error: Some(e.to_string()),
                });
                return;
            }
        };

        self.stats.executed += 1;
        match result.status {
            DriverStatus::Ok => debug!("'{}' done, reply {:?}", request.topic, result.reply),
            status if status.is_fault() => {
                self.stats.failed += 1;
                warn!("'{}' failed: {}", request.topic, status)
            }
            status => {
                self.stats.failed += 1;
                debug!("'{}' failed: {}", request.topic, status)
            }
        }

        let state = light_state(&route, &result);
        self.publish(CommandOutcome {
            topic: request.topic,
            action: Some(route.action),
            status: result.status,
            reply: result.reply,
            state,
            error: None,
        });
    }

    async fn poll(&mut self) {
        let mut poller = match self.poller.take() {
            Some(poller) => poller,
            None => return,
        };
        let bus = Arc::clone(&self.bus);
        let polled = tokio::task::spawn_blocking(move || {
            let reports = poller.poll_once(&bus);
            (poller, reports)
        })
        .await;

        let reports = match polled {
            Ok((poller, reports)) => {
                self.poller = Some(poller);
                reports
            }
            Err(e) => {
                error!("Level poll task failed, polling disabled: {}", e);
                return;
            }
        };

        self.stats.polls += 1;
        for report in reports {
            self.stats.state_reports += 1;
            let outcome = self.report_outcome(report);
            self.publish(outcome);
        }
    }

    fn report_outcome(&self, report: StateReport) -> CommandOutcome {
        let topic = report
            .target
            .state_topic(&self.config.base_topic)
            .map(|t| t.to_string())
            .unwrap_or_else(|| format!("{}/light/state", self.config.base_topic));
        let (status, reply, state) = match report.reading {
            LevelReading::Level(level) => (
                DriverStatus::Ok,
                Some(level),
                Some(LightState::from_level(report.target, level)),
            ),
            LevelReading::Mask => (DriverStatus::Ok, Some(0xFF), None),
            LevelReading::NoReply => (DriverStatus::Timeout, None, None),
        };
        CommandOutcome {
            topic,
            action: None,
            status,
            reply,
            state,
            error: None,
        }
    }

    fn publish(&self, outcome: CommandOutcome) {
        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AddressType;
    use crate::router::Target;

    #[test]
    fn test_enqueue_copies_and_bounds() {
        let (queue, mut receiver) = command_queue(2);
        let mut payload = b"{\"state\":\"ON\"}".to_vec();
        assert!(queue.enqueue("dali/light/1/set", &payload));
        payload.clear();
        assert!(queue.enqueue("dali/light/2/set", b"{}"));
        assert!(!queue.enqueue("dali/light/3/set", b"{}"));
        assert_eq!(queue.submit("x", b""), Err(DriverStatus::QueueFull));

        let first = receiver.rx.try_recv().unwrap();
        assert_eq!(first.payload, b"{\"state\":\"ON\"}".to_vec());
    }

    #[test]
    fn test_closed_queue_rejects() {
        let (queue, receiver) = command_queue(4);
        drop(receiver);
        assert!(!queue.enqueue("dali/command", b"{}"));
    }

    #[test]
    fn test_light_state_from_results() {
        let target = Target::short(3);
        let route = Route {
            action: BusAction::Command {
                address_type: AddressType::Short,
                address: 3,
                command: opcode::RECALL_MAX_LEVEL,
                repeat: false,
            },
            target: Some(target),
        };
        let ok = ActionResult::status(DriverStatus::Ok);
        let state = light_state(&route, &ok).unwrap();
        assert_eq!(state.state, LightPower::On);
        assert_eq!(state.brightness, None);

        let failed = ActionResult::status(DriverStatus::Timeout);
        assert_eq!(light_state(&route, &failed), None);

        let route = Route {
            action: BusAction::QueryLevel {
                address_type: AddressType::Short,
                address: 3,
            },
            target: Some(target),
        };
        let reply = ActionResult {
            status: DriverStatus::Ok,
            reply: Some(0),
        };
        assert_eq!(
            light_state(&route, &reply),
            Some(LightState::from_level(target, 0))
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves() {
        let (handle, mut signal) = shutdown_channel();
        assert!(!signal.is_shutdown());
        handle.shutdown();
        signal.wait().await;
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_request_serializes_payload_as_bytes() {
        let request = CommandRequest {
            topic: "dali/command".into(),
            payload: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"topic":"dali/command","payload":[1,2,3]}"#);
    }
}
