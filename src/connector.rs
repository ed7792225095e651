// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connector
//!
//! The connector owns the connection and the channel to the broker and drives them
//! through an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> OpeningChannel -> DeclaringTopology -> Ready
//!            |               |                  |                |
//!            +---------------+---- Closing -----+                |
//!            |                        |                          |
//!            +---------> Reconnecting | Failed <-----------------+
//!                              |
//!                              +--(delay)--> Connecting
//!
//! any non-terminal state --stop()--> Closing -> Closed
//! ```
//!
//! A single tokio task runs the state machine. Connection attempts, reconnect
//! timers, closure notifications and publisher confirms are all handled on that task
//! and never concurrently with each other. Every channel opened gets a new
//! generation number; frames tagged with an older generation are discarded.

use crate::{
    callbacks::{
        CallbackRegistry, CloseReason, ConfirmationHandler, LifecycleEvent, LifecycleListener,
        Notification,
    },
    channel::{BrokerChannel, BrokerConnection, ChannelEvent, EventSink, LapinTransport, Transport},
    configs::AppConfigs,
    errors::AmqpError,
    topology::Topology,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const TRANSITIONS_CAPACITY: usize = 64;

/// Lifecycle states of the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    Idle,
    Connecting,
    OpeningChannel,
    DeclaringTopology,
    Ready,
    Reconnecting,
    Closing,
    /// Clean stop
    Closed,
    /// Gave up after an unrecoverable failure
    Failed,
}

impl ConnectorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectorState::Closed | ConnectorState::Failed)
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    last_error: Option<AmqpError>,
}

struct ConnectorInner {
    topology: Topology,
    reconnect_interval: Option<Duration>,
    transport: Arc<dyn Transport>,
    callbacks: CallbackRegistry,
    confirmation_handlers: RwLock<Vec<Arc<dyn ConfirmationHandler>>>,
    state: watch::Sender<ConnectorState>,
    transitions: broadcast::Sender<ConnectorState>,
    stop: watch::Sender<bool>,
    generation: AtomicU64,
    session: Mutex<Session>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a usable channel to the broker and tells listeners about it.
///
/// Cloning is cheap; clones share the same state machine.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

enum Served {
    Stopped,
    Lost(AmqpError),
}

impl Connector {
    /// Creates an idle connector. Without a `reconnect_interval` any unexpected
    /// closure is terminal.
    pub fn new(
        topology: Topology,
        reconnect_interval: Option<Duration>,
        transport: Arc<dyn Transport>,
    ) -> Connector {
        let (state, _) = watch::channel(ConnectorState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITIONS_CAPACITY);
        let (stop, _) = watch::channel(false);

        Connector {
            inner: Arc::new(ConnectorInner {
                topology,
                reconnect_interval,
                transport,
                callbacks: CallbackRegistry::new(),
                confirmation_handlers: RwLock::new(vec![]),
                state,
                transitions,
                stop,
                generation: AtomicU64::new(0),
                session: Mutex::new(Session::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Creates a connector talking to the broker described by `cfg` through `lapin`.
    pub fn from_configs(cfg: &AppConfigs) -> Connector {
        Connector::new(
            Topology::from_configs(&cfg.topology),
            cfg.publisher.reconnect_interval(),
            Arc::new(LapinTransport::new(&cfg.rabbitmq)),
        )
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectorState::Ready
    }

    /// Generation of the most recent channel; 0 before the first attempt.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<AmqpError> {
        self.session().last_error.clone()
    }

    /// The current channel, only while the connector is ready.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if !self.is_ready() {
            return None;
        }
        self.session().channel.clone()
    }

    /// Every state change from now on, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectorState> {
        self.inner.transitions.subscribe()
    }

    /// Waits until the state satisfies `predicate` and returns that state.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<ConnectorState, AmqpError>
    where
        F: FnMut(&ConnectorState) -> bool,
    {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(predicate)
            .await
            .map(|state| *state)
            .map_err(|_| AmqpError::InternalError)
    }

    pub fn register_callback(&self, event: LifecycleEvent, listener: Arc<dyn LifecycleListener>) {
        self.inner.callbacks.register(event, listener);
    }

    pub fn register_confirmation_handler(&self, handler: Arc<dyn ConfirmationHandler>) {
        self.inner
            .confirmation_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Spawns the event loop. Only meaningful from `Idle` or `Closed`; anywhere else it
    /// logs a warning and does nothing.
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if matches!(*state, ConnectorState::Idle | ConnectorState::Closed) {
                *state = ConnectorState::Connecting;
                true
            } else {
                false
            }
        });

        if !started {
            warn!(state = %self.state(), "connector already started, ignoring start");
            return;
        }

        info!("starting connector");
        let _ = self.inner.transitions.send(ConnectorState::Connecting);
        self.inner.stop.send_replace(false);

        // the handle is stored before the task can reach a callback calling stop()
        let mut task = self.task();
        *task = Some(tokio::spawn(self.clone().run_loop()));
    }

    /// Starts the connector and waits until it reaches `Closed` or `Failed`.
    pub async fn run(&self) -> Result<ConnectorState, AmqpError> {
        self.start();
        self.wait_for(ConnectorState::is_terminal).await
    }

    /// Closes the channel then the connection and ends in `Closed`.
    ///
    /// Teardown is best-effort: failures are logged, never returned. Called from a
    /// listener or handler running on the connector task, it only requests the stop:
    /// the teardown runs once that callback returns.
    pub async fn stop(&self) {
        let stopped_idle = self.inner.state.send_if_modified(|state| {
            if *state == ConnectorState::Idle {
                *state = ConnectorState::Closed;
                true
            } else {
                false
            }
        });
        if stopped_idle {
            let _ = self.inner.transitions.send(ConnectorState::Closed);
            return;
        }

        if self.state().is_terminal() {
            debug!(state = %self.state(), "connector already stopped");
            return;
        }

        info!("stopping connector");
        self.inner.stop.send_replace(true);

        if self.on_connector_task() {
            debug!("stop requested from a connector callback, teardown continues after it");
            return;
        }

        let handle = self.task().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "connector task failed");
            }
        }

        if let Err(err) = self.wait_for(ConnectorState::is_terminal).await {
            error!(error = err.to_string(), "error waiting for the connector to stop");
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connector_task(&self) -> bool {
        let current = tokio::task::try_id();
        match (self.task().as_ref(), current) {
            (Some(handle), Some(id)) => handle.id() == id,
            _ => false,
        }
    }

    fn set_state(&self, state: ConnectorState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connector state changed");
            let _ = self.inner.transitions.send(state);
        }
    }

    async fn run_loop(self) {
        let mut stop = self.inner.stop.subscribe();
        let (tx, mut events) = mpsc::unbounded_channel();

        loop {
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let sink = EventSink::new(generation, tx.clone());

            let established = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => None,
                result = self.establish(sink) => Some(result),
            };

            let failure = match established {
                None => return self.shutdown(generation).await,
                Some(Err(err)) => err,
                Some(Ok(())) => match self.serve(generation, &mut events, &mut stop).await {
                    Served::Stopped => return self.shutdown(generation).await,
                    Served::Lost(err) => err,
                },
            };

            error!(
                error = failure.to_string(),
                generation, "connector lost its channel"
            );
            self.session().last_error = Some(failure.clone());

            if matches!(
                self.state(),
                ConnectorState::OpeningChannel | ConnectorState::DeclaringTopology
            ) {
                self.set_state(ConnectorState::Closing);
            }
            self.teardown().await;

            let Some(interval) = self.inner.reconnect_interval else {
                self.notify_closed(generation, CloseReason::Failed(failure))
                    .await;
                self.set_state(ConnectorState::Failed);
                return;
            };

            self.set_state(ConnectorState::Reconnecting);
            self.notify_closed(generation, CloseReason::Unexpected(failure))
                .await;
            info!("reconnecting in {:?}", interval);

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => return self.shutdown(generation).await,
                _ = tokio::time::sleep(interval) => {
                    self.set_state(ConnectorState::Connecting);
                }
            }
        }
    }

    /// connect -> open channel -> declare topology -> ready listeners
    async fn establish(&self, sink: EventSink) -> Result<(), AmqpError> {
        let generation = sink.generation();
        self.set_state(ConnectorState::Connecting);
        debug!(generation, "connecting to the broker");

        let connection = self.inner.transport.connect(sink.clone()).await?;
        self.session().connection = Some(connection.clone());

        self.set_state(ConnectorState::OpeningChannel);
        let channel = connection.open_channel(sink).await?;
        self.session().channel = Some(channel.clone());

        self.set_state(ConnectorState::DeclaringTopology);
        self.inner.topology.install(channel.as_ref()).await?;

        self.inner
            .callbacks
            .dispatch(Notification::Ready {
                generation,
                channel,
            })
            .await?;

        self.set_state(ConnectorState::Ready);
        info!(generation, "connector ready");
        Ok(())
    }

    async fn serve(
        &self,
        generation: u64,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> Served {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop_requested(stop) => return Served::Stopped,
                event = events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Confirmation {
                    generation: tagged,
                    frame,
                }) => {
                    if tagged != generation {
                        warn!(
                            generation = tagged,
                            current = generation,
                            "discarding confirmation of a replaced channel"
                        );
                        continue;
                    }

                    let handlers = self
                        .inner
                        .confirmation_handlers
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for handler in handlers {
                        handler.on_delivery_confirmation(tagged, frame).await;
                    }
                }
                Some(ChannelEvent::Closed {
                    generation: tagged,
                    error,
                }) => {
                    if tagged != generation {
                        debug!(generation = tagged, "ignoring closure of a replaced channel");
                        continue;
                    }
                    return Served::Lost(error);
                }
                None => {
                    return Served::Lost(AmqpError::TransportFailure(
                        "event stream ended".to_owned(),
                    ))
                }
            }
        }
    }

    async fn shutdown(&self, generation: u64) {
        self.set_state(ConnectorState::Closing);
        self.teardown().await;
        self.notify_closed(generation, CloseReason::Stopped).await;
        self.set_state(ConnectorState::Closed);
        info!("connector stopped");
    }

    /// Closes the channel, then the connection. Failures are only logged.
    async fn teardown(&self) {
        let (channel, connection) = {
            let mut session = self.session();
            (session.channel.take(), session.connection.take())
        };

        if let Some(channel) = channel {
            if channel.is_open() {
                debug!("closing channel");
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "error closing the channel");
                }
            }
        }

        if let Some(connection) = connection {
            if connection.is_open() {
                debug!("closing connection");
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "error closing the connection");
                }
            }
        }
    }

    async fn notify_closed(&self, generation: u64, reason: CloseReason) {
        if let Err(err) = self
            .inner
            .callbacks
            .dispatch(Notification::Closed { generation, reason })
            .await
        {
            warn!(error = err.to_string(), "closed listener failed");
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let requested = stop.wait_for(|requested| *requested).await.is_ok();
    if !requested {
        // sender lives as long as the connector, never resolve on its drop
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        callbacks::{MockConfirmationHandler, MockLifecycleListener},
        confirms::ConfirmationFrame,
        configs::TopologyConfigs, exchange::ExchangeKind, mocks::InMemoryBroker,
    };
    use std::sync::Mutex as StdMutex;

    fn topology() -> Topology {
        Topology::from_configs(&TopologyConfigs {
            exchange: "orders".into(),
            exchange_kind: ExchangeKind::Topic,
            queue: "orders.q".into(),
            routing_key: "orders.new".into(),
            durable: false,
        })
    }

    fn connector(broker: &InMemoryBroker, reconnect: Option<Duration>) -> Connector {
        Connector::new(topology(), reconnect, Arc::new(broker.clone()))
    }

    async fn collect_until(
        rx: &mut broadcast::Receiver<ConnectorState>,
        last: ConnectorState,
    ) -> Vec<ConnectorState> {
        let mut seen = vec![];
        loop {
            let state = rx.recv().await.unwrap();
            seen.push(state);
            if state == last {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn reaches_ready_through_the_ordered_setup() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);
        let mut transitions = connector.subscribe_transitions();

        connector.start();

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Ready).await,
            vec![
                ConnectorState::Connecting,
                ConnectorState::OpeningChannel,
                ConnectorState::DeclaringTopology,
                ConnectorState::Ready,
            ]
        );
        assert_eq!(
            broker.operations(),
            vec![
                "connection.open",
                "channel.open",
                "exchange.declare orders topic",
                "queue.declare orders.q",
                "queue.bind orders.q orders orders.new",
            ]
        );
        assert_eq!(connector.generation(), 1);
        assert!(connector.channel().is_some());
    }

    #[tokio::test]
    async fn ready_listeners_run_in_order_before_ready() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);
        let calls = Arc::new(StdMutex::new(vec![]));

        for name in ["publisher", "metrics"] {
            let calls = calls.clone();
            let observed = connector.clone();
            connector.inner.callbacks.register_fn(LifecycleEvent::Ready, move |n| {
                calls
                    .lock()
                    .unwrap()
                    .push((name, n.generation(), observed.state()));
            });
        }

        connector.start();
        connector.wait_for(|s| *s == ConnectorState::Ready).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("publisher", 1, ConnectorState::DeclaringTopology),
                ("metrics", 1, ConnectorState::DeclaringTopology),
            ]
        );
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);

        connector.start();
        connector.wait_for(|s| *s == ConnectorState::Ready).await.unwrap();
        connector.start();

        assert_eq!(connector.state(), ConnectorState::Ready);
        assert_eq!(broker.connections(), 1);
    }

    #[tokio::test]
    async fn connect_failure_without_reconnect_is_terminal() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let connector = connector(&broker, None);
        let reasons = Arc::new(StdMutex::new(vec![]));
        let seen = reasons.clone();
        connector
            .inner
            .callbacks
            .register_fn(LifecycleEvent::Closed, move |n| {
                if let Notification::Closed { reason, .. } = n {
                    seen.lock().unwrap().push(reason.clone());
                }
            });

        let state = connector.run().await.unwrap();

        assert_eq!(state, ConnectorState::Failed);
        assert_eq!(
            connector.last_error(),
            Some(AmqpError::TransportFailure("connection refused".into()))
        );
        assert_eq!(
            *reasons.lock().unwrap(),
            vec![CloseReason::Failed(AmqpError::TransportFailure(
                "connection refused".into()
            ))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_with_reconnect_retries_after_the_interval() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let connector = connector(&broker, Some(Duration::from_secs(2)));
        let mut transitions = connector.subscribe_transitions();

        connector.start();

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Ready).await,
            vec![
                ConnectorState::Connecting,
                ConnectorState::Reconnecting,
                ConnectorState::Connecting,
                ConnectorState::Reconnecting,
                ConnectorState::Connecting,
                ConnectorState::OpeningChannel,
                ConnectorState::DeclaringTopology,
                ConnectorState::Ready,
            ]
        );
        assert_eq!(connector.generation(), 3);
    }

    #[tokio::test]
    async fn topology_failure_goes_through_closing() {
        let broker = InMemoryBroker::new();
        broker.fail_bind(true);
        let connector = connector(&broker, None);
        let mut transitions = connector.subscribe_transitions();

        connector.start();

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Failed).await,
            vec![
                ConnectorState::Connecting,
                ConnectorState::OpeningChannel,
                ConnectorState::DeclaringTopology,
                ConnectorState::Closing,
                ConnectorState::Failed,
            ]
        );
        assert!(connector.last_error().unwrap().is_topology_failure());
        assert!(broker.operations().contains(&"channel.close".to_owned()));
        assert!(broker.operations().contains(&"connection.close".to_owned()));
    }

    #[tokio::test]
    async fn exchange_failure_stops_the_ordered_setup() {
        let broker = InMemoryBroker::new();
        broker.fail_exchange_declare(true);
        let connector = connector(&broker, None);
        let mut transitions = connector.subscribe_transitions();

        connector.start();

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Failed).await,
            vec![
                ConnectorState::Connecting,
                ConnectorState::OpeningChannel,
                ConnectorState::DeclaringTopology,
                ConnectorState::Closing,
                ConnectorState::Failed,
            ]
        );
        assert_eq!(
            connector.last_error(),
            Some(AmqpError::DeclareExchangeError("orders".into()))
        );
        assert_eq!(
            broker.operations(),
            vec![
                "connection.open",
                "channel.open",
                "channel.close",
                "connection.close",
            ]
        );
    }

    struct StopOnReady {
        connector: Connector,
    }

    #[async_trait::async_trait]
    impl LifecycleListener for StopOnReady {
        async fn on_event(&self, _: Notification) -> Result<(), AmqpError> {
            self.connector.stop().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_from_a_ready_listener_completes_after_it_returns() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, Some(Duration::from_secs(1)));
        connector.register_callback(
            LifecycleEvent::Ready,
            Arc::new(StopOnReady {
                connector: connector.clone(),
            }),
        );

        connector.start();
        let state = tokio::time::timeout(
            Duration::from_secs(3),
            connector.wait_for(|s| s.is_terminal()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(state, ConnectorState::Closed);
        assert!(!broker.channel_open());
        assert!(broker.operations().contains(&"connection.close".to_owned()));
    }

    #[tokio::test]
    async fn failing_ready_listener_aborts_the_session() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);
        let mut listener = MockLifecycleListener::new();
        listener
            .expect_on_event()
            .times(1)
            .returning(|_| Err(AmqpError::ConfirmSelectError));
        connector.register_callback(LifecycleEvent::Ready, Arc::new(listener));

        assert_eq!(connector.run().await.unwrap(), ConnectorState::Failed);
        assert_eq!(connector.last_error(), Some(AmqpError::ConfirmSelectError));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_closure_reconnects_with_a_new_generation() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, Some(Duration::from_secs(2)));
        let mut transitions = connector.subscribe_transitions();

        connector.start();
        collect_until(&mut transitions, ConnectorState::Ready).await;

        broker.close_channel("connection reset");

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Ready).await,
            vec![
                ConnectorState::Reconnecting,
                ConnectorState::Connecting,
                ConnectorState::OpeningChannel,
                ConnectorState::DeclaringTopology,
                ConnectorState::Ready,
            ]
        );
        assert_eq!(connector.generation(), 2);
        assert_eq!(broker.connections(), 2);
    }

    #[tokio::test]
    async fn unexpected_closure_without_reconnect_fails() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);

        connector.start();
        connector.wait_for(|s| *s == ConnectorState::Ready).await.unwrap();
        broker.close_channel("connection reset");

        assert_eq!(
            connector.wait_for(|s| s.is_terminal()).await.unwrap(),
            ConnectorState::Failed
        );
        assert!(connector.channel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_current_confirmations_and_drops_stale_ones() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, Some(Duration::from_secs(2)));
        let frames = Arc::new(StdMutex::new(vec![]));
        let mut transitions = connector.subscribe_transitions();

        let mut handler = MockConfirmationHandler::new();
        let seen = frames.clone();
        handler
            .expect_on_delivery_confirmation()
            .returning(move |generation, frame| seen.lock().unwrap().push((generation, frame)));
        connector.register_confirmation_handler(Arc::new(handler));

        connector.start();
        collect_until(&mut transitions, ConnectorState::Ready).await;
        broker.ack(4, true);
        broker.close_channel("connection reset");
        collect_until(&mut transitions, ConnectorState::Ready).await;

        broker.ack_on(1, 1, false);
        broker.ack(1, false);
        while frames.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            *frames.lock().unwrap(),
            vec![
                (1, ConfirmationFrame::ack(4, true)),
                (2, ConfirmationFrame::ack(1, false)),
            ]
        );
        connector.stop().await;
    }

    #[tokio::test]
    async fn stop_tears_down_and_closes() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, Some(Duration::from_secs(1)));
        let mut transitions = connector.subscribe_transitions();

        connector.start();
        collect_until(&mut transitions, ConnectorState::Ready).await;
        connector.stop().await;

        assert_eq!(
            collect_until(&mut transitions, ConnectorState::Closed).await,
            vec![ConnectorState::Closing, ConnectorState::Closed]
        );
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert!(!broker.channel_open());
        let ops = broker.operations();
        assert_eq!(&ops[ops.len() - 2..], ["channel.close", "connection.close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_reconnecting_cancels_the_timer() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let connector = connector(&broker, Some(Duration::from_secs(3600)));

        connector.start();
        connector
            .wait_for(|s| *s == ConnectorState::Reconnecting)
            .await
            .unwrap();
        connector.stop().await;

        assert_eq!(connector.state(), ConnectorState::Closed);
        assert_eq!(broker.connections(), 0);
    }

    #[tokio::test]
    async fn stop_before_start_closes_and_allows_restart() {
        let broker = InMemoryBroker::new();
        let connector = connector(&broker, None);

        connector.stop().await;
        assert_eq!(connector.state(), ConnectorState::Closed);

        connector.start();
        connector.wait_for(|s| *s == ConnectorState::Ready).await.unwrap();
        connector.stop().await;
        assert_eq!(connector.state(), ConnectorState::Closed);
    }
}
