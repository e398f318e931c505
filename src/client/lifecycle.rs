/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::client::{AtomicConnectionState, ConnectionState, IotClient, StatusCallback};
use crate::config::{ClientConfig, QualityOfService};
use crate::error::{IotError, IotResult};
use crate::routing::{AckCallback, AckRegistry, SubscriptionCallback, SubscriptionRegistry};
use crate::session::{MqttSession, SessionConfig, SessionEvent, SessionEventSender, SessionFactoryFn};
use crate::signing::SkewAdjustedClock;
use crate::transport::ChannelFactoryFn;

use log::*;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;

const HEARTBEAT_INTERVAL_SECONDS : u64 = 60;

/// Exponential backoff bookkeeping for the reconnect state machine.
///
/// The current reconnect time doubles on each scheduled attempt, capped at the configured
/// maximum.  Once a live connection has been up for the configured minimum connection time,
/// the backoff is restored so that the next failure retries after exactly the base time;
/// flapping connections that never reach the threshold keep backing off.
pub(crate) struct ReconnectTracker {
    base_seconds: f64,
    maximum_seconds: f64,
    minimum_connection_seconds: u64,

    current_seconds: f64,
    hold_at_base: bool,

    connection_age_seconds: u64,
    timer_armed: bool,
}

impl ReconnectTracker {

    pub(crate) fn new(config: &ClientConfig) -> Self {
        ReconnectTracker {
            base_seconds: config.base_reconnect_seconds,
            maximum_seconds: config.maximum_reconnect_seconds,
            minimum_connection_seconds: config.minimum_connection_seconds,
            current_seconds: config.base_reconnect_seconds,
            hold_at_base: false,
            connection_age_seconds: 0,
            timer_armed: false,
        }
    }

    pub(crate) fn reset_connection_age(&mut self) {
        self.connection_age_seconds = 0;
    }

    /// Advances the 1 Hz connection-age counter.  Returns false once the stability threshold
    /// has been reached and the caller can stop ticking.
    pub(crate) fn tick_connection_age(&mut self) -> bool {
        self.connection_age_seconds += 1;
        if self.connection_age_seconds >= self.minimum_connection_seconds {
            debug!("reconnect tracker - connection stable for {} seconds, restoring base reconnect time", self.connection_age_seconds);
            self.current_seconds = self.base_seconds;
            self.hold_at_base = true;
            return false;
        }

        true
    }

    fn next_delay(&mut self) -> Duration {
        if self.hold_at_base {
            self.hold_at_base = false;
            self.current_seconds = self.base_seconds;
        } else {
            self.current_seconds = f64::min(self.current_seconds * 2.0, self.maximum_seconds);
        }

        Duration::from_secs_f64(self.current_seconds)
    }

    fn arm(&mut self) -> Option<Duration> {
        if self.timer_armed {
            return None;
        }

        self.timer_armed = true;
        Some(self.next_delay())
    }

    fn disarm(&mut self) {
        self.timer_armed = false;
    }
}

#[derive(Default)]
struct IntentFlags {
    connect_issued: bool,
    disconnect_issued: bool,
}

pub(crate) enum LoopCommand {
    Shutdown
}

/// Shared state behind the public client handle: configuration, the registries, the current
/// session handle, and the plumbing into the lifecycle event loop.
pub(crate) struct ClientCore {
    pub(crate) config: ClientConfig,
    session_factory: SessionFactoryFn,
    runtime: Handle,
    pub(crate) clock: Arc<SkewAdjustedClock>,

    status: AtomicConnectionState,
    intent: Mutex<IntentFlags>,
    status_callback: Mutex<Option<StatusCallback>>,
    subscriptions: Mutex<SubscriptionRegistry>,
    pending_acks: Mutex<AckRegistry>,
    session: Mutex<Option<Arc<dyn MqttSession>>>,
    loop_commands: Mutex<Option<UnboundedSender<LoopCommand>>>,
    reconnect: Mutex<ReconnectTracker>,

    // distinguishes lifecycle loops across connect/disconnect/connect sequences so a halting
    // loop cannot publish its session over a successor's
    generation: AtomicU64,

    self_handle: Weak<ClientCore>,
}

impl ClientCore {

    pub(crate) fn new(config: ClientConfig, session_factory: SessionFactoryFn, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| {
            let reconnect = ReconnectTracker::new(&config);
            ClientCore {
                config,
                session_factory,
                runtime,
                clock: Arc::new(SkewAdjustedClock::new()),
                status: AtomicConnectionState::new(ConnectionState::Disconnected),
                intent: Mutex::new(IntentFlags::default()),
                status_callback: Mutex::new(None),
                subscriptions: Mutex::new(SubscriptionRegistry::new()),
                pending_acks: Mutex::new(AckRegistry::new()),
                session: Mutex::new(None),
                loop_commands: Mutex::new(None),
                reconnect: Mutex::new(reconnect),
                generation: AtomicU64::new(0),
                self_handle: self_handle.clone(),
            }
        })
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.status.load()
    }

    pub(crate) fn disconnect_issued(&self) -> bool {
        self.intent.lock().unwrap().disconnect_issued
    }

    pub(crate) fn connect_with_factory(self: &Arc<Self>, channel_factory: ChannelFactoryFn, status_callback: StatusCallback) -> IotResult<()> {
        {
            let mut intent = self.intent.lock().unwrap();
            if intent.connect_issued {
                return Err(IotError::AlreadyConnecting);
            }

            intent.connect_issued = true;
            intent.disconnect_issued = false;
        }

        info!("client - connect issued");

        if self.config.clean_session {
            debug!("client - clean session requested, clearing subscription registry");
            self.subscriptions.lock().unwrap().clear();
        }
        self.pending_acks.lock().unwrap().clear();

        *self.status_callback.lock().unwrap() = Some(status_callback);
        *self.reconnect.lock().unwrap() = ReconnectTracker::new(&self.config);

        self.set_status_and_notify(ConnectionState::Connecting);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (command_sender, command_receiver) = unbounded_channel();
        *self.loop_commands.lock().unwrap() = Some(command_sender);

        self.runtime.spawn(run_lifecycle_loop(self.clone(), generation, channel_factory, command_receiver));

        Ok(())
    }

    pub(crate) fn disconnect(&self) {
        {
            let mut intent = self.intent.lock().unwrap();
            if intent.disconnect_issued || !intent.connect_issued {
                return;
            }

            intent.disconnect_issued = true;
            intent.connect_issued = false;
        }

        info!("client - disconnect issued");

        if let Some(command_sender) = self.loop_commands.lock().unwrap().take() {
            command_sender.send(LoopCommand::Shutdown).ok();
        }

        if let Some(session) = self.session.lock().unwrap().take() {
            session.disconnect();
            session.close();
        }

        self.pending_acks.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
        self.reconnect.lock().unwrap().reset_connection_age();

        self.set_status_and_notify(ConnectionState::Disconnected);
    }

    pub(crate) fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, ack_callback: Option<AckCallback>) -> IotResult<Option<u16>> {
        self.check_operation_preconditions()?;

        if qos == QualityOfService::AtMostOnce && ack_callback.is_some() {
            return Err(IotError::new_invalid_argument("ack callbacks require an acknowledged quality of service"));
        }

        let session = self.current_session().ok_or(IotError::NotConnected)?;

        match qos {
            QualityOfService::AtMostOnce => {
                session.publish_data(payload, topic)?;
                Ok(None)
            }
            QualityOfService::AtLeastOnce => {
                let packet_id = session.publish_data_at_least_once(payload, topic)?;
                if let Some(callback) = ack_callback {
                    self.pending_acks.lock().unwrap().bind(packet_id, callback);
                }
                Ok(Some(packet_id))
            }
        }
    }

    pub(crate) fn subscribe(&self, topic_filter: &str, qos: QualityOfService, callback: SubscriptionCallback, ack_callback: Option<AckCallback>) -> IotResult<u16> {
        self.check_operation_preconditions()?;

        self.subscriptions.lock().unwrap().insert(topic_filter, qos, callback);

        let session = self.current_session().ok_or(IotError::NotConnected)?;
        let packet_id = session.subscribe(topic_filter, qos)?;

        if let Some(callback) = ack_callback {
            self.pending_acks.lock().unwrap().bind(packet_id, callback);
        }

        Ok(packet_id)
    }

    pub(crate) fn unsubscribe(&self, topic_filter: &str, ack_callback: Option<AckCallback>) -> IotResult<u16> {
        self.check_operation_preconditions()?;

        self.subscriptions.lock().unwrap().remove(topic_filter);

        let session = self.current_session().ok_or(IotError::NotConnected)?;
        let packet_id = session.unsubscribe(topic_filter)?;

        if let Some(callback) = ack_callback {
            self.pending_acks.lock().unwrap().bind(packet_id, callback);
        }

        Ok(packet_id)
    }

    fn check_operation_preconditions(&self) -> IotResult<()> {
        let intent = self.intent.lock().unwrap();
        if intent.disconnect_issued {
            return Err(IotError::AlreadyDisconnected);
        }
        if !intent.connect_issued {
            return Err(IotError::NotConnected);
        }

        Ok(())
    }

    fn current_session(&self) -> Option<Arc<dyn MqttSession>> {
        self.session.lock().unwrap().clone()
    }

    fn publish_session(&self, generation: u64, session: Arc<dyn MqttSession>) {
        if self.generation.load(Ordering::SeqCst) == generation {
            *self.session.lock().unwrap() = Some(session);
        }
    }

    fn retire_session(&self, generation: u64) -> Option<Arc<dyn MqttSession>> {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.session.lock().unwrap().take()
        } else {
            None
        }
    }

    fn create_session(&self, reconnecting: bool, event_sender: SessionEventSender) -> IotResult<Arc<dyn MqttSession>> {
        let session_config = SessionConfig {
            client_id: self.config.client_id.clone(),
            username: self.build_username(),
            password: None,
            keep_alive_seconds: self.config.keep_alive_seconds,
            clean_session: self.config.clean_session && !reconnecting,
            will: self.config.will.clone(),
            publish_retry_throttle: self.config.publish_retry_throttle,
        };

        (self.session_factory)(session_config, event_sender)
    }

    fn build_username(&self) -> String {
        if self.config.metrics_enabled {
            format!("?SDK=Rust&Version={}", env!("CARGO_PKG_VERSION"))
        } else {
            String::new()
        }
    }

    pub(crate) fn set_status_and_notify(&self, state: ConnectionState) {
        debug!("client - connection status transitioning to {}", state);
        self.status.store(state);

        let callback = self.status_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            self.runtime.spawn(async move {
                (callback)(state)
            });
        }
    }

    fn resubscribe_all(&self) {
        let snapshot = self.subscriptions.lock().unwrap().subscription_snapshot();
        if snapshot.is_empty() {
            return;
        }

        let Some(session) = self.current_session() else { return };

        info!("client - re-issuing {} subscription(s)", snapshot.len());
        for (topic_filter, qos) in snapshot {
            if let Err(error) = session.subscribe(&topic_filter, qos) {
                warn!("client - resubscribe of \"{}\" failed: {}", topic_filter, error);
            }
        }
    }

    fn dispatch_inbound_message(&self, topic: String, payload: Vec<u8>) {
        let callbacks = self.subscriptions.lock().unwrap().callbacks_matching(&topic);
        debug!("client - inbound message on \"{}\" matched {} subscription(s)", topic, callbacks.len());

        for callback in callbacks {
            match callback {
                SubscriptionCallback::Simple(callback) => {
                    let payload = payload.clone();
                    self.runtime.spawn(async move {
                        (callback)(payload)
                    });
                }
                SubscriptionCallback::Extended(callback) => {
                    if let Some(core) = self.self_handle.upgrade() {
                        let client = IotClient::from_core(core);
                        let topic = topic.clone();
                        let payload = payload.clone();
                        self.runtime.spawn(async move {
                            (callback)(client, topic, payload)
                        });
                    }
                }
            }
        }
    }

    fn dispatch_ack(&self, packet_id: u16) {
        let callback = self.pending_acks.lock().unwrap().take(packet_id);
        match callback {
            Some(callback) => {
                debug!("client - dispatching ack callback for packet id {}", packet_id);
                self.runtime.spawn(async move {
                    (callback)()
                });
            }
            None => {
                debug!("client - no ack callback bound to packet id {}", packet_id);
            }
        }
    }

    fn reset_connection_age(&self) {
        self.reconnect.lock().unwrap().reset_connection_age();
    }

    fn tick_connection_age(&self) -> bool {
        self.reconnect.lock().unwrap().tick_connection_age()
    }

    fn arm_reconnect(&self) -> Option<Duration> {
        if self.connection_state() == ConnectionState::Connected {
            return None;
        }

        self.reconnect.lock().unwrap().arm()
    }

    fn disarm_reconnect(&self) {
        self.reconnect.lock().unwrap().disarm();
    }
}

#[derive(Eq, PartialEq, Copy, Clone)]
enum ControllerState {
    Connecting,
    Running,
    WaitingToReconnect,
    Halted,
}

impl Display for ControllerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Connecting => { write!(f, "Connecting") }
            ControllerState::Running => { write!(f, "Running") }
            ControllerState::WaitingToReconnect => { write!(f, "WaitingToReconnect") }
            ControllerState::Halted => { write!(f, "Halted") }
        }
    }
}

struct ControllerRuntime {
    core: Arc<ClientCore>,
    generation: u64,
    channel_factory: ChannelFactoryFn,
    commands: UnboundedReceiver<LoopCommand>,
    event_sender: UnboundedSender<SessionEvent>,
    events: UnboundedReceiver<SessionEvent>,
    connected_previously: bool,
}

impl ControllerRuntime {

    async fn process_connecting(&mut self) -> ControllerState {
        if self.core.disconnect_issued() {
            return ControllerState::Halted;
        }

        let session = match self.core.create_session(self.connected_previously, self.event_sender.clone()) {
            Ok(session) => { session }
            Err(error) => {
                error!("lifecycle - session creation failed: {}", error);
                return self.handle_attempt_failure(error);
            }
        };

        // every subsequent attempt is a reconnect and must not clean the session
        self.connected_previously = true;

        let channel_result = tokio::select! {
            result = (self.channel_factory)() => { result }
            _ = self.commands.recv() => {
                debug!("lifecycle - shutdown received while opening transport");
                session.close();
                return ControllerState::Halted;
            }
        };

        if self.core.disconnect_issued() {
            // a credentials fetch or socket open that completes after disconnect is abandoned
            session.close();
            return ControllerState::Halted;
        }

        match channel_result {
            Ok(channel) => {
                self.core.publish_session(self.generation, session.clone());
                if let Err(error) = session.connect_to_streams(channel.input, channel.output) {
                    warn!("lifecycle - session failed to attach to transport streams: {}", error);
                    self.core.retire_session(self.generation);
                    session.close();
                    return self.handle_attempt_failure(error);
                }

                ControllerState::Running
            }
            Err(error) => {
                session.close();
                self.handle_attempt_failure(error)
            }
        }
    }

    fn handle_attempt_failure(&mut self, error: IotError) -> ControllerState {
        match &error {
            IotError::CredentialsFetchFailure(_) => {
                // no status transition; retried quietly per the current backoff
                error!("lifecycle - credentials fetch failed: {}", error);
            }
            _ => {
                error!("lifecycle - connection attempt failed: {}", error);
                self.core.set_status_and_notify(ConnectionState::ConnectionError);
            }
        }

        ControllerState::WaitingToReconnect
    }

    async fn process_running(&mut self) -> ControllerState {
        // 1 Hz age counter; default catch-up ticking keeps the count honest if the loop
        // falls behind
        let mut age_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1));

        // keeps the loop live even when every other source is quiet
        let mut heartbeat_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS),
            Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS));
        heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut age_active = false;

        loop {
            tokio::select! {
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Some(next_state) = self.handle_session_event(event, &mut age_active, &mut age_interval) {
                                return next_state;
                            }
                        }
                        None => {
                            error!("lifecycle - session event channel closed unexpectedly");
                            return ControllerState::Halted;
                        }
                    }
                }
                _ = self.commands.recv() => {
                    debug!("lifecycle - shutdown received");
                    return ControllerState::Halted;
                }
                _ = age_interval.tick(), if age_active => {
                    if !self.core.tick_connection_age() {
                        age_active = false;
                    }
                }
                _ = heartbeat_interval.tick() => {
                    trace!("lifecycle - heartbeat");
                }
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent, age_active: &mut bool, age_interval: &mut tokio::time::Interval) -> Option<ControllerState> {
        debug!("lifecycle - session event: {}", event);

        match event {
            SessionEvent::Connected => {
                self.core.reset_connection_age();
                age_interval.reset();
                *age_active = true;

                self.core.set_status_and_notify(ConnectionState::Connected);

                if self.core.config.auto_resubscribe {
                    self.core.resubscribe_all();
                }

                None
            }
            SessionEvent::ConnectionRefused => {
                // surfaced without retry; the caller decides what a rejected connect means
                self.core.set_status_and_notify(ConnectionState::ConnectionRefused);
                None
            }
            SessionEvent::ConnectionClosed | SessionEvent::ConnectionError => {
                *age_active = false;
                self.core.reset_connection_age();

                if self.core.disconnect_issued() {
                    return Some(ControllerState::Halted);
                }

                self.core.set_status_and_notify(ConnectionState::ConnectionError);

                if let Some(session) = self.core.retire_session(self.generation) {
                    session.close();
                }

                Some(ControllerState::WaitingToReconnect)
            }
            SessionEvent::ProtocolError => {
                self.core.set_status_and_notify(ConnectionState::ProtocolError);
                self.core.disconnect();
                Some(ControllerState::Halted)
            }
            SessionEvent::Message { topic, payload } => {
                self.core.dispatch_inbound_message(topic, payload);
                None
            }
            SessionEvent::Ack { packet_id } => {
                self.core.dispatch_ack(packet_id);
                None
            }
        }
    }

    async fn process_waiting_to_reconnect(&mut self) -> ControllerState {
        if self.core.disconnect_issued() {
            return ControllerState::Halted;
        }

        let Some(delay) = self.core.arm_reconnect() else {
            return ControllerState::Running;
        };

        info!("lifecycle - next reconnect attempt in {:?}", delay);

        let reconnect_timer = sleep(delay);
        tokio::pin!(reconnect_timer);

        tokio::select! {
            () = &mut reconnect_timer => {
                self.core.disarm_reconnect();
                ControllerState::Connecting
            }
            _ = self.commands.recv() => {
                debug!("lifecycle - shutdown received while waiting to reconnect");
                self.core.disarm_reconnect();
                ControllerState::Halted
            }
        }
    }
}

async fn run_lifecycle_loop(core: Arc<ClientCore>, generation: u64, channel_factory: ChannelFactoryFn, commands: UnboundedReceiver<LoopCommand>) {
    let (event_sender, events) = unbounded_channel();

    let mut runtime = ControllerRuntime {
        core,
        generation,
        channel_factory,
        commands,
        event_sender,
        events,
        connected_previously: false,
    };

    let mut state = ControllerState::Connecting;
    while state != ControllerState::Halted {
        trace!("lifecycle - entering state {}", state);

        state = match state {
            ControllerState::Connecting => { runtime.process_connecting().await }
            ControllerState::Running => { runtime.process_running().await }
            ControllerState::WaitingToReconnect => { runtime.process_waiting_to_reconnect().await }
            ControllerState::Halted => { ControllerState::Halted }
        };
    }

    if let Some(session) = runtime.core.retire_session(generation) {
        session.close();
    }

    info!("lifecycle - event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::{ChannelFactoryReturn, DuplexByteChannel};

    use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
    use tokio::time::{advance, Duration as TokioDuration, Instant};

    struct MockSession {
        events: SessionEventSender,
        config: SessionConfig,
        closed: AtomicBool,
        next_packet_id: AtomicU16,
        subscribes: Mutex<Vec<(String, QualityOfService)>>,
        unsubscribes: Mutex<Vec<String>>,
        publishes: Mutex<Vec<(String, Vec<u8>, QualityOfService)>>,
    }

    impl MockSession {
        fn emit(&self, event: SessionEvent) {
            if !self.closed.load(Ordering::SeqCst) {
                self.events.send(event).ok();
            }
        }

        fn subscribed_filters(&self) -> Vec<(String, QualityOfService)> {
            self.subscribes.lock().unwrap().clone()
        }
    }

    impl MqttSession for MockSession {
        fn connect_to_streams(&self, _input: crate::session::SessionInputStream, _output: crate::session::SessionOutputStream) -> IotResult<()> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn disconnect(&self) {}

        fn publish_data(&self, payload: &[u8], topic: &str) -> IotResult<()> {
            self.publishes.lock().unwrap().push((topic.to_string(), payload.to_vec(), QualityOfService::AtMostOnce));
            Ok(())
        }

        fn publish_data_at_least_once(&self, payload: &[u8], topic: &str) -> IotResult<u16> {
            self.publishes.lock().unwrap().push((topic.to_string(), payload.to_vec(), QualityOfService::AtLeastOnce));
            Ok(self.next_packet_id.fetch_add(1, Ordering::SeqCst))
        }

        fn subscribe(&self, topic_filter: &str, qos: QualityOfService) -> IotResult<u16> {
            self.subscribes.lock().unwrap().push((topic_filter.to_string(), qos));
            Ok(self.next_packet_id.fetch_add(1, Ordering::SeqCst))
        }

        fn unsubscribe(&self, topic_filter: &str) -> IotResult<u16> {
            self.unsubscribes.lock().unwrap().push(topic_filter.to_string());
            Ok(self.next_packet_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct TestFixture {
        core: Arc<ClientCore>,
        sessions: Arc<Mutex<Vec<Arc<MockSession>>>>,
        statuses: Arc<Mutex<Vec<ConnectionState>>>,
        attempt_times: Arc<Mutex<Vec<Instant>>>,
    }

    impl TestFixture {
        fn new(config: ClientConfig) -> Self {
            let sessions : Arc<Mutex<Vec<Arc<MockSession>>>> = Arc::new(Mutex::new(Vec::new()));

            let factory_sessions = sessions.clone();
            let session_factory : SessionFactoryFn = Box::new(move |session_config, event_sender| {
                let session = Arc::new(MockSession {
                    events: event_sender,
                    config: session_config,
                    closed: AtomicBool::new(false),
                    next_packet_id: AtomicU16::new(1),
                    subscribes: Mutex::new(Vec::new()),
                    unsubscribes: Mutex::new(Vec::new()),
                    publishes: Mutex::new(Vec::new()),
                });

                factory_sessions.lock().unwrap().push(session.clone());
                Ok(session as Arc<dyn MqttSession>)
            });

            TestFixture {
                core: ClientCore::new(config, session_factory, Handle::current()),
                sessions,
                statuses: Arc::new(Mutex::new(Vec::new())),
                attempt_times: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn connect(&self) -> IotResult<()> {
            let attempt_times = self.attempt_times.clone();
            let channel_factory : ChannelFactoryFn = Box::new(move || {
                attempt_times.lock().unwrap().push(Instant::now());
                Box::pin(async move {
                    let (session_side, _bridge_side) = tokio::io::duplex(4096);
                    let (read_half, write_half) = tokio::io::split(session_side);
                    Ok(DuplexByteChannel {
                        input: Box::new(read_half),
                        output: Box::new(write_half),
                    })
                }) as ChannelFactoryReturn
            });

            let statuses = self.statuses.clone();
            let status_callback : StatusCallback = Arc::new(move |state| {
                statuses.lock().unwrap().push(state);
            });

            self.core.connect_with_factory(channel_factory, status_callback)
        }

        async fn wait_for_sessions(&self, count: usize) -> Arc<MockSession> {
            loop {
                {
                    let sessions = self.sessions.lock().unwrap();
                    if sessions.len() >= count {
                        return sessions[count - 1].clone();
                    }
                }
                tokio::time::sleep(TokioDuration::from_millis(1)).await;
            }
        }

        async fn settle(&self) {
            tokio::time::sleep(TokioDuration::from_millis(1)).await;
        }

        fn recorded_statuses(&self) -> Vec<ConnectionState> {
            self.statuses.lock().unwrap().clone()
        }

        fn attempt_deltas(&self) -> Vec<TokioDuration> {
            let times = self.attempt_times.lock().unwrap();
            times.windows(2).map(|pair| { pair[1] - pair[0] }).collect()
        }
    }

    fn test_config() -> ClientConfig {
        crate::config::ClientConfigBuilder::new("test-thing").build()
    }

    fn assert_delta_close(expected_seconds: u64, actual: TokioDuration) {
        let expected = TokioDuration::from_secs(expected_seconds);
        assert!(actual >= expected, "delay {:?} shorter than expected {:?}", actual, expected);
        assert!(actual < expected + TokioDuration::from_millis(500), "delay {:?} much longer than expected {:?}", actual, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_first_one_wins() {
        let fixture = TestFixture::new(test_config());

        assert!(fixture.connect().is_ok());
        assert!(matches!(fixture.connect(), Err(IotError::AlreadyConnecting)));

        fixture.core.disconnect();
        fixture.settle().await;

        assert!(fixture.connect().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_status_transitions() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        assert_eq!(ConnectionState::Connected, fixture.core.connection_state());
        assert_eq!(vec![ConnectionState::Connecting, ConnectionState::Connected], fixture.recorded_statuses());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_terminal() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        fixture.core.disconnect();
        fixture.core.disconnect();
        fixture.settle().await;

        assert_eq!(ConnectionState::Disconnected, fixture.core.connection_state());
        assert!(session.closed.load(Ordering::SeqCst));

        let disconnected_count = fixture.recorded_statuses().iter()
            .filter(|state| { **state == ConnectionState::Disconnected })
            .count();
        assert_eq!(1, disconnected_count);

        assert!(matches!(fixture.core.publish("a/b", b"x", QualityOfService::AtMostOnce, None), Err(IotError::AlreadyDisconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_connect_first() {
        let fixture = TestFixture::new(test_config());

        assert!(matches!(fixture.core.publish("a/b", b"x", QualityOfService::AtMostOnce, None), Err(IotError::NotConnected)));
        assert!(matches!(fixture.core.subscribe("a/b", QualityOfService::AtMostOnce, SubscriptionCallback::Simple(Arc::new(|_| {})), None), Err(IotError::NotConnected)));
        assert!(matches!(fixture.core.unsubscribe("a/b", None), Err(IotError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn qos0_publish_with_ack_callback_is_invalid() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();
        fixture.wait_for_sessions(1).await;

        let result = fixture.core.publish("a/b", b"x", QualityOfService::AtMostOnce, Some(Box::new(|| {})));
        assert!(matches!(result, Err(IotError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn qos1_publish_round_trip_fires_ack_once() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        let ack_count = Arc::new(Mutex::new(0u32));
        let counter = ack_count.clone();
        let packet_id = fixture.core.publish("a/b", b"hi", QualityOfService::AtLeastOnce, Some(Box::new(move || {
            *counter.lock().unwrap() += 1;
        }))).unwrap().unwrap();

        session.emit(SessionEvent::Ack { packet_id });
        session.emit(SessionEvent::Ack { packet_id });
        fixture.settle().await;

        assert_eq!(1, *ack_count.lock().unwrap());

        let publishes = session.publishes.lock().unwrap();
        assert_eq!(vec![("a/b".to_string(), b"hi".to_vec(), QualityOfService::AtLeastOnce)], *publishes);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_removes_registration() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        fixture.core.subscribe("a/b", QualityOfService::AtLeastOnce, SubscriptionCallback::Simple(Arc::new(move |payload| {
            sink.lock().unwrap().push(payload);
        })), None).unwrap();

        fixture.core.unsubscribe("a/b", None).unwrap();
        assert_eq!(vec!["a/b".to_string()], *session.unsubscribes.lock().unwrap());

        session.emit(SessionEvent::Message { topic: "a/b".to_string(), payload: b"late".to_vec() });
        fixture.settle().await;

        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_dispatch_to_matching_subscriptions() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        fixture.core.subscribe("sensors/+/temp", QualityOfService::AtLeastOnce, SubscriptionCallback::Simple(Arc::new(move |payload| {
            sink.lock().unwrap().push(payload);
        })), None).unwrap();

        session.emit(SessionEvent::Message { topic: "sensors/room1/temp".to_string(), payload: b"21.5".to_vec() });
        session.emit(SessionEvent::Message { topic: "sensors/room1".to_string(), payload: b"nope".to_vec() });
        session.emit(SessionEvent::Message { topic: "sensors/room1/temp/x".to_string(), payload: b"22.0".to_vec() });
        fixture.settle().await;

        let received = received.lock().unwrap();
        assert_eq!(2, received.len());
        assert_eq!(b"21.5".to_vec(), received[0]);
        assert_eq!(b"22.0".to_vec(), received[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_registered_filters() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let first_session = fixture.wait_for_sessions(1).await;
        first_session.emit(SessionEvent::Connected);
        fixture.settle().await;

        fixture.core.subscribe("a/b", QualityOfService::AtLeastOnce, SubscriptionCallback::Simple(Arc::new(|_| {})), None).unwrap();

        first_session.emit(SessionEvent::ConnectionError);
        fixture.settle().await;

        let second_session = fixture.wait_for_sessions(2).await;
        assert!(!second_session.config.clean_session);

        second_session.emit(SessionEvent::Connected);
        fixture.settle().await;

        assert_eq!(vec![("a/b".to_string(), QualityOfService::AtLeastOnce)], second_session.subscribed_filters());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_doubles_and_caps() {
        let config = crate::config::ClientConfigBuilder::new("test-thing")
            .with_base_reconnect_seconds(1.0)
            .with_maximum_reconnect_seconds(128.0)
            .build();

        let fixture = TestFixture::new(config);
        fixture.connect().unwrap();

        for attempt in 1..=3 {
            let session = fixture.wait_for_sessions(attempt).await;
            session.emit(SessionEvent::ConnectionError);
            fixture.settle().await;
        }
        fixture.wait_for_sessions(4).await;

        let deltas = fixture.attempt_deltas();
        assert_eq!(3, deltas.len());
        assert_delta_close(2, deltas[0]);
        assert_delta_close(4, deltas[1]);
        assert_delta_close(8, deltas[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stable_connection_restores_base_reconnect_time() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        // hold the connection up past the stability threshold
        advance(TokioDuration::from_secs(25)).await;
        fixture.settle().await;

        session.emit(SessionEvent::ConnectionError);
        fixture.settle().await;
        fixture.wait_for_sessions(2).await;

        let deltas = fixture.attempt_deltas();
        assert_eq!(1, deltas.len());
        // 25 seconds of connected time elapsed before the failure
        assert_delta_close(26, deltas[0]);

        // and a subsequent quick failure doubles from base again
        let second_session = fixture.wait_for_sessions(2).await;
        second_session.emit(SessionEvent::ConnectionError);
        fixture.settle().await;
        fixture.wait_for_sessions(3).await;

        let deltas = fixture.attempt_deltas();
        assert_delta_close(2, deltas[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_refused_does_not_retry() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::ConnectionRefused);
        fixture.settle().await;

        assert_eq!(ConnectionState::ConnectionRefused, fixture.core.connection_state());

        // no reconnect attempt may be scheduled off a refusal
        advance(TokioDuration::from_secs(300)).await;
        fixture.settle().await;
        assert_eq!(1, fixture.sessions.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_performs_full_disconnect() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        session.emit(SessionEvent::ProtocolError);
        fixture.settle().await;

        let statuses = fixture.recorded_statuses();
        assert!(statuses.contains(&ConnectionState::ProtocolError));
        assert_eq!(ConnectionState::Disconnected, fixture.core.connection_state());

        // no reconnect may follow a protocol error
        advance(TokioDuration::from_secs(300)).await;
        fixture.settle().await;
        assert_eq!(1, fixture.sessions.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn user_disconnect_suppresses_reconnect() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        session.emit(SessionEvent::Connected);
        fixture.settle().await;

        fixture.core.disconnect();
        fixture.settle().await;

        advance(TokioDuration::from_secs(300)).await;
        fixture.settle().await;
        assert_eq!(1, fixture.sessions.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_username_reflects_configuration() {
        let fixture = TestFixture::new(test_config());
        fixture.connect().unwrap();

        let session = fixture.wait_for_sessions(1).await;
        assert!(session.config.username.starts_with("?SDK=Rust&Version="));

        let quiet_config = crate::config::ClientConfigBuilder::new("test-thing")
            .with_metrics_enabled(false)
            .build();
        let quiet_fixture = TestFixture::new(quiet_config);
        quiet_fixture.connect().unwrap();

        let quiet_session = quiet_fixture.wait_for_sessions(1).await;
        assert!(quiet_session.config.username.is_empty());
    }

    #[test]
    fn reconnect_tracker_backoff_progression() {
        let config = test_config();
        let mut tracker = ReconnectTracker::new(&config);

        assert_eq!(Duration::from_secs(2), tracker.next_delay());
        assert_eq!(Duration::from_secs(4), tracker.next_delay());
        assert_eq!(Duration::from_secs(8), tracker.next_delay());
    }

    #[test]
    fn reconnect_tracker_caps_at_maximum() {
        let config = crate::config::ClientConfigBuilder::new("test-thing")
            .with_base_reconnect_seconds(1.0)
            .with_maximum_reconnect_seconds(128.0)
            .build();
        let mut tracker = ReconnectTracker::new(&config);

        let mut last = Duration::default();
        for _ in 0..10 {
            last = tracker.next_delay();
        }

        assert_eq!(Duration::from_secs(128), last);
    }

    #[test]
    fn reconnect_tracker_stability_restores_base() {
        let config = test_config();
        let mut tracker = ReconnectTracker::new(&config);

        // back off a few times, then hold a connection up past the threshold
        tracker.next_delay();
        tracker.next_delay();

        tracker.reset_connection_age();
        for _ in 0..19 {
            assert!(tracker.tick_connection_age());
        }
        assert!(!tracker.tick_connection_age());

        assert_eq!(Duration::from_secs(1), tracker.next_delay());
        assert_eq!(Duration::from_secs(2), tracker.next_delay());
    }

    #[test]
    fn reconnect_tracker_arm_guard_rejects_double_arming() {
        let config = test_config();
        let mut tracker = ReconnectTracker::new(&config);

        assert!(tracker.arm().is_some());
        assert!(tracker.arm().is_none());

        tracker.disarm();
        assert!(tracker.arm().is_some());
    }
}
