//! Client connection manager.
//!
//! A single background task owns the [`Session`] and the current link. The
//! public handle talks to it over a command channel, so the session counters
//! have exactly one writer. The task handles:
//!
//! - The `hello` resume handshake on every fresh link
//! - Reconnection with exponential backoff, rebinding the same session
//! - Queueing or failing publishes while not connected
//! - Dispatching inbound relay frames to listeners after `observe_incoming`

use crate::backoff::ExponentialBackoff;
use crate::config::{ClientConfig, PublishPolicy};
use mms::codec::{self, BroadcastMessage};
use mms::error::{ErrorCode, MmsError, Result};
use mms::protocol::{ClientMessage, PositionTime, PublishEnvelope, RelayEnvelope, ServerMessage};
use mms::session::{Session, SessionId};
use mms::transport::{Dialer, Link};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Far enough in the future to mean "no deadline"
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle. Resumable with `connect()`.
    Disconnected,
    /// First attempt cycle after `connect()`
    Connecting,
    Connected,
    /// Link lost, retrying with backoff
    Reconnecting,
    /// Terminal
    Closed,
}

/// Wire header of a received broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastHeader {
    /// Relay id assigned for this client
    pub id: u64,
    /// Sender's own sequence number
    pub message_id: u64,
    pub sender_id: SessionId,
    pub channel: String,
    pub position_time: Option<PositionTime>,
}

/// A broadcast as handed to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub header: BroadcastHeader,
    pub payload: Vec<u8>,
}

impl From<RelayEnvelope> for Broadcast {
    fn from(envelope: RelayEnvelope) -> Self {
        Self {
            header: BroadcastHeader {
                id: envelope.id,
                message_id: envelope.message_id,
                sender_id: envelope.sender_id,
                channel: envelope.channel,
                position_time: envelope.position_time,
            },
            payload: envelope.payload,
        }
    }
}

/// A broadcast decoded into its message type
#[derive(Debug, Clone, PartialEq)]
pub struct TypedBroadcast<M> {
    pub header: BroadcastHeader,
    pub message: M,
}

/// Sequence numbers stamped on a publish that reached the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: u64,
    pub latest_received_id: u64,
}

/// Diagnostic view of the session counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// None until the relay has assigned a session
    pub session_id: Option<SessionId>,
    pub outgoing_seq: u64,
    pub current_ack: u64,
}

struct PublishRequest {
    channel: String,
    payload: Vec<u8>,
    position_time: Option<PositionTime>,
    reply: oneshot::Sender<Result<PublishReceipt>>,
}

struct QueuedPublish {
    request: PublishRequest,
    deadline: Instant,
}

/// Commands sent from the public API to the background connection task.
enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Publish(PublishRequest),
    Subscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        channel: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of the broadcast protocol.
///
/// Must be created inside a tokio runtime; the connection task is spawned
/// immediately and waits for [`ConnectionManager::connect`].
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    broadcasts: broadcast::Sender<Broadcast>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (broadcasts, _) = broadcast::channel(config.listener_capacity.max(1));

        let worker = Worker {
            backoff: ExponentialBackoff::new(config.backoff.clone()),
            config,
            dialer,
            session: Session::new(SessionId::generate()),
            bound: false,
            relay_subscriptions: BTreeSet::new(),
            queue: VecDeque::new(),
            waiters: Vec::new(),
            commands: commands_rx,
            state: state_tx,
            broadcasts: broadcasts.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            broadcasts,
            task,
        }
    }

    /// Run one attempt cycle. Ok once connected; `NotConnected` when the
    /// configured attempts are exhausted (the task then rests in
    /// `Disconnected` and keeps the session for a later `connect()`).
    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Publish `payload` on `channel`.
    ///
    /// Resolves once the envelope is handed to the transport. While not
    /// connected the configured [`PublishPolicy`] decides between failing
    /// with `NotConnected` and queueing.
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        payload: Vec<u8>,
        position_time: Option<PositionTime>,
    ) -> Result<PublishReceipt> {
        let channel = channel.into();
        self.request(|reply| {
            Command::Publish(PublishRequest {
                channel,
                payload,
                position_time,
                reply,
            })
        })
        .await?
    }

    /// Encode and publish a typed message on its canonical channel.
    pub async fn broadcast<M: BroadcastMessage>(&self, message: &M) -> Result<PublishReceipt> {
        let payload = codec::encode(message)?;
        self.publish(M::CHANNEL, payload, None).await
    }

    /// Like [`ConnectionManager::broadcast`] with the sender's position attached.
    pub async fn broadcast_at<M: BroadcastMessage>(
        &self,
        message: &M,
        position_time: PositionTime,
    ) -> Result<PublishReceipt> {
        let payload = codec::encode(message)?;
        self.publish(M::CHANNEL, payload, Some(position_time)).await
    }

    /// Subscribe to `channel`. Remembered across reconnects.
    pub async fn subscribe(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        self.request(|reply| Command::Subscribe { channel, reply })
            .await?
    }

    pub async fn unsubscribe(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        self.request(|reply| Command::Unsubscribe { channel, reply })
            .await?
    }

    /// Every broadcast dispatched from now on.
    ///
    /// A listener that falls more than `listener_capacity` behind skips
    /// the overflow (logged).
    pub fn listen(&self) -> impl Stream<Item = Broadcast> + Send + Unpin + 'static {
        BroadcastStream::new(self.broadcasts.subscribe()).filter_map(|result| match result {
            Ok(broadcast) => Some(broadcast),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Listener lagged, skipped broadcasts");
                None
            }
        })
    }

    /// Broadcasts on `M::CHANNEL`, decoded. Undecodable payloads are logged and skipped.
    pub fn listen_typed<M: BroadcastMessage>(
        &self,
    ) -> impl Stream<Item = TypedBroadcast<M>> + Send + Unpin + 'static {
        self.listen().filter_map(|broadcast| {
            if broadcast.header.channel != M::CHANNEL {
                return None;
            }
            match codec::decode::<M>(&broadcast.payload) {
                Ok(message) => Some(TypedBroadcast {
                    header: broadcast.header,
                    message,
                }),
                Err(e) => {
                    warn!(
                        channel = M::CHANNEL,
                        id = broadcast.header.id,
                        error = %e,
                        "Failed to decode broadcast"
                    );
                    None
                }
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(MmsError::NotConnected)
        }
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.status().await.ok().and_then(|s| s.session_id)
    }

    /// Cumulative ack the next publish will carry
    pub async fn current_ack(&self) -> Result<u64> {
        Ok(self.status().await?.current_ack)
    }

    /// Log out if connected and stop for good. Later calls fail with `NotConnected`.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| MmsError::NotConnected)?;
        response.await.map_err(|_| MmsError::NotConnected)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// How an attempt cycle ended
enum Established {
    Linked(Link),
    Exhausted,
    Closed,
}

/// How a live link ended
enum LinkEnd {
    Dropped,
    Closed,
}

/// Background task state. Sole owner of the session.
struct Worker {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    backoff: ExponentialBackoff,
    session: Session,
    /// Whether the relay has assigned `session` (false: next hello asks for a new one)
    bound: bool,
    /// Channels the relay may hold for `session`. Reconciled after every handshake.
    relay_subscriptions: BTreeSet<String>,
    queue: VecDeque<QueuedPublish>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    broadcasts: broadcast::Sender<Broadcast>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            // Disconnected: wait for connect()
            loop {
                match self.commands.recv().await {
                    None => return,
                    Some(Command::Connect { reply }) => {
                        self.waiters.push(reply);
                        break;
                    }
                    Some(command) => {
                        if !self.handle_offline(command) {
                            return;
                        }
                    }
                }
            }

            let mut state = ConnectionState::Connecting;
            loop {
                match self.establish(state).await {
                    Established::Linked(link) => match self.run_linked(link).await {
                        LinkEnd::Dropped => state = ConnectionState::Reconnecting,
                        LinkEnd::Closed => return,
                    },
                    Established::Exhausted => {
                        warn!(
                            attempts = self.backoff.failures(),
                            "Reconnect attempts exhausted"
                        );
                        self.backoff.reset();
                        self.set_state(ConnectionState::Disconnected);
                        self.fail_queue();
                        for waiter in self.waiters.drain(..) {
                            let _ = waiter.send(Err(MmsError::NotConnected));
                        }
                        break;
                    }
                    Established::Closed => return,
                }
            }
        }
    }

    /// Dial until a handshake succeeds, attempts run out or the client closes.
    ///
    /// Commands keep being served while a dial is in flight and while
    /// waiting out the backoff delay.
    async fn establish(&mut self, state: ConnectionState) -> Established {
        self.set_state(state);
        loop {
            let attempt = dial_and_handshake(
                Arc::clone(&self.dialer),
                self.hello(),
                self.config.handshake_timeout(),
            );
            tokio::pin!(attempt);
            let result = loop {
                let expiry = tokio::time::sleep_until(self.next_deadline());
                tokio::select! {
                    biased;
                    command = self.commands.recv() => match command {
                        None => return Established::Closed,
                        Some(command) => {
                            if !self.handle_offline(command) {
                                return Established::Closed;
                            }
                        }
                    },
                    _ = expiry => self.expire_queue(),
                    result = &mut attempt => break result,
                }
            };

            let error = match result.and_then(|handshake| self.bind(handshake)) {
                Ok(link) => {
                    self.backoff.reset();
                    return Established::Linked(link);
                }
                Err(e) => e,
            };

            let Some(delay) = self.backoff.next_delay() else {
                return Established::Exhausted;
            };
            self.set_state(ConnectionState::Reconnecting);
            info!(
                error = %error,
                delay_ms = delay.as_millis() as u64,
                attempt = self.backoff.failures(),
                "Connect failed, retrying"
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                let expiry = tokio::time::sleep_until(self.next_deadline());
                tokio::select! {
                    biased;
                    command = self.commands.recv() => match command {
                        None => return Established::Closed,
                        Some(command) => {
                            if !self.handle_offline(command) {
                                return Established::Closed;
                            }
                        }
                    },
                    _ = expiry => self.expire_queue(),
                    _ = &mut sleep => break,
                }
            }
        }
    }

    fn hello(&self) -> ClientMessage {
        ClientMessage::Hello {
            session_id: self.bound.then(|| self.session.id().clone()),
            latest_received_id: self.session.current_ack(),
        }
    }

    /// Adopt the relay's answer to `hello` and bring its subscriptions in
    /// line with the session's.
    fn bind(&mut self, handshake: Handshake) -> Result<Link> {
        let Handshake {
            link,
            session_id,
            resumed,
            redelivered,
        } = handshake;

        if resumed && self.bound && &session_id == self.session.id() {
            info!(
                session_id = %session_id,
                latest_received_id = self.session.current_ack(),
                redelivered = redelivered,
                "Session resumed"
            );
        } else {
            if self.bound {
                warn!(
                    old_session_id = %self.session.id(),
                    session_id = %session_id,
                    "Session not resumed, counters reset"
                );
            } else {
                info!(session_id = %session_id, "Session opened");
            }
            self.session = self.session.renewed(session_id);
            self.bound = true;
            self.relay_subscriptions.clear();
        }

        // Changes made while offline; both frames are idempotent on the relay
        let wanted: BTreeSet<String> = self.session.subscriptions().map(str::to_string).collect();
        for channel in self.relay_subscriptions.difference(&wanted) {
            send(
                &link,
                ClientMessage::Unsubscribe {
                    channel: channel.clone(),
                },
            )?;
        }
        for channel in &wanted {
            send(
                &link,
                ClientMessage::Subscribe {
                    channel: channel.clone(),
                },
            )?;
        }
        self.relay_subscriptions = wanted;
        Ok(link)
    }

    async fn run_linked(&mut self, mut link: Link) -> LinkEnd {
        self.set_state(ConnectionState::Connected);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if !self.flush_queue(&link) {
            return LinkEnd::Dropped;
        }

        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(ServerMessage::Relay(envelope)) => self.dispatch(envelope),
                    Some(ServerMessage::Error { code, message }) => {
                        warn!(code = ?code, message = %message, "Relay reported error");
                        if code == ErrorCode::UnauthenticatedSession {
                            // Session gone on the relay; ask for a new one
                            self.bound = false;
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(ServerMessage::Connected { .. }) => {
                        warn!("Unexpected connected frame on a live link");
                    }
                    None => {
                        info!(session_id = %self.session.id(), "Link dropped");
                        return LinkEnd::Dropped;
                    }
                },

                command = self.commands.recv() => match command {
                    None => return LinkEnd::Closed,
                    Some(Command::Publish(request)) => {
                        if link.outbound.is_closed() {
                            self.enqueue(request);
                            return LinkEnd::Dropped;
                        }
                        if let Err(request) = self.send_publish(&link, request) {
                            self.enqueue(request);
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(Command::Subscribe { channel, reply }) => {
                        self.session.subscribe(&channel);
                        self.relay_subscriptions.insert(channel.clone());
                        let _ = reply.send(Ok(()));
                        // A lost frame is re-sent by the next handshake
                        if send(&link, ClientMessage::Subscribe { channel }).is_err() {
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(Command::Unsubscribe { channel, reply }) => {
                        // Stays in relay_subscriptions until a handshake confirms the removal
                        self.session.unsubscribe(&channel);
                        let _ = reply.send(Ok(()));
                        if send(&link, ClientMessage::Unsubscribe { channel }).is_err() {
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(Command::Connect { reply }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Close { reply }) => {
                        let _ = send(&link, ClientMessage::Logout);
                        info!(session_id = %self.session.id(), "Logged out");
                        self.finish();
                        let _ = reply.send(());
                        return LinkEnd::Closed;
                    }
                },
            }
        }
    }

    /// Commands while not connected. Returns `false` once the client closed.
    fn handle_offline(&mut self, command: Command) -> bool {
        match command {
            Command::Publish(request) => self.enqueue(request),
            Command::Subscribe { channel, reply } => {
                self.session.subscribe(&channel);
                let _ = reply.send(Ok(()));
            }
            Command::Unsubscribe { channel, reply } => {
                self.session.unsubscribe(&channel);
                let _ = reply.send(Ok(()));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Connect { reply } => self.waiters.push(reply),
            Command::Close { reply } => {
                self.finish();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Queue a publish per policy, or fail it with `NotConnected`.
    fn enqueue(&mut self, request: PublishRequest) {
        let reconnecting = matches!(
            *self.state.borrow(),
            ConnectionState::Connecting | ConnectionState::Reconnecting | ConnectionState::Connected
        );
        match self.config.publish {
            PublishPolicy::Queue { capacity, wait_ms } if reconnecting && self.queue.len() < capacity => {
                debug!(channel = %request.channel, queued = self.queue.len() + 1, "Publish queued");
                self.queue.push_back(QueuedPublish {
                    request,
                    deadline: Instant::now() + Duration::from_millis(wait_ms),
                });
            }
            PublishPolicy::Queue { .. } if reconnecting => {
                warn!(channel = %request.channel, "Publish queue full");
                let _ = request.reply.send(Err(MmsError::NotConnected));
            }
            _ => {
                let _ = request.reply.send(Err(MmsError::NotConnected));
            }
        }
    }

    /// Stamp and send everything queued, oldest first. Ids are assigned here
    /// so they stay gapless. Returns `false` if the link died.
    fn flush_queue(&mut self, link: &Link) -> bool {
        self.expire_queue();
        while let Some(queued) = self.queue.pop_front() {
            if link.outbound.is_closed() {
                self.queue.push_front(queued);
                return false;
            }
            if let Err(request) = self.send_publish(link, queued.request) {
                self.queue.push_front(QueuedPublish {
                    request,
                    deadline: queued.deadline,
                });
                return false;
            }
        }
        true
    }

    /// Stamp the next message id and current ack and hand the envelope to the link.
    /// Gives the request back if the link refused it.
    fn send_publish(&mut self, link: &Link, request: PublishRequest) -> std::result::Result<(), PublishRequest> {
        // Committed only once the link took the envelope, so a refused send leaves no gap
        let message_id = self.session.outgoing_seq() + 1;
        let latest_received_id = self.session.current_ack();
        let envelope = PublishEnvelope {
            message_id,
            latest_received_id,
            channel: request.channel.clone(),
            payload: request.payload.clone(),
            position_time: request.position_time,
        };

        if link.outbound.send(ClientMessage::Publish(envelope)).is_err() {
            return Err(request);
        }
        self.session.next_outgoing_id();
        debug!(
            channel = %request.channel,
            message_id = message_id,
            latest_received_id = latest_received_id,
            "Published"
        );
        let _ = request.reply.send(Ok(PublishReceipt {
            message_id,
            latest_received_id,
        }));
        Ok(())
    }

    fn dispatch(&mut self, envelope: RelayEnvelope) {
        if !self.session.observe_incoming(envelope.id) {
            debug!(id = envelope.id, ack = self.session.current_ack(), "Duplicate relay frame suppressed");
            return;
        }
        // No listener is fine
        let _ = self.broadcasts.send(Broadcast::from(envelope));
    }

    fn next_deadline(&self) -> Instant {
        self.queue
            .front()
            .map(|queued| queued.deadline)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }

    fn expire_queue(&mut self) {
        let now = Instant::now();
        while self.queue.front().is_some_and(|queued| queued.deadline <= now) {
            if let Some(queued) = self.queue.pop_front() {
                warn!(channel = %queued.request.channel, "Queued publish expired");
                let _ = queued.request.reply.send(Err(MmsError::NotConnected));
            }
        }
    }

    fn fail_queue(&mut self) {
        for queued in self.queue.drain(..) {
            let _ = queued.request.reply.send(Err(MmsError::NotConnected));
        }
    }

    /// Enter the terminal state
    fn finish(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.fail_queue();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(MmsError::NotConnected));
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.bound.then(|| self.session.id().clone()),
            outgoing_seq: self.session.outgoing_seq(),
            current_ack: self.session.current_ack(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "Connection state");
                *current = state;
                true
            }
        });
    }
}

/// Relay's answer to `hello` on a fresh link
struct Handshake {
    link: Link,
    session_id: SessionId,
    resumed: bool,
    redelivered: u64,
}

async fn dial_and_handshake(
    dialer: Arc<dyn Dialer>,
    hello: ClientMessage,
    timeout: Duration,
) -> Result<Handshake> {
    let mut link = tokio::time::timeout(timeout, dialer.dial())
        .await
        .map_err(|_| MmsError::TransportFailure("dial timed out".to_string()))??;
    send(&link, hello)?;

    let frame = tokio::time::timeout(timeout, link.inbound.recv())
        .await
        .map_err(|_| MmsError::TransportFailure("handshake timed out".to_string()))?
        .ok_or_else(|| MmsError::TransportFailure("link closed during handshake".to_string()))?;

    match frame {
        ServerMessage::Connected {
            session_id,
            resumed,
            redelivered,
        } => Ok(Handshake {
            link,
            session_id,
            resumed,
            redelivered,
        }),
        ServerMessage::Error { code, message } => Err(MmsError::Protocol(format!(
            "handshake rejected ({:?}): {}",
            code, message
        ))),
        ServerMessage::Relay(envelope) => Err(MmsError::Protocol(format!(
            "relay frame {} before connected",
            envelope.id
        ))),
    }
}

fn send(link: &Link, message: ClientMessage) -> Result<()> {
    link.outbound
        .send(message)
        .map_err(|_| MmsError::TransportFailure("link closed".to_string()))
}
