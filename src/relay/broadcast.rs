use crate::config::{BackpressurePolicy, RelayPolicy, SharedRelayPolicy};
use crate::error::{BackpressureExceeded, MmsError, Result};
use crate::protocol::{PublishEnvelope, RelayEnvelope, ServerMessage};
use crate::relay::ack::{AckBounds, AckTracker, AckUpdate};
use crate::relay::events::{CloseReason, RelayEvent};
use crate::relay::metrics::RelayMetrics;
use crate::relay::registry::SubscriptionRegistry;
use crate::session::{Session, SessionId};
use crate::transport::Outbound;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A connection bound to a session for live delivery
struct AttachedLink {
    generation: u64,
    outbound: Outbound,
}

/// Relay-side state of one client session.
pub(super) struct Recipient {
    /// `outgoing_seq` numbers relay ids for this recipient;
    /// `highest_seen` tracks the client's own publish ids.
    session: Session,
    tracker: AckTracker,
    link: Option<AttachedLink>,
    generations: u64,
    detached_at: Option<Instant>,
    /// Set while the record is over its bound; backpressure is reported on the transition only
    over_bound: bool,
    closed: bool,
}

impl Recipient {
    fn new(id: SessionId) -> Self {
        Self {
            tracker: AckTracker::new(id.clone()),
            session: Session::new(id),
            link: None,
            generations: 0,
            detached_at: None,
            over_bound: false,
            closed: false,
        }
    }

    fn attach(&mut self, outbound: Outbound) -> u64 {
        if let Some(previous) = self.link.take() {
            previous.outbound.close();
        }
        self.generations += 1;
        self.link = Some(AttachedLink {
            generation: self.generations,
            outbound,
        });
        self.detached_at = None;
        self.generations
    }

    fn detach(&mut self, now: Instant) {
        self.link = None;
        self.detached_at = Some(now);
    }

    fn check_bounds(&mut self, bounds: AckBounds, now: Instant) -> Option<BackpressureExceeded> {
        match self.tracker.check_bounds(bounds, now) {
            Ok(()) => {
                self.over_bound = false;
                None
            }
            Err(_) if self.over_bound => None,
            Err(report) => {
                self.over_bound = true;
                Some(report)
            }
        }
    }
}

/// Outcome of binding a transport to a session (the `hello` handshake)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub session_id: SessionId,
    pub resumed: bool,
    /// Tags the transport so a stale close cannot detach a newer one
    pub generation: u64,
    pub redelivered: u64,
}

/// Fan-out result of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Subscribers that were assigned a relay id
    pub recipients: usize,
    /// Of those, handed to a live transport
    pub live: usize,
    /// Of those, buffered for a detached recipient
    pub buffered: usize,
}

/// What the periodic sweep found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<SessionId>,
    pub backpressured: Vec<SessionId>,
}

enum Delivery {
    Live,
    Buffered,
    Skipped,
}

/// Server-side broadcast relay.
///
/// Fans publishes out to subscribed sessions, numbers every delivery per
/// recipient, keeps undelivered envelopes until the recipient's cumulative
/// ack covers them and replays them when the recipient resumes.
///
/// Each recipient sits behind its own mutex; a publish only ever holds one
/// recipient lock at a time, so a slow or detached subscriber never blocks
/// delivery to the others.
pub struct BroadcastRelay {
    recipients: DashMap<SessionId, Arc<Mutex<Recipient>>>,
    registry: SubscriptionRegistry,
    policy: SharedRelayPolicy,
    session_grace: Duration,
    metrics: RelayMetrics,
    events_tx: broadcast::Sender<RelayEvent>,
}

fn lock(recipient: &Mutex<Recipient>) -> MutexGuard<'_, Recipient> {
    recipient.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BroadcastRelay {
    pub fn new(policy: SharedRelayPolicy, session_grace: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(1000);
        Self {
            recipients: DashMap::new(),
            registry: SubscriptionRegistry::new(),
            policy,
            session_grace,
            metrics: RelayMetrics::new(),
            events_tx,
        }
    }

    /// Bind a fresh transport to a session.
    ///
    /// Resuming a known session prunes its record with `latest_received_id`,
    /// answers `connected`, replays every pending envelope above the ack in
    /// ascending order and only then enables live fan-out. All of that happens
    /// under the recipient lock, so no live delivery can overtake the replay.
    /// Unknown or absent ids open a new session.
    pub fn open_session(
        &self,
        requested: Option<&SessionId>,
        latest_received_id: u64,
        outbound: Outbound,
    ) -> Attachment {
        if let Some(id) = requested {
            if let Some(recipient) = self.recipient(id) {
                let mut guard = lock(&recipient);
                if !guard.closed {
                    return self.resume(&mut guard, latest_received_id, outbound);
                }
            }
            info!(session_id = %id, "Unknown session on resume, opening a new one");
        }

        let session_id = SessionId::generate();
        let mut recipient = Recipient::new(session_id.clone());
        let generation = recipient.attach(outbound.clone());
        outbound.send(ServerMessage::Connected {
            session_id: session_id.clone(),
            resumed: false,
            redelivered: 0,
        });
        self.recipients
            .insert(session_id.clone(), Arc::new(Mutex::new(recipient)));

        self.metrics.record_session_opened();
        info!(session_id = %session_id, "Session opened");
        self.emit(RelayEvent::SessionOpened {
            session_id: session_id.clone(),
            timestamp: Utc::now(),
        });

        Attachment {
            session_id,
            resumed: false,
            generation,
            redelivered: 0,
        }
    }

    fn resume(
        &self,
        recipient: &mut Recipient,
        latest_received_id: u64,
        outbound: Outbound,
    ) -> Attachment {
        let session_id = recipient.session.id().clone();
        self.apply_ack(recipient, latest_received_id);
        self.report_ack_gap(recipient);

        let replay: Vec<RelayEnvelope> = recipient
            .tracker
            .pending_after(latest_received_id)
            .cloned()
            .collect();
        let redelivered = replay.len() as u64;

        outbound.send(ServerMessage::Connected {
            session_id: session_id.clone(),
            resumed: true,
            redelivered,
        });
        for envelope in replay {
            outbound.send(ServerMessage::Relay(envelope));
        }
        let generation = recipient.attach(outbound);

        self.metrics.record_session_resumed();
        self.metrics.record_redelivered(redelivered);
        info!(
            session_id = %session_id,
            latest_received_id = latest_received_id,
            redelivered = redelivered,
            "Session resumed"
        );
        self.emit(RelayEvent::SessionResumed {
            session_id: session_id.clone(),
            redelivered,
            timestamp: Utc::now(),
        });

        Attachment {
            session_id,
            resumed: true,
            generation,
            redelivered,
        }
    }

    /// Fan a publish out to every subscriber of its channel.
    ///
    /// The envelope's `latest_received_id` is first consumed as the sender's
    /// cumulative ack. An unknown channel is a no-op; an unknown sender is
    /// rejected with `UnauthenticatedSession`.
    pub fn publish(&self, sender: &SessionId, envelope: PublishEnvelope) -> Result<PublishOutcome> {
        let Some(sender_state) = self.recipient(sender) else {
            self.metrics.record_publish_rejected();
            return Err(MmsError::UnauthenticatedSession(Some(sender.clone())));
        };

        {
            let mut guard = lock(&sender_state);
            if guard.closed {
                self.metrics.record_publish_rejected();
                return Err(MmsError::UnauthenticatedSession(Some(sender.clone())));
            }
            self.apply_ack(&mut guard, envelope.latest_received_id);

            let expected = guard.session.current_ack() + 1;
            if !guard.session.observe_incoming(envelope.message_id)
                || envelope.message_id != expected
            {
                self.metrics.record_sender_gap();
                warn!(
                    session_id = %sender,
                    message_id = envelope.message_id,
                    expected = expected,
                    "Publish out of sequence"
                );
            }
        }
        self.metrics.record_publish_accepted();

        let policy = self.policy_snapshot();
        let now = Instant::now();
        let mut outcome = PublishOutcome::default();
        let mut exceeded = Vec::new();

        for subscriber in self.registry.subscribers_of(&envelope.channel) {
            if &subscriber == sender && !policy.self_delivery {
                continue;
            }
            match self.deliver(&subscriber, sender, &envelope, &policy, now, &mut exceeded) {
                Delivery::Live => outcome.live += 1,
                Delivery::Buffered => outcome.buffered += 1,
                Delivery::Skipped => continue,
            }
            outcome.recipients += 1;
        }

        for report in exceeded {
            self.handle_backpressure(report, policy.backpressure_policy);
        }

        debug!(
            session_id = %sender,
            channel = %envelope.channel,
            message_id = envelope.message_id,
            recipients = outcome.recipients,
            "Broadcast relayed"
        );
        Ok(outcome)
    }

    /// One independent unit of fan-out work: assign the next id for this
    /// recipient, record it, and hand it to the live transport if any.
    fn deliver(
        &self,
        recipient_id: &SessionId,
        sender: &SessionId,
        publish: &PublishEnvelope,
        policy: &RelayPolicy,
        now: Instant,
        exceeded: &mut Vec<BackpressureExceeded>,
    ) -> Delivery {
        let Some(recipient) = self.recipient(recipient_id) else {
            return Delivery::Skipped;
        };
        let mut guard = lock(&recipient);
        if guard.closed {
            return Delivery::Skipped;
        }

        let id = guard.session.next_outgoing_id();
        let envelope = RelayEnvelope::from_publish(id, sender, publish);
        guard.tracker.track(envelope.clone(), now);

        let sent = guard
            .link
            .as_ref()
            .map(|link| link.outbound.send(ServerMessage::Relay(envelope)));
        let delivery = match sent {
            Some(true) => {
                self.metrics.record_delivered_live();
                Delivery::Live
            }
            Some(false) => {
                debug!(session_id = %recipient_id, "Transport gone, buffering");
                guard.detach(now);
                self.metrics.record_buffered_offline();
                Delivery::Buffered
            }
            None => {
                self.metrics.record_buffered_offline();
                Delivery::Buffered
            }
        };

        if let Some(report) = guard.check_bounds(AckBounds::from(policy), now) {
            exceeded.push(report);
        }
        delivery
    }

    /// Consume a cumulative ack for `recipient` outside of a publish.
    pub fn on_ack_received(&self, recipient: &SessionId, latest_received_id: u64) -> Result<AckUpdate> {
        let state = self
            .recipient(recipient)
            .ok_or_else(|| MmsError::UnauthenticatedSession(Some(recipient.clone())))?;
        let mut guard = lock(&state);
        Ok(self.apply_ack(&mut guard, latest_received_id))
    }

    fn apply_ack(&self, recipient: &mut Recipient, latest_received_id: u64) -> AckUpdate {
        let update = recipient.tracker.on_ack_received(latest_received_id);
        self.metrics.record_pruned(update.pruned as u64);
        if update.clamped {
            self.metrics.record_ack_gap();
            warn!(
                session_id = %recipient.session.id(),
                latest_received_id = latest_received_id,
                highest_assigned = recipient.tracker.highest_assigned(),
                "Ack beyond highest assigned relay id, clamped"
            );
        }
        update
    }

    fn report_ack_gap(&self, recipient: &Recipient) {
        if let Some(missing) = recipient.tracker.missing_after_ack() {
            self.metrics.record_ack_gap();
            warn!(
                session_id = %recipient.session.id(),
                first_missing = *missing.start(),
                last_missing = *missing.end(),
                "Recipient resumed past a dropped backlog"
            );
            self.emit(RelayEvent::AckGap {
                session_id: recipient.session.id().clone(),
                first_missing: *missing.start(),
                last_missing: *missing.end(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn subscribe(&self, session: &SessionId, channel: &str) -> Result<bool> {
        let state = self
            .recipient(session)
            .ok_or_else(|| MmsError::UnauthenticatedSession(Some(session.clone())))?;
        self.subscribe_recipient(&state, session, channel)
    }

    /// Registry changes happen under the recipient lock so they cannot
    /// interleave with `close_session` and leave an orphaned entry.
    pub(super) fn subscribe_recipient(
        &self,
        state: &Mutex<Recipient>,
        session: &SessionId,
        channel: &str,
    ) -> Result<bool> {
        let guard = lock(state);
        if guard.closed {
            return Err(MmsError::UnauthenticatedSession(Some(session.clone())));
        }
        let added = self.registry.subscribe(session, channel);
        drop(guard);
        if added {
            info!(session_id = %session, channel = %channel, "Subscribed");
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, session: &SessionId, channel: &str) -> Result<bool> {
        let state = self
            .recipient(session)
            .ok_or_else(|| MmsError::UnauthenticatedSession(Some(session.clone())))?;
        let guard = lock(&state);
        if guard.closed {
            return Err(MmsError::UnauthenticatedSession(Some(session.clone())));
        }
        let removed = self.registry.unsubscribe(session, channel);
        drop(guard);
        if removed {
            info!(session_id = %session, channel = %channel, "Unsubscribed");
        }
        Ok(removed)
    }

    /// The transport tagged `generation` went away. The session stays for resume.
    pub fn detach(&self, session: &SessionId, generation: u64) {
        let Some(recipient) = self.recipient(session) else {
            return;
        };
        let mut guard = lock(&recipient);
        let current = guard.link.as_ref().map(|link| link.generation);
        if current == Some(generation) {
            guard.detach(Instant::now());
            info!(
                session_id = %session,
                pending = guard.tracker.pending_len(),
                "Transport detached, buffering for resume"
            );
        }
    }

    /// Destroy a session: stop accepting traffic for it, drop its
    /// subscriptions and release its delivery record. In-flight deliveries
    /// are abandoned. Returns `false` if the session was unknown.
    pub fn close_session(&self, session: &SessionId, reason: CloseReason) -> bool {
        let Some((_, recipient)) = self.recipients.remove(session) else {
            return false;
        };
        let abandoned = {
            let mut guard = lock(&recipient);
            guard.closed = true;
            if let Some(link) = guard.link.take() {
                if reason != CloseReason::Logout {
                    link.outbound.send(ServerMessage::error(
                        &MmsError::UnauthenticatedSession(Some(session.clone())),
                    ));
                }
                link.outbound.close();
            }
            guard.tracker.drop_backlog()
        };
        let channels = self.registry.remove_session(session);

        if reason == CloseReason::Expired {
            self.metrics.record_session_expired();
        } else {
            self.metrics.record_session_closed();
        }
        self.metrics.record_dropped(abandoned as u64);
        info!(
            session_id = %session,
            reason = ?reason,
            channels = channels,
            abandoned = abandoned,
            "Session closed"
        );
        self.emit(RelayEvent::SessionClosed {
            session_id: session.clone(),
            reason,
            timestamp: Utc::now(),
        });
        true
    }

    /// Apply the backpressure policy to a recipient whose bound was exceeded.
    pub fn handle_backpressure(&self, report: BackpressureExceeded, action: BackpressurePolicy) {
        self.metrics.record_backpressure();
        warn!(
            session_id = %report.session_id,
            pending = report.pending,
            oldest_age_ms = report.oldest_age.as_millis() as u64,
            action = ?action,
            "Backpressure exceeded"
        );
        self.emit(RelayEvent::Backpressure {
            session_id: report.session_id.clone(),
            pending: report.pending,
            oldest_age_ms: report.oldest_age.as_millis() as u64,
            action,
            timestamp: Utc::now(),
        });

        match action {
            BackpressurePolicy::DropBacklog => {
                if let Some(recipient) = self.recipient(&report.session_id) {
                    let dropped = lock(&recipient).tracker.drop_backlog();
                    self.metrics.record_dropped(dropped as u64);
                }
            }
            BackpressurePolicy::Evict => {
                self.close_session(&report.session_id, CloseReason::Evicted);
            }
            BackpressurePolicy::LogOnly => {}
        }
    }

    /// Expire sessions detached beyond the grace window and enforce the age bound.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let policy = self.policy_snapshot();
        let bounds = AckBounds::from(&policy);
        let mut report = SweepReport::default();
        let mut exceeded = Vec::new();

        let snapshot: Vec<Arc<Mutex<Recipient>>> = self
            .recipients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for recipient in snapshot {
            let mut guard = lock(&recipient);
            if guard.closed {
                continue;
            }
            let expired = guard
                .detached_at
                .map(|at| now.saturating_duration_since(at) > self.session_grace)
                .unwrap_or(false);
            if expired {
                report.expired.push(guard.session.id().clone());
            } else if let Some(e) = guard.check_bounds(bounds, now) {
                exceeded.push(e);
            }
        }

        for session in &report.expired {
            self.close_session(session, CloseReason::Expired);
        }
        for e in exceeded {
            report.backpressured.push(e.session_id.clone());
            self.handle_backpressure(e, policy.backpressure_policy);
        }
        report
    }

    /// Run [`BroadcastRelay::sweep`] on a fixed interval.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let report = self.sweep(Instant::now());
            if !report.expired.is_empty() || !report.backpressured.is_empty() {
                info!(
                    expired = report.expired.len(),
                    backpressured = report.backpressured.len(),
                    "Relay sweep"
                );
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events_tx.subscribe()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn policy(&self) -> SharedRelayPolicy {
        Arc::clone(&self.policy)
    }

    pub fn session_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn contains_session(&self, session: &SessionId) -> bool {
        self.recipients.contains_key(session)
    }

    pub fn is_attached(&self, session: &SessionId) -> bool {
        self.recipient(session)
            .map(|r| {
                let guard = lock(&r);
                guard.link.is_some()
            })
            .unwrap_or(false)
    }

    /// Unacknowledged envelopes buffered for `session`
    pub fn pending_count(&self, session: &SessionId) -> Option<usize> {
        self.recipient(session).map(|r| {
            let guard = lock(&r);
            guard.tracker.pending_len()
        })
    }

    pub(super) fn recipient(&self, session: &SessionId) -> Option<Arc<Mutex<Recipient>>> {
        self.recipients.get(session).map(|r| Arc::clone(r.value()))
    }

    fn policy_snapshot(&self) -> RelayPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: RelayEvent) {
        // No operator listening is fine
        let _ = self.events_tx.send(event);
    }
}
