//! Delivering session events to participants on every instance.
//!
//! Engine events are broadcast to the participants connected here and
//! published on the relay broker. State changes never travel as payloads:
//! each instance re-reads the session and renders role-filtered views for its
//! own sockets. Phase timers run on the instance that caused the phase to
//! start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tandem_core::ids::{InstanceId, SessionId, UserId};
use tandem_core::protocol::SessionServerMessage;
use tandem_engine::view::session_view;
use tandem_engine::{PhaseTimer, SessionEngine, SessionEvent, SessionView};

use crate::broker::{BrokerError, RelayBroker, RelayEvent, RelayMessage, PUBLISH_TIMEOUT};
use crate::registry::{ConnectionRegistry, SeatKey};

struct ArmedTimer {
    generation: u64,
    phase: String,
    handle: AbortHandle,
}

pub struct SessionFanout {
    instance: InstanceId,
    engine: Arc<SessionEngine>,
    seats: Arc<ConnectionRegistry<SeatKey>>,
    broker: Arc<dyn RelayBroker>,
    timers: DashMap<SessionId, ArmedTimer>,
    generations: AtomicU64,
    publish_timeout: Duration,
}

impl SessionFanout {
    pub fn new(
        instance: InstanceId,
        engine: Arc<SessionEngine>,
        seats: Arc<ConnectionRegistry<SeatKey>>,
        broker: Arc<dyn RelayBroker>,
    ) -> Self {
        Self {
            instance,
            engine,
            seats,
            broker,
            timers: DashMap::new(),
            generations: AtomicU64::new(0),
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    /// Bound on how long a broadcast waits for the broker.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// Deliver what the engine reported, here and everywhere else, then keep
    /// the session's phase timer in step.
    pub async fn publish(self: &Arc<Self>, session_id: &SessionId, events: Vec<SessionEvent>) {
        let mut retime = false;
        for event in events {
            retime |= !matches!(
                event,
                SessionEvent::ParticipantJoined { .. } | SessionEvent::ParticipantLeft { .. }
            );
            match event_message(session_id, event) {
                None => {
                    self.state_changed(session_id);
                    self.relay(session_id, RelayEvent::StateChanged, None).await;
                }
                Some(message) => {
                    self.broadcast(session_id, &message, None);
                    self.relay(session_id, RelayEvent::Event { message }, None).await;
                }
            }
        }
        if retime {
            self.sync_timer(session_id);
        }
    }

    /// Send a message to every participant of the session, skipping
    /// `exclude`.
    pub async fn broadcast_event(
        &self,
        session_id: &SessionId,
        message: SessionServerMessage,
        exclude: Option<&UserId>,
    ) {
        self.broadcast(session_id, &message, exclude);
        self.relay(session_id, RelayEvent::Event { message }, exclude.cloned())
            .await;
    }

    /// Re-read the session and push every participant connected to this
    /// instance the view their role allows.
    pub fn state_changed(&self, session_id: &SessionId) -> usize {
        let (session, participants) = match self
            .engine
            .get(session_id)
            .and_then(|s| Ok((s, self.engine.participants(session_id)?)))
        {
            Ok(found) => found,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "cannot refresh session views");
                return 0;
            }
        };

        let mut delivered = 0;
        for participant in participants {
            let key = SeatKey::new(session_id.clone(), participant.user_id);
            let Some(conn) = self.seats.get(&key) else {
                continue;
            };
            let view = session_view(&session, participant.role.as_deref());
            if conn.send_json(&state_update(view)) {
                delivered += 1;
            }
        }
        debug!(session_id = %session_id, delivered, "state views pushed");
        delivered
    }

    /// Local delivery only.
    pub fn broadcast(
        &self,
        session_id: &SessionId,
        message: &SessionServerMessage,
        exclude: Option<&UserId>,
    ) -> usize {
        self.seats
            .select(|key| key.session_id == *session_id && Some(&key.user_id) != exclude)
            .into_iter()
            .filter(|(_, conn)| conn.send_json(message))
            .count()
    }

    /// Handle a message from the broker. Messages this instance published
    /// itself are dropped.
    pub fn deliver_remote(&self, message: RelayMessage) -> bool {
        if message.origin == self.instance {
            return false;
        }
        match message.event {
            RelayEvent::StateChanged => {
                self.state_changed(&message.session_id);
            }
            RelayEvent::Event { message: event } => {
                self.broadcast(&message.session_id, &event, message.exclude.as_ref());
            }
        }
        true
    }

    async fn relay(&self, session_id: &SessionId, event: RelayEvent, exclude: Option<UserId>) {
        let message = RelayMessage {
            origin: self.instance.clone(),
            session_id: session_id.clone(),
            event,
            exclude,
        };
        let published = match tokio::time::timeout(self.publish_timeout, self.broker.publish(&message)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.publish_timeout)),
        };
        if let Err(e) = published {
            warn!(
                session_id = %session_id,
                broker = self.broker.name(),
                error = %e,
                "relay publish failed, delivering on this instance only"
            );
        }
    }

    /// Listen for other instances' messages until cancelled. A failed or
    /// ended subscription is retried after `retry`.
    pub fn spawn_relay_listener(self: &Arc<Self>, retry: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.broker.subscribe().await {
                    Ok(mut stream) => {
                        info!(broker = this.broker.name(), instance_id = %this.instance, "relay subscription active");
                        loop {
                            tokio::select! {
                                () = cancel.cancelled() => return,
                                next = stream.next() => match next {
                                    Some(message) => {
                                        this.deliver_remote(message);
                                    }
                                    None => {
                                        warn!(broker = this.broker.name(), "relay subscription ended");
                                        break;
                                    }
                                },
                            }
                        }
                    }
                    Err(e) => {
                        warn!(broker = this.broker.name(), error = %e, "relay subscribe failed, delivering on this instance only");
                    }
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(retry) => {}
                }
            }
        })
    }

    pub fn armed_timer(&self, session_id: &SessionId) -> Option<String> {
        self.timers.get(session_id).map(|t| t.phase.clone())
    }

    /// Arm, re-arm or disarm the session's phase timer from its stored state.
    pub fn sync_timer(self: &Arc<Self>, session_id: &SessionId) {
        let timer = match self.engine.get(session_id) {
            Ok(session) => SessionEngine::phase_timer(&session),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "no session to time");
                None
            }
        };
        let Some(PhaseTimer { phase, remaining }) = timer else {
            if let Some((_, old)) = self.timers.remove(session_id) {
                old.handle.abort();
            }
            return;
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let id = session_id.clone();
        let fired_phase = phase.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            this.timers.remove_if(&id, |_, t| t.generation == generation);
            match this.engine.on_phase_timer(&id, &fired_phase) {
                Ok(events) if events.is_empty() => {
                    debug!(session_id = %id, phase = %fired_phase, "stale phase timer");
                }
                Ok(events) => {
                    info!(session_id = %id, phase = %fired_phase, "phase timer expired");
                    this.publish(&id, events).await;
                }
                Err(e) => warn!(session_id = %id, phase = %fired_phase, error = %e, "phase timer failed"),
            }
        })
        .abort_handle();

        debug!(session_id = %session_id, phase = %phase, remaining_secs = remaining.as_secs(), "phase timer armed");
        let armed = ArmedTimer {
            generation,
            phase,
            handle,
        };
        if let Some(old) = self.timers.insert(session_id.clone(), armed) {
            old.handle.abort();
        }
    }
}

pub fn state_update(view: SessionView) -> SessionServerMessage {
    SessionServerMessage::PgStateUpdate {
        session_id: view.session_id,
        status: view.status,
        phase: view.phase,
        role: view.role,
        state: view.state,
    }
}

/// Wire form of an engine event. `StateChanged` has none; it is rendered per
/// participant.
fn event_message(session_id: &SessionId, event: SessionEvent) -> Option<SessionServerMessage> {
    let session_id = session_id.clone();
    let message = match event {
        SessionEvent::StateChanged => return None,
        SessionEvent::ParticipantJoined { user_id } => {
            SessionServerMessage::PgParticipantJoined { session_id, user_id }
        }
        SessionEvent::ParticipantLeft { user_id } => {
            SessionServerMessage::PgParticipantLeft { session_id, user_id }
        }
        SessionEvent::Started { phase } => SessionServerMessage::PgSessionStarted { session_id, phase },
        SessionEvent::PhaseTransition { from, to } => {
            SessionServerMessage::PgPhaseTransition { session_id, from, to }
        }
        SessionEvent::Finished {
            winning_role,
            winners,
            prizes,
        } => SessionServerMessage::PgSessionFinished {
            session_id,
            winning_role,
            winners,
            prizes,
        },
    };
    Some(message)
}
