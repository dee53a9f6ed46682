//! User conversations with agents.
//!
//! A user message is persisted together with an empty `streaming` reply
//! placeholder whose id doubles as the task id. The task's event stream is
//! pumped back to the user and settles the placeholder.
//!
//! A conversation has at most one reply in flight. Messages sent while one is
//! streaming wait in the conversation's lane and are dispatched in order as
//! each reply settles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use tandem_core::constants::SYNC_MESSAGE_LIMIT;
use tandem_core::ids::{ConversationId, MessageId, UserId};
use tandem_core::protocol::{ConversationSummary, MessageSnapshot, UserServerMessage};
use tandem_core::RuntimeError;
use tandem_store::agents::{AgentRepo, AgentRow};
use tandem_store::messages::{ConversationRepo, MessageRepo, MessageRole, MessageRow, MessageStatus};
use tandem_store::{Database, StoreError};

use crate::dispatcher::{DispatchError, TaskEvent, TaskStream};
use crate::notify::{TaskDispatch, TaskRequest, UserNotifier};
use crate::rate_limit::RateLimiter;

struct ActiveStream {
    user_id: UserId,
    conversation_id: ConversationId,
    seq: i64,
    content: String,
}

/// A persisted user message whose reply has not been requested yet.
struct QueuedReply {
    user_id: UserId,
    agent: AgentRow,
    content: String,
}

/// What became of an accepted user message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply streams into this placeholder.
    Dispatched(MessageId),
    /// Waiting behind the reply in flight; `position` counts from 1.
    Queued { position: usize },
}

impl SendOutcome {
    pub fn placeholder(&self) -> Option<&MessageId> {
        match self {
            Self::Dispatched(id) => Some(id),
            Self::Queued { .. } => None,
        }
    }
}

enum Started {
    Streaming(MessageId),
    /// Settled at once because the agent is offline.
    Settled(MessageId),
}

/// State shared with the per-task pumps.
struct Replies {
    messages: MessageRepo,
    dispatch: Arc<dyn TaskDispatch>,
    users: Arc<dyn UserNotifier>,
    streams: DashMap<MessageId, ActiveStream>,
    /// Present while the conversation has a reply in flight.
    lanes: DashMap<ConversationId, VecDeque<QueuedReply>>,
}

pub struct UserRelay {
    conversations: ConversationRepo,
    messages: MessageRepo,
    agents: AgentRepo,
    limiter: RateLimiter,
    replies: Arc<Replies>,
}

impl UserRelay {
    pub fn new(
        db: Database,
        dispatch: Arc<dyn TaskDispatch>,
        users: Arc<dyn UserNotifier>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            agents: AgentRepo::new(db.clone()),
            limiter,
            replies: Arc::new(Replies {
                messages: MessageRepo::new(db),
                dispatch,
                users,
                streams: DashMap::new(),
                lanes: DashMap::new(),
            }),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.replies.streams.len()
    }

    pub fn queued(&self, conversation_id: &ConversationId) -> usize {
        self.replies.lanes.get(conversation_id).map_or(0, |lane| lane.len())
    }

    /// Persist a user message and hand it to the conversation's agent, or
    /// queue it if the agent is still answering. Rate, content and ownership
    /// errors are rejections; nothing was stored for them.
    pub fn handle_send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<SendOutcome, RuntimeError> {
        if !self.limiter.try_acquire(user_id) {
            warn!(user_id = %user_id, "message rate limit hit");
            return Err(RuntimeError::RateLimited {
                limit: self.limiter.limit(),
            });
        }
        if content.trim().is_empty() {
            return Err(RuntimeError::InvalidMessage("content is empty".into()));
        }

        let conversation = match self.conversations.get(conversation_id) {
            Ok(conversation) if conversation.user_id == *user_id => conversation,
            Ok(_) | Err(StoreError::NotFound(_)) => {
                return Err(RuntimeError::NotFound(format!("conversation {conversation_id}")));
            }
            Err(e) => return Err(internal(e)),
        };
        let agent = self.agents.get(&conversation.agent_id).map_err(internal)?;

        self.messages
            .insert(conversation_id, MessageRole::User, content, MessageStatus::Completed, None)
            .map_err(internal)?;

        let reply = QueuedReply {
            user_id: user_id.clone(),
            agent,
            content: content.to_string(),
        };
        let reply = match self.replies.lanes.entry(conversation_id.clone()) {
            Entry::Occupied(mut lane) => {
                let (agent_id, agent_name) = (reply.agent.id.clone(), reply.agent.name.clone());
                lane.get_mut().push_back(reply);
                let position = lane.get().len();
                drop(lane);
                info!(conversation_id = %conversation_id, position, "reply queued behind active stream");
                self.replies.users.notify(
                    user_id,
                    &UserServerMessage::StreamQueued {
                        conversation_id: conversation_id.clone(),
                        agent_id,
                        agent_name,
                        position,
                    },
                );
                return Ok(SendOutcome::Queued { position });
            }
            Entry::Vacant(lane) => {
                lane.insert(VecDeque::new());
                reply
            }
        };

        match self.replies.start_reply(conversation_id, &reply) {
            Ok(Started::Streaming(placeholder)) => Ok(SendOutcome::Dispatched(placeholder)),
            Ok(Started::Settled(placeholder)) => {
                self.replies.advance(conversation_id);
                Ok(SendOutcome::Dispatched(placeholder))
            }
            Err(e) => {
                self.replies.advance(conversation_id);
                Err(internal(e))
            }
        }
    }

    /// Stop a reply in progress, keeping what has streamed so far.
    pub fn cancel_stream(&self, user_id: &UserId, message_id: &MessageId) -> Result<(), RuntimeError> {
        let Some((_, active)) = self
            .replies
            .streams
            .remove_if(message_id, |_, s| s.user_id == *user_id)
        else {
            return Err(RuntimeError::NotFound(format!("active stream {message_id}")));
        };
        self.replies.dispatch.cancel(message_id);

        let settled = self
            .messages
            .finalize(message_id, &active.content, MessageStatus::Cancelled);
        let conversation_id = active.conversation_id.clone();
        match settled {
            Ok(true) => {
                self.replies.users.notify(
                    user_id,
                    &UserServerMessage::StreamEnd {
                        conversation_id: active.conversation_id,
                        message_id: message_id.clone(),
                        seq: active.seq,
                        content: Some(active.content),
                    },
                );
            }
            Ok(false) => debug!(message_id = %message_id, "stream already settled"),
            Err(e) => {
                self.replies.advance(&conversation_id);
                return Err(internal(e));
            }
        }
        info!(message_id = %message_id, "stream cancelled");
        self.replies.advance(&conversation_id);
        Ok(())
    }

    /// Catch a reconnecting user up: a summary of every conversation they
    /// own, plus the messages after each `seq` the client reports. Replies
    /// still streaming carry the text received so far.
    pub fn sync(
        &self,
        user_id: &UserId,
        known: &BTreeMap<ConversationId, i64>,
    ) -> Result<UserServerMessage, RuntimeError> {
        let owned = self.conversations.list_for_user(user_id).map_err(internal)?;
        let mut conversations = Vec::with_capacity(owned.len());
        let mut missed_messages = Vec::new();

        for conversation in owned {
            let latest = self.messages.latest(&conversation.id).map_err(internal)?;
            let max_seq = latest.as_ref().map_or(0, |m| m.seq);
            if let Some(&after) = known.get(&conversation.id) {
                if after < max_seq {
                    let missed = self
                        .messages
                        .list_after(&conversation.id, after, SYNC_MESSAGE_LIMIT)
                        .map_err(internal)?;
                    missed_messages.extend(missed.into_iter().map(|m| self.replies.snapshot(m)));
                }
            }
            conversations.push(ConversationSummary {
                conversation_id: conversation.id,
                agent_id: conversation.agent_id,
                max_seq,
                last_message: latest.map(|m| self.replies.snapshot(m)),
            });
        }

        debug!(
            user_id = %user_id,
            conversations = conversations.len(),
            missed = missed_messages.len(),
            "sync prepared"
        );
        Ok(UserServerMessage::SyncResponse {
            conversations,
            missed_messages,
        })
    }
}

impl Replies {
    /// Create the placeholder, announce it and dispatch the task.
    fn start_reply(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        reply: &QueuedReply,
    ) -> Result<Started, StoreError> {
        let agent = &reply.agent;
        let placeholder = self.messages.insert(
            conversation_id,
            MessageRole::Agent,
            "",
            MessageStatus::Streaming,
            Some(&agent.id),
        )?;

        self.users.notify(
            &reply.user_id,
            &UserServerMessage::StreamStart {
                conversation_id: conversation_id.clone(),
                message_id: placeholder.id.clone(),
                seq: placeholder.seq,
                sender_agent_id: agent.id.clone(),
                sender_agent_name: agent.name.clone(),
            },
        );

        let request = TaskRequest {
            task_id: placeholder.id.clone(),
            conversation_id: conversation_id.clone(),
            content: reply.content.clone(),
            sender_user_id: reply.user_id.clone(),
        };
        match self.dispatch.dispatch(&agent.id, request) {
            Ok(stream) => {
                self.streams.insert(
                    placeholder.id.clone(),
                    ActiveStream {
                        user_id: reply.user_id.clone(),
                        conversation_id: conversation_id.clone(),
                        seq: placeholder.seq,
                        content: String::new(),
                    },
                );
                tokio::spawn(pump(stream, Arc::clone(self)));
                Ok(Started::Streaming(placeholder.id))
            }
            Err(DispatchError::AgentOffline(_)) | Err(DispatchError::UnknownTask(_)) => {
                let text = format!(
                    "{} is offline. Start the agent and connect it with pairing code {} to bring it online.",
                    agent.name, agent.pairing_code
                );
                info!(agent_id = %agent.id, conversation_id = %conversation_id, "agent offline");
                if let Err(e) = self.messages.finalize(&placeholder.id, &text, MessageStatus::Error) {
                    error!(message_id = %placeholder.id, error = %e, "failed to settle offline placeholder");
                }
                self.users.notify(
                    &reply.user_id,
                    &UserServerMessage::StreamError {
                        conversation_id: Some(conversation_id.clone()),
                        message_id: Some(placeholder.id.clone()),
                        seq: Some(placeholder.seq),
                        error: text,
                        kind: Some("unavailable".into()),
                    },
                );
                Ok(Started::Settled(placeholder.id))
            }
        }
    }

    /// The conversation's reply in flight has settled: start the next queued
    /// one, or free the lane when nothing waits.
    fn advance(self: &Arc<Self>, conversation_id: &ConversationId) {
        loop {
            let next = match self.lanes.entry(conversation_id.clone()) {
                Entry::Occupied(mut lane) => match lane.get_mut().pop_front() {
                    Some(next) => next,
                    None => {
                        lane.remove();
                        return;
                    }
                },
                Entry::Vacant(_) => return,
            };
            debug!(conversation_id = %conversation_id, "dispatching queued reply");
            match self.start_reply(conversation_id, &next) {
                Ok(Started::Streaming(_)) => return,
                Ok(Started::Settled(_)) => {}
                Err(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "failed to start queued reply");
                    self.users.notify(
                        &next.user_id,
                        &UserServerMessage::StreamError {
                            conversation_id: Some(conversation_id.clone()),
                            message_id: None,
                            seq: None,
                            error: "Failed to start the reply".into(),
                            kind: Some("internal".into()),
                        },
                    );
                }
            }
        }
    }

    fn snapshot(&self, message: MessageRow) -> MessageSnapshot {
        let content = match message.status {
            MessageStatus::Streaming => self
                .streams
                .get(&message.id)
                .map_or(message.content, |active| active.content.clone()),
            _ => message.content,
        };
        MessageSnapshot {
            id: message.id,
            conversation_id: message.conversation_id,
            seq: message.seq,
            role: message.role.as_str().to_string(),
            content,
            status: message.status.as_str().to_string(),
            created_at: message.created_at,
        }
    }
}

fn internal(e: StoreError) -> RuntimeError {
    error!(error = %e, "store failure in user relay");
    RuntimeError::Internal(e.to_string())
}

/// Forward one task's events to its user until the stream settles, then let
/// the conversation's next queued message go. A stream that was cancelled
/// meanwhile is simply abandoned.
async fn pump(mut stream: TaskStream, replies: Arc<Replies>) {
    let message_id = stream.task_id().clone();
    while let Some(event) = stream.recv().await {
        match event {
            TaskEvent::Chunk(delta) => {
                let (user_id, conversation_id, seq) = {
                    let Some(mut active) = replies.streams.get_mut(&message_id) else {
                        return;
                    };
                    active.content.push_str(&delta);
                    (active.user_id.clone(), active.conversation_id.clone(), active.seq)
                };
                replies.users.notify(
                    &user_id,
                    &UserServerMessage::StreamChunk {
                        conversation_id,
                        message_id: message_id.clone(),
                        seq,
                        chunk: delta,
                    },
                );
            }
            TaskEvent::Complete(content) => {
                let Some((_, active)) = replies.streams.remove(&message_id) else {
                    return;
                };
                match replies.messages.finalize(&message_id, &content, MessageStatus::Completed) {
                    Ok(true) => {
                        replies.users.notify(
                            &active.user_id,
                            &UserServerMessage::StreamEnd {
                                conversation_id: active.conversation_id.clone(),
                                message_id: message_id.clone(),
                                seq: active.seq,
                                content: Some(content),
                            },
                        );
                    }
                    Ok(false) => debug!(message_id = %message_id, "completion for settled message"),
                    Err(e) => {
                        error!(message_id = %message_id, error = %e, "failed to persist completion");
                        replies.users.notify(
                            &active.user_id,
                            &UserServerMessage::StreamError {
                                conversation_id: Some(active.conversation_id.clone()),
                                message_id: Some(message_id.clone()),
                                seq: Some(active.seq),
                                error: "Failed to save the reply".into(),
                                kind: Some("internal".into()),
                            },
                        );
                    }
                }
                replies.advance(&active.conversation_id);
                return;
            }
            TaskEvent::Error(failure) => {
                let Some((_, active)) = replies.streams.remove(&message_id) else {
                    return;
                };
                let reason = failure.to_string();
                if let Err(e) = replies.messages.finalize(&message_id, &reason, MessageStatus::Error) {
                    error!(message_id = %message_id, error = %e, "failed to persist task error");
                }
                replies.users.notify(
                    &active.user_id,
                    &UserServerMessage::StreamError {
                        conversation_id: Some(active.conversation_id.clone()),
                        message_id: Some(message_id.clone()),
                        seq: Some(active.seq),
                        error: reason,
                        kind: failure.kind().map(str::to_string),
                    },
                );
                replies.advance(&active.conversation_id);
                return;
            }
        }
    }

    // Sender dropped without a terminal event.
    if let Some((_, active)) = replies.streams.remove(&message_id) {
        warn!(message_id = %message_id, "task stream ended without a result");
        let _ = replies
            .messages
            .finalize(&message_id, "Task ended without a result", MessageStatus::Error);
        replies.advance(&active.conversation_id);
    }
}
