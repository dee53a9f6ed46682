//! Tasks in flight on agent sockets.
//!
//! Each dispatched task gets an ordered [`TaskStream`] and a rolling idle
//! timer. Chunks and heartbeats push the deadline out; completion, error,
//! cancellation, timeout and agent disconnect all end the task through the
//! same removal path, so exactly one terminal event is emitted.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use tandem_core::ids::{AgentId, ConnectionId, TaskId};
use tandem_core::protocol::AgentServerMessage;

use crate::notify::{TaskDispatch, TaskRequest};
use crate::registry::ConnectionRegistry;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    /// New text since the previous chunk.
    Chunk(String),
    Complete(String),
    Error(TaskFailure),
}

/// Why a task ended without completing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    #[error("{0}")]
    Agent(String),
    #[error("Task timed out (idle for {}s)", .0.as_secs())]
    TimedOut(Duration),
    #[error("Agent disconnected")]
    Disconnected,
    #[error("Agent reconnected")]
    Reconnected,
    #[error("cancelled")]
    Cancelled,
}

impl TaskFailure {
    /// Error class reported to users alongside the message.
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Self::TimedOut(_) => Some("timeout"),
            Self::Disconnected | Self::Reconnected => Some("unavailable"),
            Self::Agent(_) | Self::Cancelled => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("agent {0} is offline")]
    AgentOffline(AgentId),
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
}

/// Events for one task, in arrival order.
pub struct TaskStream {
    task_id: TaskId,
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl TaskStream {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }
}

impl Stream for TaskStream {
    type Item = TaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskEvent>> {
        self.rx.poll_recv(cx)
    }
}

struct PendingTask {
    agent_id: AgentId,
    accumulated: String,
    tx: mpsc::UnboundedSender<TaskEvent>,
    generation: u64,
    timer: AbortHandle,
}

pub struct AgentDispatcher {
    agents: Arc<ConnectionRegistry<AgentId>>,
    pending: Arc<DashMap<TaskId, PendingTask>>,
    idle_timeout: Duration,
    generations: AtomicU64,
}

impl AgentDispatcher {
    pub fn new(agents: Arc<ConnectionRegistry<AgentId>>, idle_timeout: Duration) -> Self {
        Self {
            agents,
            pending: Arc::new(DashMap::new()),
            idle_timeout,
            generations: AtomicU64::new(0),
        }
    }

    pub fn agents(&self) -> &Arc<ConnectionRegistry<AgentId>> {
        &self.agents
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, task_id: &TaskId) -> bool {
        self.pending.contains_key(task_id)
    }

    /// Send a task to `agent_id`. Offline agents fail synchronously and leave
    /// nothing behind.
    pub fn send_task(&self, agent_id: &AgentId, request: TaskRequest) -> Result<TaskStream, DispatchError> {
        let conn = self
            .agents
            .get(agent_id)
            .filter(|conn| !conn.is_closed())
            .ok_or_else(|| DispatchError::AgentOffline(agent_id.clone()))?;

        let task_id = request.task_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation();
        self.pending.insert(
            task_id.clone(),
            PendingTask {
                agent_id: agent_id.clone(),
                accumulated: String::new(),
                tx,
                generation,
                timer: self.arm_timer(&task_id, generation),
            },
        );

        let sent = conn.send_json(&AgentServerMessage::Task {
            task_id: task_id.clone(),
            conversation_id: request.conversation_id,
            content: request.content,
            sender_user_id: request.sender_user_id,
        });
        if !sent {
            if let Some((_, task)) = self.pending.remove(&task_id) {
                task.timer.abort();
            }
            return Err(DispatchError::AgentOffline(agent_id.clone()));
        }

        debug!(agent_id = %agent_id, task_id = %task_id, "task dispatched");
        Ok(TaskStream { task_id, rx })
    }

    /// A chunk from the agent. Accumulated snapshots are reduced to their new
    /// suffix; anything else is taken as a delta.
    pub fn on_chunk(&self, agent_id: &AgentId, task_id: &TaskId, chunk: &str) {
        let generation = self.next_generation();
        let Some(mut task) = self.pending.get_mut(task_id) else {
            debug!(task_id = %task_id, "chunk for unknown task ignored");
            return;
        };
        if task.agent_id != *agent_id {
            warn!(agent_id = %agent_id, task_id = %task_id, "chunk from non-owning agent ignored");
            return;
        }

        let delta = if !task.accumulated.is_empty() && chunk.starts_with(task.accumulated.as_str()) {
            let delta = chunk[task.accumulated.len()..].to_string();
            task.accumulated = chunk.to_string();
            delta
        } else {
            task.accumulated.push_str(chunk);
            chunk.to_string()
        };

        task.timer.abort();
        task.generation = generation;
        task.timer = self.arm_timer(task_id, generation);
        if !delta.is_empty() {
            let _ = task.tx.send(TaskEvent::Chunk(delta));
        }
    }

    pub fn on_heartbeat(&self, agent_id: &AgentId, task_id: &TaskId) {
        let generation = self.next_generation();
        if let Some(mut task) = self.pending.get_mut(task_id) {
            if task.agent_id == *agent_id {
                task.timer.abort();
                task.generation = generation;
                task.timer = self.arm_timer(task_id, generation);
            }
        }
    }

    /// Final content. An empty completion falls back to what was streamed.
    pub fn on_complete(&self, agent_id: &AgentId, task_id: &TaskId, content: &str) {
        if let Some(task) = self.take_owned(agent_id, task_id) {
            let content = if content.is_empty() {
                task.accumulated
            } else {
                content.to_string()
            };
            debug!(task_id = %task_id, bytes = content.len(), "task complete");
            let _ = task.tx.send(TaskEvent::Complete(content));
        }
    }

    pub fn on_error(&self, agent_id: &AgentId, task_id: &TaskId, error: &str) {
        if let Some(task) = self.take_owned(agent_id, task_id) {
            warn!(task_id = %task_id, agent_id = %agent_id, error, "agent reported task error");
            let _ = task.tx.send(TaskEvent::Error(TaskFailure::Agent(error.to_string())));
        }
    }

    /// Cancel a pending task and tell its agent to stop.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), DispatchError> {
        let (_, task) = self
            .pending
            .remove(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.clone()))?;
        task.timer.abort();
        let _ = task.tx.send(TaskEvent::Error(TaskFailure::Cancelled));
        self.agents.send_to(
            &task.agent_id,
            &AgentServerMessage::CancelTask {
                task_id: task_id.clone(),
            },
        );
        info!(task_id = %task_id, agent_id = %task.agent_id, "task cancelled");
        Ok(())
    }

    /// The agent's socket went away. Only the socket still on file counts;
    /// a superseded socket closing leaves the tasks with its replacement.
    pub fn disconnect(&self, agent_id: &AgentId, conn_id: &ConnectionId) -> usize {
        if !self.agents.unregister(agent_id, conn_id) {
            return 0;
        }
        let failed = self.fail_agent_tasks(agent_id, TaskFailure::Disconnected);
        info!(agent_id = %agent_id, failed, "agent disconnected");
        failed
    }

    /// End every task `agent_id` owns with `failure`.
    pub fn fail_agent_tasks(&self, agent_id: &AgentId, failure: TaskFailure) -> usize {
        let owned: Vec<TaskId> = self
            .pending
            .iter()
            .filter(|entry| entry.agent_id == *agent_id)
            .map(|entry| entry.key().clone())
            .collect();
        let mut failed = 0;
        for task_id in owned {
            if let Some((_, task)) = self.pending.remove(&task_id) {
                task.timer.abort();
                let _ = task.tx.send(TaskEvent::Error(failure.clone()));
                failed += 1;
            }
        }
        failed
    }

    fn take_owned(&self, agent_id: &AgentId, task_id: &TaskId) -> Option<PendingTask> {
        let removed = self
            .pending
            .remove_if(task_id, |_, task| task.agent_id == *agent_id)
            .map(|(_, task)| task);
        match &removed {
            Some(task) => task.timer.abort(),
            None => debug!(task_id = %task_id, agent_id = %agent_id, "no pending task for agent"),
        }
        removed
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn arm_timer(&self, task_id: &TaskId, generation: u64) -> AbortHandle {
        let pending = self.pending.clone();
        let idle = self.idle_timeout;
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let expired = pending.remove_if(&task_id, |_, task| task.generation == generation);
            if let Some((_, task)) = expired {
                warn!(task_id = %task_id, agent_id = %task.agent_id, idle_secs = idle.as_secs(), "task timed out");
                let _ = task.tx.send(TaskEvent::Error(TaskFailure::TimedOut(idle)));
            }
        })
        .abort_handle()
    }
}

impl TaskDispatch for AgentDispatcher {
    fn dispatch(&self, agent_id: &AgentId, request: TaskRequest) -> Result<TaskStream, DispatchError> {
        self.send_task(agent_id, request)
    }

    fn cancel(&self, task_id: &TaskId) -> bool {
        AgentDispatcher::cancel(self, task_id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, Outbound, Outbox};
    use tandem_core::ids::{ConversationId, UserId};

    const IDLE: Duration = Duration::from_secs(600);

    fn setup() -> (AgentDispatcher, AgentId, ConnectionHandle, Outbox) {
        let agents = Arc::new(ConnectionRegistry::new("agents"));
        let agent = AgentId::from_raw("agent_1");
        let (conn, out) = ConnectionHandle::channel(32);
        agents.register(agent.clone(), conn.clone());
        (AgentDispatcher::new(agents, IDLE), agent, conn, out)
    }

    fn request(task: &str) -> TaskRequest {
        TaskRequest {
            task_id: TaskId::from_raw(task),
            conversation_id: ConversationId::from_raw("conv_1"),
            content: "hello".into(),
            sender_user_id: UserId::from_raw("user_1"),
        }
    }

    fn next_frame(out: &mut Outbox) -> serde_json::Value {
        match out.try_recv() {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    fn drain(stream: &mut TaskStream) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(event) = stream.rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn offline_agent_fails_without_side_effects() {
        let (dispatcher, _, _, _) = setup();
        let err = dispatcher
            .send_task(&AgentId::from_raw("agent_gone"), request("t1"))
            .err()
            .unwrap();
        assert_eq!(err, DispatchError::AgentOffline(AgentId::from_raw("agent_gone")));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn task_frame_reaches_agent() {
        let (dispatcher, agent, _conn, mut out) = setup();
        let stream = dispatcher.send_task(&agent, request("t1")).unwrap();
        assert_eq!(stream.task_id().as_str(), "t1");
        let frame = next_frame(&mut out);
        assert_eq!(frame["type"], "task");
        assert_eq!(frame["taskId"], "t1");
        assert_eq!(frame["senderUserId"], "user_1");
        assert!(dispatcher.is_pending(&TaskId::from_raw("t1")));
    }

    #[tokio::test]
    async fn delta_and_snapshot_chunks_forward_only_new_text() {
        let (dispatcher, agent, _conn, _out) = setup();
        let task = TaskId::from_raw("t1");
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();

        dispatcher.on_chunk(&agent, &task, "Hel");
        dispatcher.on_chunk(&agent, &task, "Hello");
        dispatcher.on_chunk(&agent, &task, " world");
        dispatcher.on_chunk(&agent, &task, "Hello world");
        dispatcher.on_complete(&agent, &task, "Hello world!");

        assert_eq!(
            drain(&mut stream),
            vec![
                TaskEvent::Chunk("Hel".into()),
                TaskEvent::Chunk("lo".into()),
                TaskEvent::Chunk(" world".into()),
                TaskEvent::Complete("Hello world!".into()),
            ]
        );
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn foreign_agent_cannot_advance_task() {
        let (dispatcher, agent, _conn, _out) = setup();
        let task = TaskId::from_raw("t1");
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();
        let intruder = AgentId::from_raw("agent_2");

        dispatcher.on_chunk(&intruder, &task, "spoof");
        dispatcher.on_complete(&intruder, &task, "spoof");
        assert!(drain(&mut stream).is_empty());
        assert!(dispatcher.is_pending(&task));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_task_times_out_exactly_once() {
        let (dispatcher, agent, _conn, _out) = setup();
        let task = TaskId::from_raw("t1");
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        match stream.recv().await {
            Some(TaskEvent::Error(failure)) => {
                assert_eq!(failure.to_string(), "Task timed out (idle for 600s)");
                assert_eq!(failure.kind(), Some("timeout"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!dispatcher.is_pending(&task));

        dispatcher.on_chunk(&agent, &task, "late");
        dispatcher.on_complete(&agent, &task, "late");
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_and_heartbeats_push_the_deadline_out() {
        let (dispatcher, agent, _conn, _out) = setup();
        let task = TaskId::from_raw("t1");
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();

        tokio::time::sleep(IDLE - Duration::from_secs(10)).await;
        dispatcher.on_heartbeat(&agent, &task);
        tokio::time::sleep(IDLE - Duration::from_secs(10)).await;
        dispatcher.on_chunk(&agent, &task, "still here");
        tokio::time::sleep(IDLE - Duration::from_secs(10)).await;
        assert!(dispatcher.is_pending(&task));
        assert_eq!(drain(&mut stream), vec![TaskEvent::Chunk("still here".into())]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!dispatcher.is_pending(&task));
    }

    #[tokio::test]
    async fn cancel_notifies_agent_and_ends_stream() {
        let (dispatcher, agent, _conn, mut out) = setup();
        let task = TaskId::from_raw("t1");
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();
        let _task_frame = next_frame(&mut out);

        dispatcher.cancel(&task).unwrap();
        assert_eq!(drain(&mut stream), vec![TaskEvent::Error(TaskFailure::Cancelled)]);
        assert_eq!(next_frame(&mut out)["type"], "cancel_task");
        assert_eq!(dispatcher.cancel(&task), Err(DispatchError::UnknownTask(task)));
    }

    #[tokio::test]
    async fn disconnect_fails_owned_tasks_only_for_current_socket() {
        let (dispatcher, agent, conn, _out) = setup();
        let mut stream = dispatcher.send_task(&agent, request("t1")).unwrap();

        let (fresh, _fresh_out) = ConnectionHandle::channel(8);
        dispatcher.agents().register(agent.clone(), fresh.clone());
        assert_eq!(dispatcher.disconnect(&agent, conn.id()), 0);
        assert!(dispatcher.is_pending(&TaskId::from_raw("t1")));

        assert_eq!(dispatcher.disconnect(&agent, fresh.id()), 1);
        assert_eq!(drain(&mut stream), vec![TaskEvent::Error(TaskFailure::Disconnected)]);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
