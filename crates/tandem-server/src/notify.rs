//! Capabilities the user relay and the agent dispatcher see of each other.

use tandem_core::ids::{AgentId, ConversationId, TaskId, UserId};
use tandem_core::protocol::UserServerMessage;

use crate::dispatcher::{DispatchError, TaskStream};
use crate::registry::ConnectionRegistry;

/// Reach a user's socket.
pub trait UserNotifier: Send + Sync {
    /// Best effort; `false` if the user is offline or the frame was dropped.
    fn notify(&self, user_id: &UserId, message: &UserServerMessage) -> bool;
}

impl UserNotifier for ConnectionRegistry<UserId> {
    fn notify(&self, user_id: &UserId, message: &UserServerMessage) -> bool {
        self.send_to(user_id, message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_user_id: UserId,
}

/// Hand work to a connected agent.
pub trait TaskDispatch: Send + Sync {
    fn dispatch(&self, agent_id: &AgentId, request: TaskRequest) -> Result<TaskStream, DispatchError>;

    /// Stop a task early. `false` if it was not pending.
    fn cancel(&self, task_id: &TaskId) -> bool;
}
