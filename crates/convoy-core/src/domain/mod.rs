//! Domain model (IDs, states, task records, messages, errors).

pub mod errors;
pub mod ids;
pub mod message;
pub mod state;
pub mod task;

pub use self::errors::{GridError, GridResult, WorkError};
pub use self::ids::{NodeId, TaskId};
pub use self::message::{
    GridCommand, GridMessage, GridReply, JobStateMessage, PipelineMessage, PipelineSignal,
    RequestOptions, ResponseMode, StopMessage,
};
pub use self::state::{JobState, JobStateAtTime, TaskState};
pub use self::task::{Aggregation, ExecutionMode, ExecutionResult, TaskProgress, TaskRequest};
