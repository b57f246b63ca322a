mod did;
mod project_id;
mod task_error_id;
mod task_id;
mod worker_id;

pub use did::{Did, DidError};
pub use project_id::ProjectId;
pub use task_error_id::TaskErrorId;
pub use task_id::TaskId;
pub use worker_id::WorkerId;
