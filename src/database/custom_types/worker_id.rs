use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifies a worker process: its OS pid plus a per-process slot index, e.g. `4821-2`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(pid: u32, slot: usize) -> Self {
        Self(format!("{pid}-{slot}"))
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
