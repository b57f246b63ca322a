use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::custom_types::Did;

#[derive(Clone, Copy, Debug, Deserialize, Hash, Eq, Ord, PartialEq, PartialOrd, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct TaskErrorId(Did);

impl Display for TaskErrorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TaskErrorId {
    pub fn new() -> Self {
        Self(Did::from(Uuid::new_v4()))
    }
}

impl Default for TaskErrorId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskErrorId {
    fn from(value: Uuid) -> Self {
        Self(Did::from(value))
    }
}
