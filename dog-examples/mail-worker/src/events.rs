use dog_queue::{IntoJob, QueueResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::background::jobs::SEND_WELCOME_EMAIL;

/// Emitted by the signup flow once a user account exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegistered {
    pub email: String,
    pub name: String,
}

impl UserRegistered {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }
}

impl IntoJob for UserRegistered {
    const HANDLER: &'static str = SEND_WELCOME_EMAIL;

    fn args(&self) -> QueueResult<Vec<Value>> {
        Ok(vec![json!(self.email), json!(self.name)])
    }
}
