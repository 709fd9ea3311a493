//! The invoker identity threaded explicitly through every engine call.

use serde::{Deserialize, Serialize};

/// Who is asking and on behalf of which tenant (DOC).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub doc: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, doc: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            doc: doc.into(),
        }
    }
}
