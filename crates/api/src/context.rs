use scribe_core::UserId;

/// The user a request acts for.
///
/// Inserted by [`crate::middleware::user_context_middleware`]; present on every
/// route except `/health`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
