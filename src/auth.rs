use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::engine::Engine;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Login name is the user's email; every known user shares the server password.
pub struct TimetableAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl TimetableAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }
}

impl std::fmt::Debug for TimetableAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimetableAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for TimetableAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let known = login
            .user()
            .is_some_and(|email| self.engine.find_user_by_email(email).is_some());
        if !known {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            warn!("login refused for unknown user {:?}", login.user());
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "unknown user".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
