//! Per-session access credentials.
//!
//! A credential is issued once, when a session runs its first statement, and
//! is held by that connection's handler on the server. Nothing the client
//! sends can replace it. The student variant freezes the enrollment set at
//! issuance; later enrollment changes are only seen after reconnecting.

use crate::engine::{Engine, EngineError};
use crate::model::{Credential, Role};

/// Build a credential for the user holding `email`, from the current user
/// record and enrollment.
pub fn issue(engine: &Engine, email: &str) -> Result<Credential, EngineError> {
    let user = engine
        .find_user_by_email(email)
        .ok_or(EngineError::Forbidden("unknown user"))?;
    Ok(match user.role {
        Role::Admin => Credential::Admin { user_id: user.id },
        Role::Student => Credential::Student {
            user_id: user.id,
            course_ids: engine.enrolled_courses(&user.id),
        },
    })
}

#[derive(Debug)]
pub struct TokenError(serde_json::Error);

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed session credential: {}", self.0)
    }
}

impl std::error::Error for TokenError {}

/// JSON rendering shown in the `session` row.
pub fn encode(credential: &Credential) -> Result<String, TokenError> {
    serde_json::to_string(credential).map_err(TokenError)
}

impl Credential {
    pub fn require_admin(&self) -> Result<(), EngineError> {
        match self {
            Credential::Admin { .. } => Ok(()),
            Credential::Student { .. } => Err(EngineError::Forbidden("administrators only")),
        }
    }
}
