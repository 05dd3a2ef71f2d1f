//! Bot identity resolved from the credential

use crate::PipelineError;
use botstream_shared::Credential;

/// Identity the pipeline runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    bot_id: String,
}

impl AuthContext {
    /// Parse a bot token of the form `<bot_id>:<secret>`
    pub fn resolve(credential: &Credential) -> Result<Self, PipelineError> {
        let (bot_id, secret) = credential
            .expose()
            .split_once(':')
            .ok_or_else(|| invalid("expected `<bot_id>:<secret>`"))?;

        if bot_id.is_empty() || !bot_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("bot id must be numeric"));
        }
        if secret.is_empty() {
            return Err(invalid("secret must not be empty"));
        }

        Ok(Self {
            bot_id: bot_id.to_string(),
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }
}

fn invalid(reason: &str) -> PipelineError {
    PipelineError::InvalidCredential(reason.to_string())
}
