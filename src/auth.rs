use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::Actor;

/// Single shared cleartext password. Identity comes from the startup user, see [`actor_for_user`].
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match login.user() {
            Some(user) if !user.is_empty() && user.len() <= MAX_NAME_LEN => {
                Ok(Password::new(None, self.password.as_bytes().to_vec()))
            }
            _ => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("rejected startup without a usable user name");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28000".into(),
                    "a user name is required".into(),
                ))))
            }
        }
    }
}

/// A ULID user name connects as that host; anything else is an invitee.
pub fn actor_for_user(user: Option<&str>) -> Actor {
    match user.and_then(|u| Ulid::from_string(u).ok()) {
        Some(id) => Actor::Host(id),
        None => Actor::Invitee,
    }
}
