//! Users, authentication, and sessions.

use reqwest::Method;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::client::Body;
use crate::{Client, Deferred, ErrorCode, NimbusError, Record, RecordKind, RequestOptions};

const SESSION_TOKEN_KEY: &str = "sessionToken";

/// A `_User` record with typed accessors for the account fields.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    record: Record,
}

impl Default for User {
    fn default() -> Self {
        Self {
            record: Record::new(RecordKind::User),
        }
    }
}

impl User {
    /// An unsaved user ready for [`Client::sign_up`].
    pub fn new(username: &str, password: &str) -> Self {
        let mut user = Self::default();
        user.set_username(username).set_password(password);
        user
    }

    /// Wrap a record of kind `_User`.
    pub fn from_record(record: Record) -> Result<Self, NimbusError> {
        if record.kind() != &RecordKind::User {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidClassName,
                format!("expected a _User record, got {}", record.kind()),
            ));
        }
        Ok(Self { record })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn id(&self) -> Option<&str> {
        self.record.id()
    }

    pub fn username(&self) -> Option<&str> {
        self.record.get("username").and_then(Value::as_str)
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.record.set("username", username);
        self
    }

    pub fn email(&self) -> Option<&str> {
        self.record.get("email").and_then(Value::as_str)
    }

    pub fn set_email(&mut self, email: &str) -> &mut Self {
        self.record.set("email", email);
        self
    }

    /// The password is write-only; it is never readable back.
    pub fn set_password(&mut self, password: &str) -> &mut Self {
        self.record.set("password", password);
        self
    }

    pub fn session_token(&self) -> Option<&str> {
        self.record.get(SESSION_TOKEN_KEY).and_then(Value::as_str)
    }

    /// Whether this user holds a session (signed up, logged in, or became).
    pub fn authenticated(&self) -> bool {
        self.id().is_some() && self.session_token().is_some()
    }

    fn from_login_response(data: Map<String, Value>) -> Result<Self, NimbusError> {
        let user = Self::from_record(Record::from_server(RecordKind::User, data)?)?;
        if user.session_token().is_none() {
            return Err(NimbusError::InvalidResponse(
                "login response is missing sessionToken".to_string(),
            ));
        }
        Ok(user)
    }
}

/// A `_Session` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    record: Record,
}

impl Session {
    pub fn from_record(record: Record) -> Result<Self, NimbusError> {
        if record.kind() != &RecordKind::Session {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidClassName,
                format!("expected a _Session record, got {}", record.kind()),
            ));
        }
        Ok(Self { record })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn session_token(&self) -> Option<&str> {
        self.record.get(SESSION_TOKEN_KEY).and_then(Value::as_str)
    }

    /// Whether the token is a revocable (`r:`) session token.
    pub fn is_revocable(&self) -> bool {
        self.session_token().is_some_and(is_revocable_token)
    }
}

pub fn is_revocable_token(token: &str) -> bool {
    token.starts_with("r:")
}

impl Client {
    async fn install_current_user(&self, user: &User) {
        *self.current_user_slot().await = Some(user.clone());
        info!(user = ?user.id(), "current user changed");
    }

    /// Create an account and log in as it.
    pub fn sign_up(&self, user: User, options: RequestOptions) -> Deferred<User> {
        if user.username().is_none_or(str::is_empty) {
            return Deferred::rejected(NimbusError::invalid(
                ErrorCode::UsernameMissing,
                "cannot sign up user with an empty username",
            ));
        }
        let password = user.record().get("password").and_then(Value::as_str);
        if password.is_none_or(str::is_empty) {
            return Deferred::rejected(NimbusError::invalid(
                ErrorCode::PasswordMissing,
                "cannot sign up user with an empty password",
            ));
        }

        let client = self.clone();
        Deferred::spawn(async move {
            let mut record = client.save_record(user.into_record(), &options).await?;
            record.forget("password");
            let user = User::from_record(record)?;
            client.install_current_user(&user).await;
            Ok(user)
        })
    }

    /// Log in with a username and password.
    pub fn log_in(&self, username: &str, password: &str, options: RequestOptions) -> Deferred<User> {
        let client = self.clone();
        let body = json!({ "username": username, "password": password });
        Deferred::spawn(async move {
            let data: Map<String, Value> = client
                .request(Method::POST, "login", &[], Body::Json(body), &options)
                .await?;
            let user = User::from_login_response(data)?;
            client.install_current_user(&user).await;
            Ok(user)
        })
    }

    /// Log in with an existing session token.
    pub fn become_user(&self, session_token: &str) -> Deferred<User> {
        let client = self.clone();
        let options = RequestOptions::with_session_token(session_token);
        let token = session_token.to_string();
        Deferred::spawn(async move {
            let mut data: Map<String, Value> = client
                .request(Method::GET, "users/me", &[], Body::Empty, &options)
                .await?;
            data.entry(SESSION_TOKEN_KEY).or_insert(Value::from(token));
            let user = User::from_login_response(data)?;
            client.install_current_user(&user).await;
            Ok(user)
        })
    }

    /// Forget the current user and revoke its session on the server.
    ///
    /// An already invalid session still counts as logged out.
    pub fn log_out(&self) -> Deferred<()> {
        let client = self.clone();
        Deferred::spawn(async move {
            let previous = client.current_user_slot().await.take();
            let Some(token) = previous
                .as_ref()
                .and_then(|u| u.session_token().map(str::to_string))
            else {
                return Ok(());
            };

            let options = RequestOptions::with_session_token(token);
            match client
                .request::<Value>(Method::POST, "logout", &[], Body::Empty, &options)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if e.code() == ErrorCode::InvalidSessionToken => {
                    debug!("session already invalid at logout");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Send a password reset email.
    pub fn request_password_reset(&self, email: &str, options: RequestOptions) -> Deferred<()> {
        if email.trim().is_empty() {
            return Deferred::rejected(NimbusError::invalid(
                ErrorCode::EmailMissing,
                "an email address is required",
            ));
        }
        let client = self.clone();
        let body = json!({ "email": email });
        Deferred::spawn(async move {
            let _: Value = client
                .request(Method::POST, "requestPasswordReset", &[], Body::Json(body), &options)
                .await?;
            Ok(())
        })
    }

    /// The session of the current user.
    pub fn current_session(&self, options: RequestOptions) -> Deferred<Session> {
        let client = self.clone();
        Deferred::spawn(async move {
            let token = match &options.session_token {
                Some(token) => Some(token.clone()),
                None => client
                    .current_user()
                    .await
                    .and_then(|u| u.session_token().map(str::to_string)),
            };
            let Some(token) = token else {
                return Err(NimbusError::invalid(
                    ErrorCode::SessionMissing,
                    "no current user to fetch a session for",
                ));
            };

            let options = RequestOptions {
                session_token: Some(token),
                ..options
            };
            let data: Map<String, Value> = client
                .request(Method::GET, "sessions/me", &[], Body::Empty, &options)
                .await?;
            Session::from_record(Record::from_server(RecordKind::Session, data)?)
        })
    }
}
