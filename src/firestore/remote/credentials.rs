use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// The identity writes are attributed to. Each user has its own mutation queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which the user's mutation queue is stored. The
    /// unauthenticated user maps to the empty string.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(unauthenticated)"),
        }
    }
}

/// Auth token presented when opening a stream or invoking an RPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub user: User,
}

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Current token, or `None` when no credentials are available.
    async fn get_token(&self) -> FirestoreResult<Option<Token>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);

    /// Registers the listener and calls it with the current user. It is
    /// called again whenever the user changes.
    fn set_change_listener(&self, listener: CredentialChangeListener);

    fn remove_change_listener(&self);
}

/// Provider for clients without authentication.
#[derive(Default, Clone)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }

    fn remove_change_listener(&self) {}
}

struct UserCredentialsState {
    user: User,
    token: Option<String>,
    listener: Option<CredentialChangeListener>,
}

/// Provider whose user and token are set by the embedding application.
pub struct UserCredentialsProvider {
    state: Mutex<UserCredentialsState>,
}

impl UserCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Mutex::new(UserCredentialsState {
                user,
                token,
                listener: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, UserCredentialsState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Switches to `user` and notifies the registered listener.
    pub fn change_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.state();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }
}

#[async_trait]
impl CredentialsProvider for UserCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<Token>> {
        let state = self.state();
        Ok(state.token.as_ref().map(|value| Token {
            value: value.clone(),
            user: state.user.clone(),
        }))
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = {
            let mut state = self.state();
            state.listener = Some(listener.clone());
            state.user.clone()
        };
        listener(user);
    }

    fn remove_change_listener(&self) {
        self.state().listener = None;
    }
}
