//! SASL authentication run during the connection handshake.
//!
//! When the server answers STARTUP with AUTHENTICATE, the connection asks the
//! configured [`AuthenticatorProvider`] for an initial token, then loops on
//! AUTH_RESPONSE / AUTH_CHALLENGE until the server sends AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// One authentication exchange, driven by the server's challenges.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an AUTH_CHALLENGE. The token is protocol specific and
    /// may be absent or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called once the server sent AUTH_SUCCESS.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s. Every opened connection that the
/// server asks to authenticate starts its own session.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user` for [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial token and the session that handles the rest
    /// of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication (SASL PLAIN), accepted by the
/// password authenticator of Cassandra-compatible servers.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    // authzid (empty), authcid and password, each preceded by NUL.
    fn initial_token(&self) -> Vec<u8> {
        let mut response =
            BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
