use std::sync::Arc;

use tether_common::{
    config::TimeoutConfig, error::SessionError, internal, outgoing, status::Status, tracing,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session, State, settle};
use crate::{
    auth::{self, AuthError, Authentication, Mechanism},
    hooks::{AuthResponse, Callback, Rejection},
};

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    /// Send a `334` challenge and read the client's answer.
    ///
    /// `None` means the peer hung up mid-exchange.
    async fn challenge(&mut self, prompt: &str) -> Result<Option<String>, SessionError> {
        let line = format!("{} {prompt}", Status::AuthContinue);
        outgoing!("{line}");
        self.connection.send(&line).await?;

        let limit = self.config.timeouts.command_timeout();
        Ok(self
            .next_line(limit)
            .await?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Run the SASL exchange for `mechanism`, returning `None` if the peer
    /// disconnected.
    async fn exchange(
        &mut self,
        mechanism: Mechanism,
        initial: Option<String>,
    ) -> Result<Option<Result<Authentication, AuthError>>, SessionError> {
        let first = match initial {
            Some(initial) => initial,
            None => {
                let prompt = if mechanism == Mechanism::Login {
                    USERNAME_PROMPT
                } else {
                    ""
                };
                let Some(answer) = self.challenge(prompt).await? else {
                    return Ok(None);
                };
                answer
            }
        };

        Ok(Some(match mechanism {
            Mechanism::Plain => auth::decode_plain(&first),
            Mechanism::XOAuth2 => auth::decode_xoauth2(&first),
            Mechanism::Login => {
                let username = match auth::decode_text(&first) {
                    Ok(username) => username,
                    Err(err) => return Ok(Some(Err(err))),
                };

                let Some(answer) = self.challenge(PASSWORD_PROMPT).await? else {
                    return Ok(None);
                };

                auth::decode_text(&answer).and_then(|secret| {
                    if username.is_empty() {
                        Err(AuthError::Malformed(Mechanism::Login))
                    } else {
                        Ok(Authentication::new(Mechanism::Login, username, secret))
                    }
                })
            }
        }))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(mechanism = mechanism))]
    pub(super) async fn authenticate(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Flow, SessionError> {
        if !self.extended {
            self.reply(Status::InvalidCommandSequence, "5.5.1 Send EHLO first")
                .await?;
            return Ok(Flow::Continue);
        }

        if self.authenticated {
            self.reply(Status::InvalidCommandSequence, "5.5.1 Already authenticated")
                .await?;
            return Ok(Flow::Continue);
        }

        if matches!(self.state, State::Mail | State::Rcpt) {
            self.reply(
                Status::InvalidCommandSequence,
                "5.5.1 AUTH not permitted during a mail transaction",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(mechanism) = mechanism
            .parse::<Mechanism>()
            .ok()
            .filter(|mechanism| self.config.auth_methods.contains(mechanism))
        else {
            self.reply(
                Status::ParameterNotImplemented,
                "5.5.4 Unrecognized authentication type",
            )
            .await?;
            return Ok(Flow::Continue);
        };

        if !self.config.auth_permitted(self.connection.is_tls()) {
            self.reply(
                Status::EncryptionRequired,
                "5.7.11 Encryption required for requested authentication mechanism",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let authentication = match self.exchange(mechanism, initial).await? {
            None => return Ok(Flow::Close),
            Some(Ok(authentication)) => authentication,
            Some(Err(AuthError::Cancelled)) => {
                self.reply(Status::ParameterError, "5.7.0 Authentication cancelled")
                    .await?;
                return Ok(Flow::Continue);
            }
            Some(Err(err)) => {
                internal!(level = DEBUG, "Undecodable {mechanism} exchange: {err}");
                self.reply(Status::ParameterError, "5.5.2 Cannot decode response")
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let username = authentication.username.clone();
        let (callback, pending) = Callback::<AuthResponse>::new();
        self.hooks
            .on_auth(authentication, Arc::clone(&self.info), callback);

        match settle(
            pending,
            self.config.timeouts.auth_timeout(),
            Rejection::new(
                Status::TemporaryAuthFailure,
                "4.7.0 Temporary authentication failure",
            ),
        )
        .await
        {
            Ok(response) => {
                self.authenticated = true;
                internal!(
                    level = INFO,
                    "Authenticated as {}",
                    response.user.as_deref().unwrap_or(&username)
                );
                self.reply(Status::AuthSuccessful, "2.7.0 Authentication successful")
                    .await?;
            }
            Err(rejection) => {
                internal!(level = INFO, "Authentication for {username} rejected: {rejection}");
                self.reject(&rejection).await?;
            }
        }

        Ok(Flow::Continue)
    }
}
