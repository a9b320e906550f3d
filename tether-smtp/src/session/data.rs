use std::sync::Arc;

use tether_common::{
    config::TimeoutConfig, error::SessionError, internal, status::Status, tracing,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session, State, settle};
use crate::{
    connection::DataTerminator,
    hooks::{Callback, Rejection},
    source::{self, SourceError, SourceWriter},
};

/// Fail the source if it is still attached.
async fn fail(writer: &mut Option<SourceWriter>, error: SourceError) {
    if let Some(writer) = writer.take() {
        writer.error(error).await;
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    /// Stream the message body into the data hook while reading it off the
    /// wire, then answer with the hook's verdict.
    #[tracing::instrument(level = "debug", skip_all, fields(session = %self.info.id))]
    pub(super) async fn receive_data(&mut self) -> Result<Flow, SessionError> {
        self.reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let (writer, byte_source) = source::channel();
        let (callback, pending) = Callback::new();
        let envelope = std::mem::take(&mut self.envelope);
        self.state = State::Greeted;

        self.hooks
            .on_data(byte_source, Arc::clone(&self.info), envelope, callback);

        let limit = self.config.max_message_size;
        let block = self.config.timeouts.data_timeout();
        let mut writer = Some(writer);
        let mut terminator = DataTerminator::default();
        let mut received = 0_usize;
        let mut overflow = false;

        loop {
            let read = tokio::time::timeout(block, self.connection.read_data(&mut terminator)).await;

            let read = match read {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => {
                    fail(&mut writer, SourceError::Truncated).await;
                    return Err(err.into());
                }
                Err(_) => {
                    fail(&mut writer, SourceError::Timeout).await;
                    let _ = self
                        .reply(Status::Unavailable, "4.4.2 Timeout waiting for data")
                        .await;
                    return Err(SessionError::Timeout(block.as_secs()));
                }
            };

            let Some((chunk, finished)) = read else {
                internal!(level = DEBUG, "Peer closed the connection during DATA");
                fail(&mut writer, SourceError::Truncated).await;
                return Ok(Flow::Close);
            };

            received = received.saturating_add(chunk.len());
            if limit > 0 && received > limit && !overflow {
                overflow = true;
                fail(&mut writer, SourceError::TooLarge { limit }).await;
            }

            // A consumer that stopped reading still gets the rest of the
            // message drained off the wire
            if let Some(active) = writer.as_ref()
                && !active.data(chunk).await
            {
                writer = None;
            }

            if finished {
                break;
            }
        }

        if let Some(writer) = writer.take() {
            writer.end().await;
        }

        internal!(level = DEBUG, "Received {received} bytes of message data");

        if overflow {
            return self
                .reply(
                    Status::ExceededStorage,
                    format!("5.3.4 Message exceeds maximum size of {limit} bytes"),
                )
                .await
                .map(|()| Flow::Continue);
        }

        match settle(
            pending,
            self.config.timeouts.data_termination_timeout(),
            Rejection::temporary("4.3.0 Message could not be relayed"),
        )
        .await
        {
            Ok(()) => self.reply(Status::Ok, "2.0.0 Message accepted").await?,
            Err(rejection) => self.reject(&rejection).await?,
        }

        Ok(Flow::Continue)
    }
}
