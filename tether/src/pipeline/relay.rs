use std::{pin::pin, sync::Arc};

use futures_util::StreamExt;
use tether_common::{internal, tracing};
use tether_smtp::{ByteSource, Envelope, SessionInfo};

use super::{Context, OnEnd, RelayError, drive};
use crate::{
    delivery::{Channel, DeliveryError},
    events::{Claim, Event, EventStream, Reply},
    stream,
    table,
};

/// Handle `Data` events until the source ends, abandoning any relay still in
/// flight.
pub async fn run(events: EventStream, context: Context) -> Option<Event> {
    drive("relay", events, OnEnd::Abort, |event| match event {
        Event::Data {
            source,
            envelope,
            session,
            reply,
        } => Some(relay(context.clone(), source, envelope, session, reply)),
        _ => None,
    })
    .await
}

/// Forward one message and complete its reply with the outcome.
#[tracing::instrument(level = "debug", skip_all, fields(session = %session.id))]
pub async fn relay(
    context: Context,
    source: Claim<ByteSource>,
    envelope: Envelope,
    session: Arc<SessionInfo>,
    reply: Reply,
) {
    match forward(&context, &source, &envelope, &session).await {
        Ok(bytes) => {
            internal!(level = INFO, "Relayed {bytes} bytes");
            reply.accept();
        }
        Err(err) => {
            internal!(level = INFO, "Relay failed: {err}");
            reply.reject(err.to_rejection());
        }
    }
}

async fn forward(
    context: &Context,
    source: &Claim<ByteSource>,
    envelope: &Envelope,
    session: &SessionInfo,
) -> Result<usize, RelayError> {
    // Sampled now, after the event arrived, so the session's own auth is in it
    let snapshot = context.table.snapshot().await?;
    let channel = snapshot
        .get(&session.id)
        .map(|entry| Arc::clone(&entry.channel))
        .ok_or(RelayError::MissingChannel(session.id))?;
    drop(snapshot);

    let source = source.take().ok_or(RelayError::SourceClaimed)?;

    if let Err(err) = channel.begin(envelope).await {
        abandon(context, session, &channel, &err).await;
        return Err(err.into());
    }

    let mut chunks = pin!(stream::from_source(source, context.encoding));
    let mut bytes = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                discard(context, session, &channel).await;
                return Err(err.into());
            }
        };

        if let Err(err) = channel.send(&chunk).await {
            discard(context, session, &channel).await;
            return Err(err.into());
        }
        bytes += chunk.len();
    }

    if let Err(err) = channel.finish().await {
        abandon(context, session, &channel, &err).await;
        return Err(err.into());
    }

    Ok(bytes)
}

/// A reply from the provider leaves the connection in step; anything else
/// means it can no longer be trusted.
async fn abandon(
    context: &Context,
    session: &SessionInfo,
    channel: &Arc<dyn Channel>,
    err: &DeliveryError,
) {
    if !matches!(err, DeliveryError::Rejected { .. }) {
        discard(context, session, channel).await;
    }
}

/// Abort the message and take the channel out of the table, so the session's
/// next message finds no channel rather than a dead one.
async fn discard(context: &Context, session: &SessionInfo, channel: &Arc<dyn Channel>) {
    channel.abort().await;

    let mutation = table::remove_channel(session.id, Arc::clone(channel));
    match context.table.apply(mutation).await {
        Ok(transition) => {
            for entry in transition.displaced() {
                internal!(level = DEBUG, "Releasing aborted channel for {}", entry.session.id);
                entry.channel.release().await;
            }
        }
        Err(err) => internal!(level = DEBUG, "Unable to evict {}: {err}", session.id),
    }
}
