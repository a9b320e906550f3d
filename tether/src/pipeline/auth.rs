use std::sync::Arc;

use tether_common::{internal, status::Status, tracing};
use tether_smtp::{Authentication, Rejection, SessionInfo, hooks::AuthResponse};

use super::{Context, OnEnd, drive};
use crate::{
    delivery::OutboundCredentials,
    events::{Event, EventStream, Reply},
    table::{self, Entry},
};

/// Handle `Auth` events until the source ends. In-flight attempts are
/// abandoned at that point; their sessions answer the client themselves.
pub async fn run(events: EventStream, context: Context) -> Option<Event> {
    drive("auth", events, OnEnd::Abort, |event| match event {
        Event::Auth {
            credentials,
            session,
            reply,
        } => Some(authenticate(context.clone(), credentials, session, reply)),
        _ => None,
    })
    .await
}

/// Open a channel with the session's own credentials. Only once the table
/// holds it is the client told it succeeded.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(session = %session.id, user = %credentials.username, mechanism = %credentials.mechanism)
)]
pub async fn authenticate(
    context: Context,
    credentials: Authentication,
    session: Arc<SessionInfo>,
    reply: Reply<AuthResponse>,
) {
    let user = credentials.username.clone();

    let channel = match context.delivery.open(OutboundCredentials::from(credentials)).await {
        Ok(channel) => channel,
        Err(err) => {
            internal!(level = INFO, "Provider refused {user}: {err}");
            reply.reject(err.to_auth_rejection());
            return;
        }
    };

    if !reply.is_pending() {
        internal!(level = DEBUG, "Session went away while its channel was opening");
        channel.release().await;
        return;
    }

    let id = session.id;
    let entry = Entry {
        session,
        channel: Arc::clone(&channel),
    };

    let transition = match context.table.apply(table::insert(id, entry)).await {
        Ok(transition) => transition,
        Err(err) => {
            internal!(level = WARN, "Unable to record channel: {err}");
            channel.release().await;
            reply.reject(Rejection::new(
                Status::TemporaryAuthFailure,
                "4.7.0 Temporary authentication failure",
            ));
            return;
        }
    };

    // A repeated AUTH replaces the session's previous channel
    for displaced in transition.displaced() {
        displaced.channel.release().await;
    }

    let accepted = reply.complete(Ok(AuthResponse {
        user: Some(user.clone()),
    }));

    if accepted {
        internal!(level = INFO, "Authenticated {user}");
    } else {
        internal!(level = DEBUG, "Auth verdict for {user} arrived too late, evicting");
        if let Err(err) = context
            .table
            .apply(table::remove_channel(id, Arc::clone(&channel)))
            .await
        {
            internal!(level = DEBUG, "Eviction skipped: {err}");
        }
        channel.release().await;
    }
}
