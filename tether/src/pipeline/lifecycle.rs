use std::sync::Arc;

use tether_common::{internal, status::Status};
use tether_smtp::{Rejection, SessionInfo};

use super::{Context, OnEnd, drive};
use crate::{
    events::{Event, EventStream, Reply},
    table,
};

/// Accept connections and envelope commands, and evict sessions as they
/// close or drop their authentication. Evictions still running when the
/// source ends are waited for, so every channel gets its `release`.
pub async fn run(events: EventStream, context: Context) -> Option<Event> {
    drive("lifecycle", events, OnEnd::Drain, |event| match event {
        Event::Connect { session, reply } => {
            internal!(level = DEBUG, "Connection from {} as {}", session.peer, session.id);
            reply.accept();
            None
        }
        Event::MailFrom { reply, .. } | Event::RcptTo { reply, .. } => {
            reply.accept();
            None
        }
        Event::Reset { session, reply } => Some(evict(context.clone(), session, Some(reply))),
        Event::Disconnect { session } => Some(evict(context.clone(), session, None)),
        _ => None,
    })
    .await
}

/// Remove the session's entry and release its channel. `reply` is completed
/// once the channel is gone.
pub async fn evict(context: Context, session: Arc<SessionInfo>, reply: Option<Reply>) {
    let transition = match context.table.apply(table::remove(session.id)).await {
        Ok(transition) => transition,
        Err(err) => {
            internal!(level = DEBUG, "Unable to evict {}: {err}", session.id);
            if let Some(reply) = reply {
                reply.reject(Rejection::new(
                    Status::Unavailable,
                    "4.3.0 Service not available",
                ));
            }
            return;
        }
    };

    for entry in transition.displaced() {
        internal!(level = DEBUG, "Releasing channel for {}", entry.session.id);
        entry.channel.release().await;
    }

    if let Some(reply) = reply {
        reply.accept();
    }
}
