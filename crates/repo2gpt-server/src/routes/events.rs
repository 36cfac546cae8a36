//! `GET /jobs/{id}/events`: the job's event log as Server-Sent Events.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt};
use repo2gpt_core::ids::JobId;
use repo2gpt_engine::SubscriptionItem;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::routes::jobs::AfterParams;
use crate::server::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

/// Resume offset: a reconnecting client's `Last-Event-ID` wins over `?after=`.
fn start_offset(headers: &HeaderMap, query: &AfterParams) -> u64 {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.after)
        .unwrap_or(0)
}

fn to_sse(item: SubscriptionItem) -> Event {
    match item {
        SubscriptionItem::Heartbeat => Event::default().comment("keep-alive"),
        SubscriptionItem::Event(event) => {
            let base = Event::default()
                .id(event.id.to_string())
                .event(event.kind.to_string());
            match base.json_data(&event) {
                Ok(sse) => sse,
                Err(e) => {
                    warn!(job_id = %event.job_id, event_id = event.id, error = %e, "unencodable event");
                    Event::default().comment("unencodable event")
                }
            }
        }
    }
}

pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AfterParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = JobId::from_raw(id);
    let after = start_offset(&headers, &query);
    debug!(job_id = %id, after, "event stream opened");

    let items = state.subscriptions.subscribe(id, after)?;
    let stream = items
        .map(|item| Ok::<_, Infallible>(to_sse(item)))
        .take_until(state.shutdown.clone().cancelled_owned());
    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_offset_beats_query() {
        let mut headers = HeaderMap::new();
        let query = AfterParams { after: Some(3) };
        assert_eq!(start_offset(&headers, &query), 3);

        headers.insert(LAST_EVENT_ID, "7".parse().unwrap());
        assert_eq!(start_offset(&headers, &query), 7);

        assert_eq!(start_offset(&HeaderMap::new(), &AfterParams { after: None }), 0);
    }
}
