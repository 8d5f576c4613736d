use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde_json::json;

use crate::sandbox::SandboxError;

use super::AppState;
use super::handlers::ApiError;

const POLL_EVERY: Duration = Duration::from_millis(500);
const BATCH_LIMIT: usize = 100;

/// GET /api/previews/{project_id}/logs/stream — live log lines as SSE.
///
/// Starts from the most recent lines and follows the ring until the
/// preview is destroyed, then emits a final `done` event. A replaced
/// preview (new instance under the same project id) gets a fresh ring,
/// so this stream ends when the instance it was opened against goes
/// away.
pub(crate) async fn stream_logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Some(ring) = state.manager.log_ring(&project_id).await else {
        return Err(super::handlers::error_response(SandboxError::NotFound(
            project_id,
        )));
    };

    let stream = async_stream::stream! {
        let mut cursor = 0u64;
        loop {
            let live = match state.manager.log_ring(&project_id).await {
                Some(current) => std::sync::Arc::ptr_eq(&current, &ring),
                None => false,
            };

            let (lines, next) = ring.lock().await.tail_after(cursor, BATCH_LIMIT);
            cursor = next;
            for line in lines {
                yield Ok(Event::default().data(line));
            }

            if !live {
                yield Ok(Event::default().event("done").data(
                    json!({ "reason": "preview stopped" }).to_string(),
                ));
                break;
            }

            tokio::time::sleep(POLL_EVERY).await;
        }
    };

    Ok(Sse::new(stream))
}
