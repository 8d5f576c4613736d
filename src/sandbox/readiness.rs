use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::logs::SharedLogRing;
use super::provider::{PreviewHandle, UrlProbe};
use super::registry::PreviewRegistry;
use super::types::PreviewStatus;

/// Spawn the readiness poll task for a freshly provisioned preview.
///
/// Probes the backend on a fixed interval until it reports a usable URL
/// or the attempt budget runs out. Every outcome is appended to the
/// preview's log ring. The task carries the instance id it was spawned
/// for and stops silently once the preview is replaced or destroyed.
pub fn spawn(
    registry: Arc<PreviewRegistry>,
    project_id: String,
    instance_id: String,
    handle: Arc<dyn PreviewHandle>,
    logs: SharedLogRing,
    public_urls: bool,
    interval: Duration,
    max_attempts: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        for attempt in 1..=max_attempts {
            ticker.tick().await;

            if !registry.is_current(&project_id, &instance_id).await {
                tracing::debug!(
                    project_id = %project_id,
                    "preview replaced or destroyed, stopping readiness poll"
                );
                return;
            }

            match handle.preview_url().await {
                Ok(UrlProbe::Ready(url)) if acceptable_url(&url, public_urls) => {
                    let url = url.trim().to_string();
                    logs.lock().await.push_line(format!(
                        "preview ready at {url} (attempt {attempt}/{max_attempts})"
                    ));
                    let applied = registry
                        .with_current(&project_id, &instance_id, |instance| {
                            instance.preview_url = Some(url.clone());
                            instance.transition(PreviewStatus::Running)
                        })
                        .await;
                    if applied.unwrap_or(false) {
                        tracing::info!(project_id = %project_id, url = %url, "preview running");
                    }
                    return;
                }
                Ok(UrlProbe::Ready(url)) => {
                    logs.lock().await.push_line(format!(
                        "waiting for preview url, got placeholder {:?} (attempt {attempt}/{max_attempts})",
                        url.trim()
                    ));
                }
                Ok(UrlProbe::NotReady) => {
                    logs.lock().await.push_line(format!(
                        "waiting for dev server (attempt {attempt}/{max_attempts})"
                    ));
                }
                Err(e) => {
                    logs.lock().await.push_line(format!(
                        "readiness probe failed: {e} (attempt {attempt}/{max_attempts})"
                    ));
                }
            }
        }

        // Budget exhausted: mark the preview failed. The sandbox itself is
        // left running; teardown stays with destroy / TTL / eviction.
        logs.lock().await.push_line(format!(
            "preview did not become ready within {max_attempts} attempts"
        ));
        let marked = registry
            .with_current(&project_id, &instance_id, |instance| {
                instance.transition(PreviewStatus::Error)
            })
            .await;
        if marked.unwrap_or(false) {
            tracing::warn!(
                project_id = %project_id,
                attempts = max_attempts,
                "preview readiness timed out"
            );
        }
    })
}

/// Whether a backend-reported URL is usable as a preview URL.
///
/// Cloud backends surface placeholder values while their tunnel comes up
/// ("", "initializing", a bare localhost). Those must never be handed to
/// callers as a ready preview.
pub(crate) fn acceptable_url(raw: &str, public_urls: bool) -> bool {
    let url = raw.trim();
    if url.is_empty() {
        return false;
    }
    let lower = url.to_ascii_lowercase();
    if matches!(lower.as_str(), "initializing" | "pending" | "starting" | "null") {
        return false;
    }
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return false;
    }
    if public_urls && is_loopback_host(&lower) {
        return false;
    }
    true
}

fn is_loopback_host(lower_url: &str) -> bool {
    let rest = lower_url.split_once("://").map(|(_, r)| r).unwrap_or("");
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = if authority.starts_with('[') {
        let inner = authority.split(']').next().unwrap_or(authority);
        format!("{inner}]")
    } else {
        authority.split(':').next().unwrap_or(authority).to_string()
    };
    matches!(host.as_str(), "localhost" | "127.0.0.1" | "0.0.0.0" | "[::1]")
}
