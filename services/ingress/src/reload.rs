//! Gateway document hot reload.
//!
//! Polls the document's modification time and republishes the compiled
//! state when it changes. A document that fails to load or compile leaves
//! the running state untouched.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::schema::GatewayDocument;
use crate::state::{GatewayState, SharedState};

/// Load and compile the document at `path`.
pub fn load_state(path: &Path) -> Result<GatewayState> {
    let doc = GatewayDocument::load(path)?;
    GatewayState::compile(&doc)
        .with_context(|| format!("Failed to compile gateway document {}", path.display()))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watch `path` forever, swapping `shared` on every successful reload.
///
/// A version that fails to load is retried on every tick until it loads or
/// the file changes again, so a write caught half-way is picked up even when
/// the final mtime does not move.
pub async fn run_reload_loop(path: &Path, shared: Arc<SharedState>, interval: Duration) {
    let mut last_loaded = modified(path);
    let mut last_failed = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let current = modified(path);
        if current == last_loaded {
            continue;
        }

        let Some(mtime) = current else {
            if last_failed.is_some() || last_loaded.is_some() {
                warn!(path = %path.display(), "Gateway document disappeared; keeping current state");
            }
            last_loaded = None;
            last_failed = None;
            continue;
        };

        match load_state(path) {
            Ok(state) => {
                shared.store(state);
                last_loaded = Some(mtime);
                last_failed = None;
                info!(path = %path.display(), "Gateway document reloaded");
            }
            Err(e) if last_failed == Some(mtime) => {
                debug!(path = %path.display(), error = %format!("{e:#}"), "Reload still failing");
            }
            Err(e) => {
                last_failed = Some(mtime);
                warn!(path = %path.display(), error = %format!("{e:#}"), "Reload failed; keeping current state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::http::{HeaderMap, Method};

    const DOC_A: &str = r#"{"routes": {"a.example.com/": {"service": "svcA"}},
        "services": {"svcA": {"targets": [{"ip": "10.0.0.1", "port": 80}]}}}"#;
    const DOC_B: &str = r#"{"routes": {"b.example.com/": {"service": "svcB"}},
        "services": {"svcB": {"targets": [{"ip": "10.0.0.2", "port": 80}]}}}"#;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sluice-{}-{}.json", name, std::process::id()))
    }

    fn routes(state: &GatewayState, host: &str) -> bool {
        state
            .router
            .route(Some(host), "/", &HeaderMap::new(), &Method::GET)
            .is_some()
    }

    #[test]
    fn test_load_state_reports_missing_file() {
        let err = load_state(Path::new("/nonexistent/sluice.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/sluice.json"));
    }

    #[tokio::test]
    async fn test_reload_swaps_and_keeps_on_error() {
        let path = temp_path("reload");
        std::fs::write(&path, DOC_A).unwrap();
        let shared = Arc::new(SharedState::new(load_state(&path).unwrap()));

        let task = tokio::spawn({
            let path = path.clone();
            let shared = Arc::clone(&shared);
            async move { run_reload_loop(&path, shared, Duration::from_millis(20)).await }
        });

        // Coarse filesystem timestamps need a visible mtime change.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, DOC_B).unwrap();
        let mut swapped = false;
        for _ in 0..100 {
            if routes(&shared.load(), "b.example.com") {
                swapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(swapped);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, "{ not json").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(routes(&shared.load(), "b.example.com"));

        task.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_failed_load_retried_with_same_mtime() {
        let path = temp_path("retry");
        std::fs::write(&path, DOC_A).unwrap();
        let shared = Arc::new(SharedState::new(load_state(&path).unwrap()));

        let task = tokio::spawn({
            let path = path.clone();
            let shared = Arc::clone(&shared);
            async move { run_reload_loop(&path, shared, Duration::from_millis(20)).await }
        });

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, "{ \"routes\": ").unwrap();
        let half_written = std::fs::metadata(&path).unwrap().modified().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(routes(&shared.load(), "a.example.com"));

        // The rest of the write lands without moving the mtime.
        std::fs::write(&path, DOC_B).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(half_written)
            .unwrap();

        let mut swapped = false;
        for _ in 0..100 {
            if routes(&shared.load(), "b.example.com") {
                swapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(swapped);

        task.abort();
        let _ = std::fs::remove_file(&path);
    }
}
