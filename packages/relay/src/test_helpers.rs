use agent_stream::{MultiplexerConfig, ProcessStreamMultiplexer};
use pty_manager::PtyManager;
use std::sync::Arc;

use crate::AppState;
use crate::config::FileConfig;
use crate::metrics::ServerMetrics;

/// Build an `AppState` whose agent binary does not exist, so chat requests
/// exercise the error path without spawning anything. Terminals run `/bin/sh`.
///
/// Callers must hold the `TempDir` for the lifetime of the test.
pub fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut multiplexer = MultiplexerConfig::new(
        tmp.path().join("no-such-agent").to_string_lossy().into_owned(),
        tmp.path().join("claude"),
    );
    multiplexer.telemetry_log = Some(tmp.path().join("logs/telemetry.jsonl"));

    let mut config = FileConfig::default();
    config.terminal.shell = Some("/bin/sh".into());

    let state = AppState {
        pty_manager: Arc::new(PtyManager::new()),
        multiplexer: Arc::new(ProcessStreamMultiplexer::new(multiplexer)),
        config: Arc::new(config),
        metrics: Arc::new(ServerMetrics::new()),
    };

    (state, tmp)
}
