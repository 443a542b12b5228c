use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Local terminal the remote session renders into
pub trait TerminalSurface {
    /// Current size, or `None` when it cannot be measured yet
    fn size(&self) -> Option<TerminalSize>;
}

/// Poll `surface` until it reports a non-zero size.
///
/// Opening a session against an unmeasured surface would size the remote
/// PTY to zero, so callers wait here first.
pub async fn wait_for_surface<S>(surface: &S, attempts: u32, interval: Duration) -> Result<TerminalSize>
where
    S: TerminalSurface + ?Sized,
{
    for attempt in 1..=attempts {
        match surface.size() {
            Some(size) if !size.is_empty() => return Ok(size),
            other => debug!("Surface not ready on attempt {}: {:?}", attempt, other),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(TransportError::SurfaceNotReady { attempts })
}
