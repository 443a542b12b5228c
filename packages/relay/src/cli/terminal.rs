use anyhow::{Context, Result};
use nix::sys::termios::{self, SetArg, Termios};
use std::os::fd::AsRawFd;
use term_transport::{TerminalSize, TerminalSurface};
use tracing::{debug, warn};

nix::ioctl_read_bad!(read_window_size, nix::libc::TIOCGWINSZ, nix::libc::winsize);

/// Keeps stdin in raw mode while alive and restores the saved settings on
/// drop. Without a terminal on stdin it does nothing.
pub struct RawMode {
    saved: Option<Termios>,
}

impl RawMode {
    pub fn enable() -> Self {
        let stdin = std::io::stdin();
        let saved = match termios::tcgetattr(&stdin) {
            Ok(saved) => saved,
            Err(e) => {
                debug!("stdin has no terminal settings ({}), leaving it as is", e);
                return Self { saved: None };
            }
        };

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
            warn!("Failed to switch stdin to raw mode: {}", e);
            return Self { saved: None };
        }
        Self { saved: Some(saved) }
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let stdin = std::io::stdin();
            if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &saved) {
                warn!("Failed to restore terminal settings: {}", e);
            }
        }
    }
}

/// Size of the terminal stdout is attached to
pub fn stdout_size() -> Result<TerminalSize> {
    let mut ws = nix::libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `ws` outlives the call and has the layout TIOCGWINSZ fills
    unsafe { read_window_size(std::io::stdout().as_raw_fd(), &mut ws) }
        .context("stdout is not a terminal")?;
    Ok(TerminalSize::new(ws.ws_col, ws.ws_row))
}

/// The controlling terminal on stdout; unmeasurable until it reports a
/// non-zero size
pub struct StdoutSurface;

impl TerminalSurface for StdoutSurface {
    fn size(&self) -> Option<TerminalSize> {
        stdout_size().ok()
    }
}
