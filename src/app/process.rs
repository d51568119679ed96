//! Process-wide startup configuration
//!
//! Applied once from `main`, before the job starts:
//! - file-creation mask `0o002`, so files written by any rank stay
//!   group-writable;
//! - a `SIGALRM` handler that only logs. Batch schedulers send it as a
//!   wall-clock warning and the default action would kill the rank.

use anyhow::Result;

/// File-creation mask installed at startup
pub const FILE_MODE_MASK: u32 = 0o002;

#[cfg(unix)]
pub fn configure_process() -> Result<()> {
    use nix::sys::stat::{umask, Mode};
    use signal_hook::consts::SIGALRM;
    use signal_hook::iterator::Signals;
    use tracing::{debug, warn};

    let previous = umask(Mode::from_bits_truncate(FILE_MODE_MASK as nix::libc::mode_t));
    debug!(
        "File-creation mask set to {:03o} (was {:03o})",
        FILE_MODE_MASK,
        previous.bits()
    );

    let mut signals = Signals::new([SIGALRM])?;
    std::thread::spawn(move || {
        for sig in signals.forever() {
            warn!("Received signal {} on {}", sig, crate::comm::node_id());
        }
    });

    Ok(())
}

#[cfg(not(unix))]
pub fn configure_process() -> Result<()> {
    Ok(())
}
