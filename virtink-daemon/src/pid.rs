//! VMM process discovery via its control socket.

use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

/// PID of the process listening on a Unix socket, from SO_PEERCRED.
pub fn pid_of_socket(path: &Path) -> Result<i32> {
    let stream = UnixStream::connect(path)
        .with_context(|| format!("dial socket {}", path.display()))?;
    let creds = getsockopt(&stream, PeerCredentials).context("get peer credentials")?;
    Ok(creds.pid())
}
