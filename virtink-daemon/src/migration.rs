//! Migration data plane.
//!
//! The VMM emits and consumes its migration byte stream over pod-local Unix
//! sockets; the daemons bridge those sockets with an mTLS TCP tunnel between
//! nodes. The payload is opaque and never interpreted.
//!
//! Each migrating VM owns a control block keyed by its UID. Reconcile passes
//! and the background relay/driver tasks interleave, so the block map sits
//! behind a mutex; terminal transitions cancel both sides and drop the
//! block.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use virtink_api::cloudhypervisor::{Client as ChClient, ReceiveMigrationData, SendMigrationData};

/// Socket paths as the VMM sees them inside its pod.
pub const TX_SOCKET_URL: &str = "unix:/var/run/virtink/tx.sock";
pub const RX_SOCKET_URL: &str = "unix:/var/run/virtink/rx.sock";

#[derive(Default)]
pub struct ControlBlock {
    pub send_cancel: Option<CancellationToken>,
    pub recv_cancel: Option<CancellationToken>,
    send_done: Option<oneshot::Receiver<Result<()>>>,
    recv_done: Option<oneshot::Receiver<Result<()>>>,
}

/// Outcome of a background driver, polled from reconcile passes.
#[derive(Debug, PartialEq)]
pub enum DriverState {
    NotStarted,
    Running,
    Finished,
    Failed(String),
}

impl ControlBlock {
    fn poll_driver(done: &mut Option<oneshot::Receiver<Result<()>>>, started: bool) -> DriverState {
        let Some(rx) = done.as_mut() else {
            return if started {
                DriverState::Finished
            } else {
                DriverState::NotStarted
            };
        };
        match rx.try_recv() {
            Ok(Ok(())) => {
                *done = None;
                DriverState::Finished
            }
            Ok(Err(e)) => {
                *done = None;
                DriverState::Failed(e.to_string())
            }
            Err(oneshot::error::TryRecvError::Empty) => DriverState::Running,
            Err(oneshot::error::TryRecvError::Closed) => {
                *done = None;
                DriverState::Failed("migration driver vanished".into())
            }
        }
    }

    pub fn send_state(&mut self) -> DriverState {
        let started = self.send_cancel.is_some();
        Self::poll_driver(&mut self.send_done, started)
    }

    pub fn recv_state(&mut self) -> DriverState {
        let started = self.recv_cancel.is_some();
        Self::poll_driver(&mut self.recv_done, started)
    }

    pub fn cancel_all(&mut self) {
        if let Some(token) = self.send_cancel.take() {
            token.cancel();
        }
        if let Some(token) = self.recv_cancel.take() {
            token.cancel();
        }
        self.send_done = None;
        self.recv_done = None;
    }
}

/// Per-VM migration control blocks, keyed by VM UID.
#[derive(Default)]
pub struct MigrationControlBlocks {
    blocks: Mutex<HashMap<String, Arc<Mutex<ControlBlock>>>>,
}

impl MigrationControlBlocks {
    pub fn get_or_insert(&self, vm_uid: &str) -> Arc<Mutex<ControlBlock>> {
        let mut blocks = self.blocks.lock().expect("control block map poisoned");
        blocks
            .entry(vm_uid.to_owned())
            .or_insert_with(Default::default)
            .clone()
    }

    pub fn get(&self, vm_uid: &str) -> Option<Arc<Mutex<ControlBlock>>> {
        self.blocks
            .lock()
            .expect("control block map poisoned")
            .get(vm_uid)
            .cloned()
    }

    /// Cancel everything and drop the block; called on terminal transitions.
    pub fn drop_block(&self, vm_uid: &str) {
        let block = {
            let mut blocks = self.blocks.lock().expect("control block map poisoned");
            blocks.remove(vm_uid)
        };
        if let Some(block) = block {
            block.lock().expect("control block poisoned").cancel_all();
            debug!(vm_uid = %vm_uid, "dropped migration control block");
        }
    }
}

/// Target side: TLS listener on an ephemeral port whose connections are
/// relayed into the local receive socket. Returns the bound port.
pub async fn start_tcp_to_socket_relay(
    acceptor: TlsAcceptor,
    socket_path: PathBuf,
    cancel: CancellationToken,
) -> Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))
        .await
        .context("bind migration listener")?;
    let port = listener.local_addr().context("listener address")?.port();
    info!(port, socket = %socket_path.display(), "migration receive tunnel up");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept migration connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "migration connection accepted");
                    let acceptor = acceptor.clone();
                    let socket_path = socket_path.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay_tls_to_unix(acceptor, stream, &socket_path, cancel).await {
                            warn!(error = %e, "migration receive relay");
                        }
                    });
                }
            }
        }
        info!("migration receive tunnel closed");
    });
    Ok(port)
}

async fn relay_tls_to_unix(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    socket_path: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tls = acceptor.accept(stream).await.context("TLS accept")?;
    let mut unix = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("dial {}", socket_path.display()))?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = copy_bidirectional(&mut tls, &mut unix) => {
            result.context("relay stream")?;
            Ok(())
        }
    }
}

/// Source side: Unix listener whose client side is an mTLS dialer to the
/// target daemon.
pub async fn start_socket_to_tcp_relay(
    socket_path: PathBuf,
    connector: TlsConnector,
    target_addr: String,
    cancel: CancellationToken,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("create socket directory")?;
    }
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("remove stale socket"),
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), target = %target_addr, "migration send tunnel up");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept send connection");
                            continue;
                        }
                    };
                    let connector = connector.clone();
                    let target_addr = target_addr.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay_unix_to_tls(stream, connector, &target_addr, cancel).await {
                            warn!(error = %e, "migration send relay");
                        }
                    });
                }
            }
        }
        info!("migration send tunnel closed");
    });
    Ok(())
}

async fn relay_unix_to_tls(
    mut unix: UnixStream,
    connector: TlsConnector,
    target_addr: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let tcp = TcpStream::connect(target_addr)
        .await
        .with_context(|| format!("dial {}", target_addr))?;
    // Verification is by client certificate; the server name is not checked.
    let server_name = ServerName::try_from("virtink-daemon".to_owned()).context("server name")?;
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .context("TLS connect")?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = copy_bidirectional(&mut unix, &mut tls) => {
            result.context("relay stream")?;
            Ok(())
        }
    }
}

/// Start the receive driver: `vm.receive-migration` against the target VMM,
/// reported through the control block.
pub fn start_receive_driver(
    block: &Arc<Mutex<ControlBlock>>,
    ch_socket: PathBuf,
    cancel: CancellationToken,
) {
    let (tx, rx) = oneshot::channel();
    {
        let mut block = block.lock().expect("control block poisoned");
        block.recv_cancel = Some(cancel.clone());
        block.recv_done = Some(rx);
    }
    tokio::spawn(async move {
        let client = ChClient::new(&ch_socket);
        let arg = ReceiveMigrationData {
            receiver_url: RX_SOCKET_URL.to_owned(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = client.vm_receive_migration(&arg) => result.map_err(Into::into),
        };
        let _ = tx.send(result);
    });
}

/// Start the send driver: `vm.send-migration` against the source VMM.
pub fn start_send_driver(
    block: &Arc<Mutex<ControlBlock>>,
    ch_socket: PathBuf,
    cancel: CancellationToken,
) {
    let (tx, rx) = oneshot::channel();
    {
        let mut block = block.lock().expect("control block poisoned");
        block.send_cancel = Some(cancel.clone());
        block.send_done = Some(rx);
    }
    tokio::spawn(async move {
        let client = ChClient::new(&ch_socket);
        let arg = SendMigrationData {
            destination_url: TX_SOCKET_URL.to_owned(),
            local: false,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = client.vm_send_migration(&arg) => result.map_err(Into::into),
        };
        let _ = tx.send(result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_lifecycle() {
        let blocks = MigrationControlBlocks::default();
        let block = blocks.get_or_insert("uid-1");
        assert!(blocks.get("uid-1").is_some());
        assert!(blocks.get("uid-2").is_none());

        {
            let mut block = block.lock().unwrap();
            assert_eq!(block.send_state(), DriverState::NotStarted);
            assert_eq!(block.recv_state(), DriverState::NotStarted);
        }

        blocks.drop_block("uid-1");
        assert!(blocks.get("uid-1").is_none());
    }

    #[tokio::test]
    async fn driver_result_is_observed_once() {
        let blocks = MigrationControlBlocks::default();
        let block = blocks.get_or_insert("uid-1");
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = block.lock().unwrap();
            guard.send_cancel = Some(CancellationToken::new());
            guard.send_done = Some(rx);
            assert_eq!(guard.send_state(), DriverState::Running);
        }

        tx.send(Err(anyhow::anyhow!("peer closed"))).unwrap();
        let mut guard = block.lock().unwrap();
        assert_eq!(
            guard.send_state(),
            DriverState::Failed("peer closed".into())
        );
        // Result already consumed; the driver counts as finished from here.
        assert_eq!(guard.send_state(), DriverState::Finished);
    }

    #[test]
    fn cancel_all_cancels_both_tokens() {
        let block = ControlBlock {
            send_cancel: Some(CancellationToken::new()),
            recv_cancel: Some(CancellationToken::new()),
            ..Default::default()
        };
        let send_token = block.send_cancel.clone().unwrap();
        let recv_token = block.recv_cancel.clone().unwrap();
        let mut block = block;
        block.cancel_all();
        assert!(send_token.is_cancelled());
        assert!(recv_token.is_cancelled());
    }
}
