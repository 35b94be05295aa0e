//! RTR over SSH.
//!
//! None of the example pack's primary repos serve anything over SSH;
//! `russh` (the embedded, pure-Rust SSH transport picked up from the
//! `rsync`-flavoured manifest in the retrieval pack) is the stack's only
//! attested SSH crate, so the server-side session here is built directly
//! against its `server::Handler` callback API instead of a stream type.
//!
//! A client that completes auth gets its one `session` channel wired to a
//! `tokio::io::duplex` pair: bytes the client sends arrive through
//! `Handler::data` and are pushed into the duplex's write half; the RTR
//! session (running on the other half, same [`super::session::run`] every
//! other transport uses) writes its PDUs back out, which a pump task
//! drains and forwards through `Session::data`.

use std::fs;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Server as RusshServer, Session};
use russh::{Channel, ChannelId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::config::SshAuth;
use crate::error::ExitError;
use crate::metrics::RtrServerMetrics;
use crate::payload::SharedHistory;

use super::notify::Notifier;
use super::pdu::Timing;
use super::session::{self, SessionConfig};

pub async fn run_listener(
    listener: StdListener,
    addr: SocketAddr,
    key_path: PathBuf,
    auth: SshAuth,
    history: SharedHistory,
    notifier: Notifier,
    metrics: RtrServerMetrics,
    timing: Timing,
    protocol: u8,
    maxconn: usize,
) {
    let key = match load_host_key(&key_path) {
        Ok(key) => key,
        Err(err) => {
            error!("Fatal: failed to load SSH host key {}: {}", key_path.display(), err);
            return;
        }
    };

    let mut config = russh::server::Config::default();
    config.keys.push(key);
    let config = Arc::new(config);

    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed on RTR SSH listener: {}", err);
            return;
        }
    };
    info!("RTR SSH listener started on {:?}", listener.local_addr());

    let mut server = RtrSshServer {
        auth: Arc::new(auth),
        history,
        notifier: Arc::new(notifier),
        metrics: metrics.clone(),
        timing,
        protocol,
    };

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("Failed to accept RTR SSH connection: {}", err);
                continue;
            }
        };
        if !metrics.try_open_connection(addr, maxconn) {
            warn!("{}: rejected, at maxconn ({})", peer, maxconn);
            continue;
        }
        let config = config.clone();
        let handler = server.new_client(Some(peer));
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = russh::server::run_stream(config, socket, handler).await {
                warn!("{}: SSH session ended with error: {}", peer, err);
            }
            metrics.inc_conn_close(addr);
        });
    }
}

/// Checks `presented`'s SHA-256 fingerprint against every entry in an
/// `authorized_keys`-format file, matching OpenSSH's "match => accept,
/// no-match => reject" contract for public-key authentication.
fn authorized_key_matches(file: &Path, presented: &PublicKey) -> std::io::Result<bool> {
    let data = fs::read_to_string(file)?;
    let wanted = presented.fingerprint(HashAlg::Sha256);
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Ok(key) = PublicKey::from_openssh(line) {
            if key.fingerprint(HashAlg::Sha256) == wanted {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn load_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey, ExitError> {
    russh::keys::load_secret_key(path, None).map_err(|err| {
        error!("Fatal: error reading SSH host key {}: {}", path.display(), err);
        ExitError::Generic
    })
}

#[derive(Clone)]
struct RtrSshServer {
    auth: Arc<SshAuth>,
    history: SharedHistory,
    notifier: Arc<Notifier>,
    metrics: RtrServerMetrics,
    timing: Timing,
    protocol: u8,
}

impl RusshServer for RtrSshServer {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer: Option<std::net::SocketAddr>) -> SessionHandler {
        SessionHandler {
            peer: peer.map(|a| a.to_string()).unwrap_or_else(|| "ssh-client".to_string()),
            auth: self.auth.clone(),
            history: self.history.clone(),
            notifier: self.notifier.clone(),
            metrics: self.metrics.clone(),
            timing: self.timing,
            protocol: self.protocol,
            channel_writer: None,
        }
    }
}

struct SessionHandler {
    peer: String,
    auth: Arc<SshAuth>,
    history: SharedHistory,
    notifier: Arc<Notifier>,
    metrics: RtrServerMetrics,
    timing: Timing,
    protocol: u8,
    /// The write half of the duplex feeding the client's bytes into the
    /// RTR session, set once the session channel has been opened.
    channel_writer: Option<Arc<Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>>>,
}

impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(match self.auth.as_ref() {
            SshAuth::Bypass => Auth::Accept,
            _ => Auth::reject(),
        })
    }

    async fn auth_password(
        &mut self, user: &str, password: &str,
    ) -> Result<Auth, Self::Error> {
        Ok(match self.auth.as_ref() {
            SshAuth::Password { user: want_user, password: want_password } => {
                if user == want_user && password == want_password {
                    Auth::Accept
                } else {
                    Auth::reject()
                }
            }
            _ => Auth::reject(),
        })
    }

    async fn auth_publickey(
        &mut self, user: &str, key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let _ = user;
        Ok(match self.auth.as_ref() {
            SshAuth::AuthorizedKey { file } => {
                match authorized_key_matches(file, key) {
                    Ok(true) => Auth::Accept,
                    Ok(false) => Auth::reject(),
                    Err(err) => {
                        error!("failed to read authorized_keys file {}: {}", file.display(), err);
                        Auth::reject()
                    }
                }
            }
            _ => Auth::reject(),
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // `bridge` is our end: client bytes get written into it (by
        // `data()`) and the RTR session's replies get read back out of it
        // and pumped onto the SSH channel below. `inner` is handed to the
        // RTR session as its socket.
        let (bridge, inner) = tokio::io::duplex(8192);
        let (mut bridge_read, bridge_write) = tokio::io::split(bridge);
        self.channel_writer = Some(Arc::new(Mutex::new(bridge_write)));

        let peer = self.peer.clone();
        let history = self.history.clone();
        let listener = self.notifier.subscribe();
        let metrics = self.metrics.clone();
        let timing = self.timing;
        let protocol = self.protocol;
        let channel_id = channel.id();
        let handle = session.handle();

        tokio::spawn(async move {
            session::run(
                inner, peer, history, listener, metrics, SessionConfig { timing, protocol },
            ).await;
            let _ = handle.close(channel_id).await;
        });

        let pump_handle = session.handle();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match bridge_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if pump_handle.data(channel_id, buf[..n].to_vec().into()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = channel;
        if let Some(writer) = &self.channel_writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(data).await;
        }
        Ok(())
    }
}
