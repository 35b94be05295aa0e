//! The per-client session state machine.
//!
//! In the style of `rtr/query.rs` (reading and classifying
//! incoming PDUs, pinning the protocol version on the first query) and
//! `rtr/send.rs` (streaming a snapshot or delta out as a run of Prefix
//! PDUs followed by an End of Data), rebuilt around `async`/`await`
//! instead of hand-rolled `futures 0.1` polling.

use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::metrics::RtrServerMetrics;
use crate::payload::{Delta, DiffResult, SharedHistory};

use super::notify::Listener;
use super::pdu::{Pdu, PduError, Timing};
use super::serial::Serial;

/// Read buffer grows to at most this before a client is considered
/// abusive and disconnected.
const MAX_PDU_LEN: usize = 64 * 1024;

/// Read timeout: an idle client that never sends another query still
/// needs to be able to sit connected indefinitely waiting on Notify, so
/// this only bounds a single `read` call, not the whole session.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-client outbound channel capacity. Once full, the writer side is
/// considered unable to keep up and the session is torn down rather than
/// buffering unboundedly.
const OUTBOUND_CAPACITY: usize = 64;

pub struct SessionConfig {
    pub timing: Timing,
    /// Highest RTR version this server will ever pin a client to. The
    /// version actually used is `min(protocol, client's requested version)`.
    pub protocol: u8,
}

/// Runs one client connection to completion.
///
/// `version` is `None` until the client's first query pins it; every PDU
/// the client sends afterwards that claims a different version is a
/// protocol error.
pub async fn run<S>(
    socket: S,
    peer: String,
    history: SharedHistory,
    mut notify: Listener,
    metrics: RtrServerMetrics,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(socket);
    let (tx, mut rx) = mpsc::channel::<Pdu>(OUTBOUND_CAPACITY);

    let writer_peer = peer.clone();
    let mut write_half = write_half;
    let writer = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(pdu) = rx.recv().await {
            pdu.encode(&mut buf);
            if write_half.write_all(&buf).await.is_err() {
                debug!("{}: write failed, closing", writer_peer);
                break;
            }
            buf.clear();
        }
    });

    let mut pinned_version: Option<u8> = None;
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut scratch = [0u8; 4096];

    loop {
        tokio::select! {
            changed = notify.changed() => {
                match changed {
                    Some(serial) => {
                        if let Some(version) = pinned_version {
                            let session_id = history.read().await.session_id();
                            let pdu = Pdu::SerialNotify { version, session: session_id, serial };
                            if tx.send(pdu).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            read = read_with_timeout(&mut read_half, &mut scratch) => {
                match read {
                    Ok(Some(n)) if n > 0 => {
                        read_buf.extend_from_slice(&scratch[..n]);
                        if read_buf.len() > MAX_PDU_LEN {
                            warn!("{}: oversized PDU, closing", peer);
                            break;
                        }
                        if !drain_queries(
                            &mut read_buf, &mut pinned_version, &tx, &history,
                            &metrics, &config, &peer,
                        ).await {
                            break;
                        }
                    }
                    Ok(_) => {
                        info!("{}: connection closed", peer);
                        break;
                    }
                    Err(()) => {
                        debug!("{}: read timed out", peer);
                        break;
                    }
                }
            }
        }
    }

    writer.abort();
}

async fn read_with_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Option<usize>, ()> {
    match timeout(READ_TIMEOUT, reader.read(buf)).await {
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(_)) => Ok(Some(0)),
        Err(_) => Err(()),
    }
}

/// Decodes and handles as many complete PDUs as `read_buf` currently
/// holds. Returns `false` if the session should close.
async fn drain_queries(
    read_buf: &mut BytesMut,
    pinned_version: &mut Option<u8>,
    tx: &mpsc::Sender<Pdu>,
    history: &SharedHistory,
    metrics: &RtrServerMetrics,
    config: &SessionConfig,
    peer: &str,
) -> bool {
    loop {
        let pdu = match Pdu::decode(read_buf) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => return true,
            Err(err) => {
                warn!("{}: {}", peer, err);
                let _ = tx.send(err.to_pdu()).await;
                return false;
            }
        };

        if let Some(version) = *pinned_version {
            if pdu.version() != version {
                let err = PduError::bad_version(version);
                let _ = tx.send(err.to_pdu()).await;
                return false;
            }
        } else if matches!(pdu, Pdu::SerialQuery { .. } | Pdu::ResetQuery { .. }) {
            *pinned_version = Some(pdu.version().min(config.protocol));
        }

        metrics.inc_pdu_received(&pdu);

        match pdu {
            Pdu::SerialQuery { serial, session: client_session, .. } => {
                let version = pinned_version.expect("pinned above");
                let history = history.read().await;
                let session_id = history.session_id();
                let outcome = if client_session != session_id {
                    DiffResult::ResetRequired
                } else {
                    history.diff_since(serial)
                };
                match outcome {
                    DiffResult::UpToDate => {
                        if tx.send(Pdu::CacheResponse { version, session: session_id }).await.is_err() {
                            return false;
                        }
                        let eod = end_of_data(version, session_id, history.serial(), config);
                        if tx.send(eod).await.is_err() {
                            return false;
                        }
                    }
                    DiffResult::Delta(delta) => {
                        if !send_cache_response_and_delta(
                            tx, version, session_id, history.serial(), &delta, config,
                        ).await {
                            return false;
                        }
                    }
                    DiffResult::ResetRequired => {
                        if tx.send(Pdu::CacheReset { version }).await.is_err() {
                            return false;
                        }
                    }
                }
            }
            Pdu::ResetQuery { .. } => {
                let version = pinned_version.expect("pinned above");
                let history = history.read().await;
                let session_id = history.session_id();
                let snapshot = history.current();
                if tx.send(Pdu::CacheResponse { version, session: session_id }).await.is_err() {
                    return false;
                }
                for vrp in snapshot.iter() {
                    if tx.send(Pdu::Prefix { version, flags: Pdu::FLAG_ANNOUNCE, vrp: *vrp }).await.is_err() {
                        return false;
                    }
                }
                let eod = end_of_data(version, session_id, history.serial(), config);
                if tx.send(eod).await.is_err() {
                    return false;
                }
            }
            Pdu::ErrorReport { text, .. } => {
                info!("{}: client reported error: {}", peer, text);
                return false;
            }
            other => {
                warn!("{}: unexpected PDU from client: {:?}", peer, other);
                let err = PduError::corrupt(other.version(), "unexpected PDU from client");
                let _ = tx.send(err.to_pdu()).await;
                return false;
            }
        }
    }
}

async fn send_cache_response_and_delta(
    tx: &mpsc::Sender<Pdu>,
    version: u8,
    session_id: u16,
    serial: Serial,
    delta: &Delta,
    config: &SessionConfig,
) -> bool {
    if tx.send(Pdu::CacheResponse { version, session: session_id }).await.is_err() {
        return false;
    }
    for (vrp, action) in delta.iter() {
        let flags = match action {
            crate::payload::Action::Announce => Pdu::FLAG_ANNOUNCE,
            crate::payload::Action::Withdraw => Pdu::FLAG_WITHDRAW,
        };
        if tx.send(Pdu::Prefix { version, flags, vrp: *vrp }).await.is_err() {
            return false;
        }
    }
    let eod = end_of_data(version, session_id, serial, config);
    tx.send(eod).await.is_ok()
}

fn end_of_data(version: u8, session: u16, serial: Serial, config: &SessionConfig) -> Pdu {
    let timing = if version == 0 { None } else { Some(config.timing) };
    Pdu::EndOfData { version, session, serial, timing }
}
