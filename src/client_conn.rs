// This module contains the client-side transfer driver.
//
// A transfer starts when the caller asks for a put (WRQ) or a get (RRQ). The
// driver owns a freshly bound UDP socket whose ephemeral port is the client's
// TID, posts the initial request to the server's listener port, and then
// alternates between inbound packets and outbound sends until the transfer
// reaches a terminal state. The interesting parts live here:
//
// 1. TID rebinding: the server answers from a port of its own choosing, not
//    from its listener port. The first reply pins that (address, port) pair;
//    anything arriving from elsewhere afterwards gets a courtesy
//    ERROR(Unknown TID) and is otherwise ignored.
// 2. Retransmission: every send arms a deadline at a multiple of the
//    smoothed RTT estimate. Deadlines are absolute, so dropping a stale
//    packet does not stretch the wait. Hitting the deadline retransmits the
//    last packet until the retry budget runs out.
// 3. Finalization: every exit path funnels through `finalize`, which closes
//    the local file, disposes of a download's temporary file (rename into
//    place on success, delete otherwise), and hands the terminal result to
//    the caller exactly once.
//
// What to do with each individual packet is the processor's business; the
// driver only routes.

use crate::processor::{ResultAction, TransferProcessor};
use crate::resolve::{unspecified_bind_addr, wire_addr};
use crate::session::{ClientError, Status, TransferOptions, TransferStats};
use crate::tftp::{self, FileMode, Packet, TftpSocket};
use rand::Rng;
use std::io;
use std::net::{SocketAddr, SocketAddrV6};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::time::Instant;

/// Uploads `local` to the server as `remote`.
///
/// Resolves to the transfer's terminal protocol status, or to a system-level
/// error for failures that never made it onto the wire protocol (resolver,
/// file system, socket).
pub async fn put(
    server: SocketAddrV6,
    local: &Path,
    remote: &str,
    mode: FileMode,
    opts: TransferOptions,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<Status, ClientError> {
    let processor = TransferProcessor::new_for_upload(local, mode).await?;

    let request = Packet::WriteReq {
        path: remote.to_string(),
        mode,
    };

    let handler = TransferHandler::new(server, processor, opts.upload_rtx_mult, opts, cancel, None);
    handler.run(request).await
}

/// Downloads `remote` from the server into `local`.
///
/// The incoming data lands in a temporary file which is atomically renamed
/// over `local` only once the transfer has fully succeeded.
pub async fn get(
    server: SocketAddrV6,
    remote: &str,
    local: &Path,
    mode: FileMode,
    opts: TransferOptions,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<Status, ClientError> {
    // Mail mode addresses a user, not a file; it only makes sense for puts.
    if mode == FileMode::Mail {
        return Err(ClientError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mail mode is only valid for uploads",
        )));
    }

    let tmp = temp_download_path(local)?;
    let processor = TransferProcessor::new_for_download(&tmp, mode).await?;

    let request = Packet::ReadReq {
        path: remote.to_string(),
        mode,
    };

    let handler = TransferHandler::new(
        server,
        processor,
        opts.download_rtx_mult,
        opts,
        cancel,
        Some((tmp, local.to_path_buf())),
    );
    handler.run(request).await
}

/// Creates a cancellation pair. Hand the receiver to `put` or `get`; setting
/// the sender to `true` makes the transfer go terminal with
/// `{0, "Cancelled"}` at its next suspension point.
pub fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// The download's staging file: same file name as the target, but in the
/// system temp directory until the transfer completes.
fn temp_download_path(local: &Path) -> Result<PathBuf, ClientError> {
    let name = local.file_name().ok_or_else(|| {
        ClientError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "local path has no file name",
        ))
    })?;
    Ok(std::env::temp_dir().join(name))
}

/// Attempts to bind a socket on a random ephemeral port until one succeeds.
/// The port becomes the client's TID for this transfer.
fn bind_random_socket(peer: SocketAddrV6) -> TftpSocket {
    let mut bind = unspecified_bind_addr(peer);
    loop {
        bind.set_port(rand::thread_rng().gen_range(1024..65535));
        match TftpSocket::bind(bind) {
            Ok(sock) => return sock,
            Err(e) => log::warn!("Couldn't bind socket: {:#?}", e),
        }
    }
}

async fn send_courtesy_error(
    sock: &mut TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

fn socket_fatal(e: tftp::SocketError) -> ClientError {
    match e {
        tftp::SocketError::IO(e) => ClientError::Io(e),
        other => ClientError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

/// An object responsible for driving one transfer to completion.
struct TransferHandler {
    /// The TFTP socket used to send and receive packets.
    sock: TftpSocket,

    /// Where packets go. Starts as the server's listener port; rebound to
    /// the server's TID on its first reply.
    peer: SocketAddr,
    tid_fixed: bool,

    /// The packet processor for this transfer's direction.
    processor: TransferProcessor,

    opts: TransferOptions,
    stats: TransferStats,

    /// Consecutive retransmissions since the last accepted reply.
    retries: u32,

    /// Retransmission interval multiplier: uploads wait `2 × avg_rtt`,
    /// downloads `5 × avg_rtt`.
    rtx_mult: u32,

    cancel: Option<watch::Receiver<bool>>,

    /// Downloads only: `(temporary file, final destination)`.
    tmp: Option<(PathBuf, PathBuf)>,
}

impl TransferHandler {
    fn new(
        server: SocketAddrV6,
        processor: TransferProcessor,
        rtx_mult: u32,
        opts: TransferOptions,
        cancel: Option<watch::Receiver<bool>>,
        tmp: Option<(PathBuf, PathBuf)>,
    ) -> TransferHandler {
        TransferHandler {
            sock: bind_random_socket(server),
            peer: wire_addr(server),
            tid_fixed: false,
            processor,
            stats: TransferStats::new(&opts),
            opts,
            retries: 0,
            rtx_mult,
            cancel,
            tmp,
        }
    }

    /// Runs the transfer and routes its outcome through `finalize`.
    async fn run(mut self, request: Packet) -> Result<Status, ClientError> {
        let outcome = self.drive(request).await;
        self.finalize(outcome).await
    }

    /// The send/recv/timeout/retry loop shared by both directions.
    async fn drive(&mut self, request: Packet) -> Result<Status, ClientError> {
        log::info!("{:?} {} via {}", request.op_code(), self.peer, self.tid());

        let mut out_packet = request;
        self.sock
            .send(&out_packet, self.peer)
            .await
            .map_err(socket_fatal)?;
        self.stats.mark_sent();
        let mut deadline = self.next_deadline();

        loop {
            let received =
                match recv_or_cancelled(&self.sock, deadline, self.cancel.as_mut()).await {
                    Recv::Cancelled => {
                        log::info!("Transfer to {} cancelled by caller", self.peer);
                        return Ok(Status::cancelled());
                    }
                    Recv::Packet(result) => result,
                };

            let (packet, src) = match received {
                Err(tftp::SocketError::Timeout(_)) => {
                    if self.retries >= self.opts.max_retries {
                        log::warn!(
                            "No response from {} after {} retransmissions, giving up",
                            self.peer,
                            self.retries
                        );
                        return Ok(Status::timed_out());
                    }
                    self.retries += 1;
                    log::debug!(
                        "Timed out waiting on {}, retransmitting (attempt {})",
                        self.peer,
                        self.retries
                    );
                    self.sock
                        .send(&out_packet, self.peer)
                        .await
                        .map_err(socket_fatal)?;
                    self.stats.mark_sent();
                    deadline = self.next_deadline();
                    continue;
                }
                // If we couldn't parse the incoming packet, the session is
                // not salvageable: we cannot even tell what to acknowledge.
                Err(tftp::SocketError::PacketParse(msg)) => {
                    log::warn!("Malformed datagram from peer: {msg}");
                    return Ok(Status::invalid_response());
                }
                Err(tftp::SocketError::IO(e)) => return Err(e.into()),
                Ok(received) => received,
            };

            // The first reply pins the server's transfer TID; everything
            // after that must come from exactly that (address, port).
            if !self.tid_fixed {
                log::debug!("Server TID fixed at {}", src);
                self.peer = src;
                self.tid_fixed = true;
            } else if src != self.peer {
                log::info!("Dropping packet from unexpected source {}", src);
                send_courtesy_error(
                    &mut self.sock,
                    src,
                    tftp::ErrorCode::UnknownTid,
                    "Unknown TID.".to_string(),
                )
                .await;
                continue;
            }

            match self.processor.process(&packet).await {
                Err(e) => {
                    send_courtesy_error(
                        &mut self.sock,
                        self.peer,
                        tftp::ErrorCode::Undefined,
                        format!("{e}"),
                    )
                    .await;
                    return Err(e.into());
                }
                Ok(ResultAction::SendAndAwait(p)) => {
                    self.stats.observe_round_trip(&self.opts);
                    self.retries = 0;
                    out_packet = p;
                    self.sock
                        .send(&out_packet, self.peer)
                        .await
                        .map_err(socket_fatal)?;
                    self.stats.mark_sent();
                    deadline = self.next_deadline();
                }
                Ok(ResultAction::Resend(p)) => {
                    out_packet = p;
                    self.sock
                        .send(&out_packet, self.peer)
                        .await
                        .map_err(socket_fatal)?;
                    self.stats.mark_sent();
                    deadline = self.next_deadline();
                }
                Ok(ResultAction::RetryRecv) => continue,
                Ok(ResultAction::Terminate(status)) => return Ok(status),
                Ok(ResultAction::TerminateWithPacket(p, status)) => {
                    let _ = self.sock.send(&p, self.peer).await;
                    return Ok(status);
                }
            }
        }
    }

    /// The single exit path, reached exactly once per transfer: releases the
    /// file handle, settles the temporary file, and yields the result. The
    /// socket dies with the handler.
    async fn finalize(self, outcome: Result<Status, ClientError>) -> Result<Status, ClientError> {
        let TransferHandler { processor, tmp, .. } = self;

        // Close the output file before renaming or deleting it.
        drop(processor);

        let Some((tmp, local)) = tmp else {
            return outcome;
        };

        match outcome {
            Ok(status) if status.is_success() => {
                if let Err(e) = tokio::fs::rename(&tmp, &local).await {
                    log::warn!("Could not move {} into place: {e}", tmp.display());
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
                Ok(status)
            }
            other => {
                let _ = tokio::fs::remove_file(&tmp).await;
                other
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        Instant::now() + self.rtx_mult * self.stats.avg_rtt()
    }

    fn tid(&self) -> u16 {
        self.sock.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

enum Recv {
    Packet(tftp::TftpResult<(Packet, SocketAddr)>),
    Cancelled,
}

async fn recv_or_cancelled(
    sock: &TftpSocket,
    deadline: Instant,
    cancel: Option<&mut watch::Receiver<bool>>,
) -> Recv {
    match cancel {
        Some(rx) => {
            tokio::select! {
                result = sock.recv_until(deadline) => Recv::Packet(result),
                _ = cancelled(rx) => Recv::Cancelled,
            }
        }
        None => Recv::Packet(sock.recv_until(deadline).await),
    }
}

/// Resolves once the caller flips the cancellation flag. Pends forever if
/// the handle was dropped without firing, so an abandoned handle never
/// aborts a transfer.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
