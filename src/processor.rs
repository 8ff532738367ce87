use crate::netascii;
use crate::session::Status;
use crate::tftp::{self, FileMode, Packet, BLOCK_SIZE};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// An entity that consumes the peer's packets for one transfer and produces
/// the client's next move.
///
/// The upload side consumes ACKs and produces DATA; the download side
/// consumes DATA and produces ACKs. These are similar enough to expose one
/// API to the connection driver, but what happens to the local file and to
/// the block counter is distinct per direction.
#[derive(Debug)]
pub enum TransferProcessor {
    Upload(UploadProcessor),
    Download(DownloadProcessor),
}

impl TransferProcessor {
    /// Opens `path` for reading and prepares to serve it as DATA blocks.
    pub async fn new_for_upload(path: &Path, mode: FileMode) -> Result<TransferProcessor, io::Error> {
        let f = File::open(path).await?;
        Ok(TransferProcessor::Upload(UploadProcessor::new(f, mode)))
    }

    /// Creates `path` (the transfer's temporary file) and prepares to fill it
    /// from DATA blocks.
    pub async fn new_for_download(path: &Path, mode: FileMode) -> Result<TransferProcessor, io::Error> {
        let f = File::create(path).await?;
        Ok(TransferProcessor::Download(DownloadProcessor::new(f, mode)))
    }

    /// Given an incoming packet, processes it and describes the action the
    /// caller should take. Local file failures surface as `io::Error`.
    pub async fn process(&mut self, packet: &Packet) -> Result<ResultAction, io::Error> {
        match self {
            TransferProcessor::Upload(p) => p.process_ack(packet).await,
            TransferProcessor::Download(p) => p.process_data(packet).await,
        }
    }
}

/// Represents an action that the caller of TransferProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet, re-arm the retransmission timer, and
    /// await a response. The reply that produced this was fresh progress:
    /// the round trip counts toward the RTT estimate and the retry counter
    /// starts over.
    SendAndAwait(Packet),

    /// Caller should re-send the packet and re-arm the timer, but the reply
    /// was a duplicate of one already handled: no RTT observation, no retry
    /// reset.
    Resend(Packet),

    /// Caller should drop the packet and keep waiting on the current timer.
    RetryRecv,

    /// The transfer is over; nothing further goes on the wire.
    Terminate(Status),

    /// Caller should send one final packet, then the transfer is over.
    TerminateWithPacket(Packet, Status),
}

fn status_from_error(code: tftp::ErrorCode, message: &str) -> Status {
    Status {
        code: code.as_u16(),
        message: message.to_string(),
    }
}

#[derive(Debug)]
pub struct UploadProcessor {
    f: File,
    curr_block: u16,
    awaiting_final_ack: bool,
    encoder: Option<netascii::Encoder>,

    /// Encoded bytes that did not fit in the previous payload. NETASCII can
    /// expand one input byte into two, so a 512-byte read may stage more
    /// than one block's worth.
    staged: Vec<u8>,
    reached_eof: bool,
}

impl UploadProcessor {
    fn new(f: File, mode: FileMode) -> UploadProcessor {
        UploadProcessor {
            f,
            curr_block: 0,
            awaiting_final_ack: false,
            encoder: mode.is_text().then(netascii::Encoder::new),
            staged: Vec::with_capacity(2 * BLOCK_SIZE),
            reached_eof: false,
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> Result<ResultAction, io::Error> {
        match packet {
            &Packet::Ack { block } => {
                if block != self.curr_block {
                    // Duplicate or future ACK. Either way it is not ours to
                    // act on, and the retransmission timer stays put.
                    return Ok(ResultAction::RetryRecv);
                }

                if self.awaiting_final_ack {
                    return Ok(ResultAction::Terminate(Status::success()));
                }

                let data = self.next_payload().await?;
                self.curr_block = self.curr_block.wrapping_add(1);
                if data.len() < BLOCK_SIZE {
                    // A short block is the EOF signal; it still needs its ACK.
                    self.awaiting_final_ack = true;
                }

                Ok(ResultAction::SendAndAwait(Packet::Data {
                    block: self.curr_block,
                    data,
                }))
            }
            Packet::Error { code, message } => {
                Ok(ResultAction::Terminate(status_from_error(*code, message)))
            }
            _ => Ok(ResultAction::RetryRecv),
        }
    }

    /// Produces the next DATA payload: up to 512 bytes of (mode-encoded)
    /// file content, strictly fewer only at end of file.
    async fn next_payload(&mut self) -> Result<Vec<u8>, io::Error> {
        while self.staged.len() < BLOCK_SIZE && !self.reached_eof {
            let chunk = read_block_from_file(&mut self.f, BLOCK_SIZE).await?;

            match &mut self.encoder {
                Some(encoder) => encoder.encode(&chunk, &mut self.staged),
                None => self.staged.extend_from_slice(&chunk),
            }

            if chunk.len() < BLOCK_SIZE {
                if let Some(encoder) = &mut self.encoder {
                    encoder.finish(&mut self.staged);
                }
                self.reached_eof = true;
            }
        }

        let take = self.staged.len().min(BLOCK_SIZE);
        Ok(self.staged.drain(..take).collect())
    }
}

async fn read_block_from_file(f: &mut File, block_size: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; block_size];
    let mut cursor = 0;

    // A single read call may return fewer bytes than the buffer holds, so
    // keep reading into the remainder until the buffer fills or the file
    // ends. A short return value signals EOF to the caller.
    loop {
        match f.read(&mut buf[cursor..]).await {
            Ok(0) => {
                buf.truncate(cursor);
                return Ok(buf);
            }
            Ok(s) => {
                cursor += s;
                if cursor == buf.len() {
                    return Ok(buf);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug)]
pub struct DownloadProcessor {
    f: File,
    curr_block: u16,
    decoder: Option<netascii::Decoder>,
    write_buf: Vec<u8>,
}

impl DownloadProcessor {
    fn new(f: File, mode: FileMode) -> DownloadProcessor {
        DownloadProcessor {
            f,
            curr_block: 0,
            decoder: mode.is_text().then(netascii::Decoder::new),
            write_buf: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    async fn process_data(&mut self, packet: &Packet) -> Result<ResultAction, io::Error> {
        match packet {
            Packet::Data { block, data } => {
                if *block == self.curr_block {
                    // The peer did not see our last ACK. Repeat it without
                    // rewriting the block.
                    return Ok(ResultAction::Resend(Packet::Ack {
                        block: self.curr_block,
                    }));
                }

                if *block != self.curr_block.wrapping_add(1) {
                    return Ok(ResultAction::RetryRecv);
                }

                self.append(data).await?;
                self.curr_block = *block;

                if data.len() < BLOCK_SIZE {
                    // EOF signal. Flush everything before the final ACK goes
                    // out so a successful status always means a complete file.
                    if let Some(decoder) = &mut self.decoder {
                        self.write_buf.clear();
                        decoder.finish(&mut self.write_buf);
                        if !self.write_buf.is_empty() {
                            self.f.write_all(&self.write_buf).await?;
                        }
                    }
                    self.f.flush().await?;

                    return Ok(ResultAction::TerminateWithPacket(
                        Packet::Ack {
                            block: self.curr_block,
                        },
                        Status::success(),
                    ));
                }

                Ok(ResultAction::SendAndAwait(Packet::Ack {
                    block: self.curr_block,
                }))
            }
            Packet::Error { code, message } => {
                Ok(ResultAction::Terminate(status_from_error(*code, message)))
            }
            _ => Ok(ResultAction::RetryRecv),
        }
    }

    async fn append(&mut self, data: &[u8]) -> Result<(), io::Error> {
        match &mut self.decoder {
            Some(decoder) => {
                self.write_buf.clear();
                decoder.decode(data, &mut self.write_buf);
                self.f.write_all(&self.write_buf).await?;
            }
            None => self.f.write_all(data).await?,
        }
        Ok(())
    }
}
