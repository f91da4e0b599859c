use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::{TrackerError, TrackerResult};
use crate::journey::Journey;
use crate::storage::JourneyStore;

pub const PING_REQ: u16 = 11;
pub const PING_REP: u16 = 12;
pub const OK: u16 = 21;
pub const INVALID: u16 = 22;
pub const FAIL: u16 = 23;
pub const TERM: u16 = 24;
pub const IDENT_REQ: u16 = 101;
pub const IDENT_REP: u16 = 102;
pub const REQ_SEND_JOURNEY: u16 = 111;
pub const OK_TO_SEND: u16 = 112;
pub const SENDING_HEADER: u16 = 113;
pub const SENDING_ROUTE_PART: u16 = 114;
pub const ROUTE_PART_RECVD: u16 = 115;
pub const SENDING_ROUTE_DONE: u16 = 116;
pub const JOURNEY_RECEIVED: u16 = 117;
pub const REQ_SEND_LOGDATA: u16 = 121;
pub const OK_TO_LOG: u16 = 122;
pub const SENDING_LOG_PART: u16 = 123;
pub const LOG_PART_RECVD: u16 = 124;
pub const SENDING_LOG_DONE: u16 = 125;
pub const LOG_RECEIVED: u16 = 126;

/// Points per route-part message
pub const POINTS_PER_PART: usize = 100;
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Upload sink for finished journeys and log data
#[async_trait]
pub trait JourneyTransport: Send {
    fn client_id(&self) -> &str;
    async fn connect(&mut self) -> TrackerResult<()>;
    /// Obtain a client id from the server, replacing the current one
    async fn identify(&mut self, profile: &str) -> TrackerResult<String>;
    async fn send_journey(&mut self, journey: &Journey) -> TrackerResult<()>;
    async fn send_log_blob(&mut self, message: &str, lines: &[String]) -> TrackerResult<()>;
    async fn disconnect(&mut self) -> TrackerResult<()>;
}

/// A parsed reply line: three-digit code, then optional payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub code: u16,
    pub data: String,
}

impl ControlMessage {
    pub fn parse(line: &str) -> TrackerResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = line
            .get(0..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| TrackerError::Transport(format!("unparseable reply '{}'", line)))?;
        let data = line.get(4..).unwrap_or("").to_string();
        Ok(ControlMessage { code, data })
    }
}

/// Line protocol client over any async reader/writer pair
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    client_id: String,
}

pub type TcpLineTransport = LineTransport<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

impl TcpLineTransport {
    /// Plain TCP connection to `addr`
    pub async fn tcp(addr: &str, client_id: &str) -> TrackerResult<Self> {
        let stream = timeout(STREAM_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TrackerError::Transport(format!("connect to {} timed out", addr)))?
            .map_err(net_err)?;
        let (read, write) = stream.into_split();
        Ok(LineTransport::new(BufReader::new(read), write, client_id))
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, client_id: &str) -> Self {
        LineTransport {
            reader,
            writer,
            client_id: client_id.to_string(),
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }

    async fn send(&mut self, code: u16, data: &str) -> TrackerResult<()> {
        let line = format!("{:03} {}\n", code, data);
        self.writer.write_all(line.as_bytes()).await.map_err(net_err)?;
        self.writer.flush().await.map_err(net_err)
    }

    async fn read(&mut self) -> TrackerResult<ControlMessage> {
        let mut line = String::new();
        let n = timeout(STREAM_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| TrackerError::Transport("reply timed out".to_string()))?
            .map_err(net_err)?;
        if n == 0 {
            return Err(TrackerError::Transport("connection closed".to_string()));
        }
        ControlMessage::parse(&line)
    }

    /// Send one message and require a specific reply code
    async fn exchange(&mut self, code: u16, data: &str, expect: u16) -> TrackerResult<String> {
        self.send(code, data).await?;
        let reply = self.read().await?;
        if reply.code != expect {
            log::warn!("[NET] {:03} answered with {:03} {}", code, reply.code, reply.data);
            return Err(TrackerError::Protocol {
                expected: expect,
                got: format!("{:03} {}", reply.code, reply.data),
            });
        }
        Ok(reply.data)
    }
}

#[async_trait]
impl<R, W> JourneyTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect(&mut self) -> TrackerResult<()> {
        self.exchange(PING_REQ, "", PING_REP).await?;
        log::debug!("[NET] server alive");
        Ok(())
    }

    async fn identify(&mut self, profile: &str) -> TrackerResult<String> {
        let id = self.exchange(IDENT_REQ, profile, IDENT_REP).await?;
        if id.trim().is_empty() {
            return Err(TrackerError::Transport("empty identification".to_string()));
        }
        self.client_id = id.trim().to_string();
        log::info!("[NET] identified as {}", self.client_id);
        Ok(self.client_id.clone())
    }

    async fn send_journey(&mut self, journey: &Journey) -> TrackerResult<()> {
        let request = format!("{} {}", self.client_id, journey.id);
        self.exchange(REQ_SEND_JOURNEY, &request, OK_TO_SEND).await?;
        self.exchange(SENDING_HEADER, &journey.header_line(), OK_TO_SEND)
            .await?;

        let total = journey.len();
        let mut sent = 0;
        while sent + POINTS_PER_PART < total {
            let part = journey.points_line(sent, POINTS_PER_PART);
            self.exchange(SENDING_ROUTE_PART, &part, ROUTE_PART_RECVD)
                .await?;
            sent += POINTS_PER_PART;
        }
        let last = journey.points_line(sent, total - sent);
        self.exchange(SENDING_ROUTE_DONE, &last, JOURNEY_RECEIVED)
            .await?;
        log::info!("[NET] journey {} uploaded ({} points)", journey.id, total);
        Ok(())
    }

    async fn send_log_blob(&mut self, message: &str, lines: &[String]) -> TrackerResult<()> {
        let request = format!("{} {}", self.client_id, message);
        self.exchange(REQ_SEND_LOGDATA, &request, OK_TO_LOG).await?;
        match lines.split_last() {
            Some((last, parts)) => {
                for part in parts {
                    self.exchange(SENDING_LOG_PART, part, LOG_PART_RECVD).await?;
                }
                self.exchange(SENDING_LOG_DONE, last, LOG_RECEIVED).await?;
            }
            None => {
                self.exchange(SENDING_LOG_DONE, "", LOG_RECEIVED).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> TrackerResult<()> {
        self.send(TERM, "").await?;
        let reply = self.read().await?;
        log::debug!("[NET] terminated ({:03})", reply.code);
        Ok(())
    }
}

/// Named block of text lines sent after the journeys
#[derive(Debug, Clone)]
pub struct LogBlob {
    pub name: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Journeys acknowledged by the server and moved out of the queue
    pub uploaded: usize,
    pub queued: usize,
    pub log_sent: bool,
}

/// Upload the processed queue over a connected transport.
///
/// Acknowledged journeys leave the queue (into the history unless `discard`)
/// before the log blob and disconnect are attempted; failures of those two
/// steps are logged and do not affect the queue.
pub async fn upload_queue<T: JourneyTransport>(
    transport: &mut T,
    store: &JourneyStore,
    profile: &str,
    log_blob: Option<&LogBlob>,
    discard: bool,
) -> TrackerResult<UploadReport> {
    let journeys = store.load_processed()?;
    transport.connect().await?;
    if transport.client_id().is_empty() {
        let id = transport.identify(profile).await?;
        store.save_client_id(&id)?;
    }

    let mut sent = Vec::with_capacity(journeys.len());
    for journey in &journeys {
        match transport.send_journey(journey).await {
            Ok(()) => sent.push(journey.id),
            Err(e) => {
                log::error!("[NET] journey {} not uploaded: {}", journey.id, e);
                break;
            }
        }
    }
    let uploaded = if discard {
        store.remove_processed(&sent)?
    } else {
        store.merge_into_history(&sent)?
    };

    let mut log_sent = false;
    if let Some(blob) = log_blob {
        match transport.send_log_blob(&blob.name, &blob.lines).await {
            Ok(()) => log_sent = true,
            Err(e) => log::warn!("[NET] log data '{}' not sent: {}", blob.name, e),
        }
    }
    if let Err(e) = transport.disconnect().await {
        log::warn!("[NET] disconnect failed: {}", e);
    }

    Ok(UploadReport {
        uploaded,
        queued: journeys.len(),
        log_sent,
    })
}

fn net_err(e: std::io::Error) -> TrackerError {
    TrackerError::Transport(e.to_string())
}
