/// DVR session client: login, stream setup, heartbeat supervision and the
/// reply mailbox that demultiplexes the command channel.
///
/// One reader task owns the inbound side of the command channel. It
/// answers `HeartBeatNotice` inline (echoing the notice's txn) and files
/// everything else into the mailbox by XML tag, where callers await their
/// reply. The outbound side (txn allocation plus the socket write) is
/// serialized behind a single mutex.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::error::DvrError;
use crate::protocol::frames::FrameAssembler;
use crate::protocol::wire::{self, Header, Message};
use crate::protocol::{
    StreamType, HEADER_SIZE, ID_GET_CFG, ID_HEARTBEAT_REPLY, ID_LOGIN_GET_FLAG, ID_LOGOUT,
    ID_STREAM_CREATE, ID_STREAM_DESTROY, ID_STREAM_START, ID_STREAM_STOP, ID_USER_LOGIN,
};

pub const DEFAULT_CMD_PORT: u16 = 5050;
pub const DEFAULT_MEDIA_PORT: u16 = 6050;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const MEDIA_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_GAP: Duration = Duration::from_secs(60);
const TASK_JOIN_GRACE: Duration = Duration::from_secs(2);
/// Frames buffered between the media reader and the consumer; the
/// broadcast channel drops the oldest on overflow.
const MEDIA_QUEUE_DEPTH: usize = 64;
/// Per-tag cap on unretrieved mailbox messages.
const MAILBOX_TAG_MAX: usize = 32;

const HEARTBEAT_REPLY_BODY: &str =
    r#"<HeartBeatNoticeReply CmdReply="0" NetDataFlow="0" NetHistoryDataFlow="0" />"#;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            username: "admin".to_string(),
            password: "123456".to_string(),
        }
    }
}

/// Why the session died; mapped to a `DvrError` when surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Death {
    HeartbeatTimeout,
    Closed,
    ReadError,
}

impl Death {
    fn into_error(self) -> DvrError {
        match self {
            Death::HeartbeatTimeout => DvrError::HeartbeatTimeout(HEARTBEAT_GAP),
            Death::Closed | Death::ReadError => DvrError::ConnectionClosed,
        }
    }
}

/// Outbound half of the command channel. Owning the txn counter and the
/// write half in one place keeps allocation and write atomic.
struct CmdSender {
    write: OwnedWriteHalf,
    txn: u32,
}

impl fmt::Debug for CmdSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdSender").field("txn", &self.txn).finish()
    }
}

impl CmdSender {
    async fn send(&mut self, cmd_id: u32, inner: &str) -> Result<u32, DvrError> {
        self.txn += 1;
        let txn = self.txn;
        self.send_with_txn(txn, cmd_id, inner).await?;
        Ok(txn)
    }

    async fn send_with_txn(&mut self, txn: u32, cmd_id: u32, inner: &str) -> Result<(), DvrError> {
        self.write
            .write_all(&wire::pack_command(txn, cmd_id, inner))
            .await
            .map_err(|_| DvrError::ConnectionClosed)
    }
}

struct Shared {
    mailbox: Mutex<HashMap<String, VecDeque<Message>>>,
    wake: Notify,
    dead: Mutex<Option<Death>>,
    last_rx: Mutex<Instant>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl Shared {
    fn file(&self, msg: Message) {
        if msg.tag.is_empty() {
            debug!("dropping command message without a body tag");
            return;
        }
        let mut mailbox = self.mailbox.lock().unwrap();
        let queue = mailbox.entry(msg.tag.clone()).or_default();
        queue.push_back(msg);
        if queue.len() > MAILBOX_TAG_MAX {
            queue.pop_front();
        }
        drop(mailbox);
        self.wake.notify_waiters();
    }

    fn take(&self, tag: &str) -> Option<Message> {
        self.mailbox
            .lock()
            .unwrap()
            .get_mut(tag)
            .and_then(|q| q.pop_front())
    }

    fn death(&self) -> Option<Death> {
        *self.dead.lock().unwrap()
    }

    /// First cause wins; later deaths are consequences of the first.
    fn kill(&self, cause: Death) {
        self.dead.lock().unwrap().get_or_insert(cause);
        let _ = self.shutdown.send_replace(true);
        self.wake.notify_waiters();
    }

    fn touch_rx(&self) {
        *self.last_rx.lock().unwrap() = Instant::now();
    }
}

/// A logged-in command-channel session.
#[derive(Debug)]
pub struct DvrClient {
    host: String,
    creds: Credentials,
    sender: Arc<tokio::sync::Mutex<CmdSender>>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    media_session: Option<u32>,
}

impl DvrClient {
    /// Open the command channel and complete the challenge-response
    /// login. The whole sequence is bounded by one 15 s timeout.
    pub async fn connect(
        host: &str,
        cmd_port: u16,
        creds: Credentials,
    ) -> Result<Self, DvrError> {
        match timeout(LOGIN_TIMEOUT, Self::connect_inner(host, cmd_port, creds)).await {
            Ok(res) => res,
            Err(_) => Err(DvrError::Timeout("login sequence")),
        }
    }

    async fn connect_inner(
        host: &str,
        cmd_port: u16,
        creds: Credentials,
    ) -> Result<Self, DvrError> {
        let addr = format!("{host}:{cmd_port}");
        info!(%addr, user = %creds.username, "connecting to DVR");
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DvrError::DialFailed {
                addr: addr.clone(),
                source: e,
            })?;
        stream.set_nodelay(true).ok();

        // The login phase runs single-threaded on the raw stream; the
        // reader task only starts once we are logged in, which also
        // guarantees no HeartBeatReply is sent pre-login (replies in this
        // phase are handled inline below).
        let mut txn = 0u32;

        txn += 1;
        let inner = format!(r#"<LoginGetFlag UserName="{}" />"#, creds.username);
        stream
            .write_all(&wire::pack_command(txn, ID_LOGIN_GET_FLAG, &inner))
            .await
            .map_err(|_| DvrError::ConnectionClosed)?;

        let reply = read_reply_inline(&mut stream, "LoginGetFlagReply").await?;
        let nonce = wire::attr(&reply.body, "LoginFlag").ok_or_else(|| {
            DvrError::Protocol(format!("no LoginFlag in reply: {}", snippet(&reply.body)))
        })?;
        debug!(%nonce, "got login nonce");

        let token = auth::login_token(&nonce, &creds.password);
        txn += 1;
        let inner = format!(
            r#"<UserLogin UserName="{}" UserIP="192.168.1.1" UserMAC="00:00:00:00:00:00" LoginFlag="{token}" />"#,
            creds.username
        );
        stream
            .write_all(&wire::pack_command(txn, ID_USER_LOGIN, &inner))
            .await
            .map_err(|_| DvrError::ConnectionClosed)?;

        let reply = read_reply_inline(&mut stream, "UserLoginReply").await?;
        match wire::attr(&reply.body, "CmdReply") {
            Some(code) if code == "0" => {}
            Some(code) => return Err(DvrError::AuthFailed { reply: code }),
            None => {
                return Err(DvrError::Protocol(format!(
                    "no CmdReply in login reply: {}",
                    snippet(&reply.body)
                )))
            }
        }
        info!("logged in");

        let (read_half, write_half) = stream.into_split();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            dead: Mutex::new(None),
            last_rx: Mutex::new(Instant::now()),
            shutdown,
        });
        let sender = Arc::new(tokio::sync::Mutex::new(CmdSender {
            write: write_half,
            txn,
        }));

        let tasks = vec![
            tokio::spawn(reader_loop(
                read_half,
                shared.clone(),
                sender.clone(),
                shared.shutdown.subscribe(),
            )),
            tokio::spawn(watchdog_loop(shared.clone(), shared.shutdown.subscribe())),
        ];

        Ok(DvrClient {
            host: host.to_string(),
            creds,
            sender,
            shared,
            tasks,
            media_session: None,
        })
    }

    /// Create, handshake and start a live stream for one channel.
    pub async fn open_stream(
        &mut self,
        channel: u8,
        stream_type: StreamType,
        media_port: u16,
    ) -> Result<MediaStream, DvrError> {
        if self.media_session.is_some() {
            return Err(DvrError::StreamCreateFailed(
                "session already has an open stream".to_string(),
            ));
        }

        let inner = format!(
            r#"<RealStreamCreateRequest Channel="{channel}" Mode="{}" Type="1" />"#,
            stream_type.wire_mode()
        );
        let reply = self
            .request(ID_STREAM_CREATE, &inner, "RealStreamCreateReply")
            .await?;
        if let Some(code) = wire::attr(&reply.body, "CmdReply") {
            if code != "0" {
                return Err(DvrError::StreamCreateFailed(format!("CmdReply={code}")));
            }
        }
        let session: u32 = wire::attr(&reply.body, "MediaSession")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                DvrError::StreamCreateFailed(format!(
                    "no MediaSession in reply: {}",
                    snippet(&reply.body)
                ))
            })?;
        if session == 0 {
            return Err(DvrError::StreamCreateFailed("zero MediaSession".to_string()));
        }
        info!(channel, %stream_type, session, "media session created");

        let media_sock = match timeout(
            MEDIA_HANDSHAKE_TIMEOUT,
            media_handshake(&self.host, media_port, session),
        )
        .await
        {
            Ok(res) => res?,
            Err(_) => return Err(DvrError::Timeout("media handshake")),
        };

        // Reader goes up before RealStreamStart: frames may flow the
        // instant the DVR processes the start request.
        let (tx, rx) = broadcast::channel(MEDIA_QUEUE_DEPTH);
        let task = tokio::spawn(media_reader(
            media_sock,
            tx,
            self.shared.shutdown.subscribe(),
        ));

        let inner = format!(r#"<RealStreamStartRequest MediaSession="{session}" />"#);
        let start = self
            .request(ID_STREAM_START, &inner, "RealStreamStartReply")
            .await
            .map_err(|e| match e {
                DvrError::Timeout(_) => {
                    DvrError::StreamStartFailed("no RealStreamStartReply".to_string())
                }
                other => other,
            });
        match start {
            Ok(reply) => {
                if let Some(code) = wire::attr(&reply.body, "CmdReply") {
                    if code != "0" {
                        task.abort();
                        return Err(DvrError::StreamStartFailed(format!("CmdReply={code}")));
                    }
                }
            }
            Err(e) => {
                task.abort();
                return Err(e);
            }
        }

        info!(channel, session, "stream started");
        self.media_session = Some(session);
        Ok(MediaStream {
            session,
            rx,
            dropped: 0,
            task,
        })
    }

    /// Fetch one configuration block as raw GetCfgReply XML.
    pub async fn get_config(&self, main_cmd: u16) -> Result<String, DvrError> {
        if self.shared.death().is_some() {
            return Err(DvrError::NotLoggedIn);
        }
        let inner = format!(r#"<GetCfg MainCmd="{main_cmd}" AssistCmd="-1" />"#);
        let reply = self.request(ID_GET_CFG, &inner, "GetCfgReply").await?;
        Ok(reply.body)
    }

    /// True once the session has died (heartbeat gap, socket loss).
    pub fn is_dead(&self) -> bool {
        self.shared.death().is_some()
    }

    /// Best-effort stream teardown + logout, then stop all session tasks.
    pub async fn close(mut self) {
        if let Some(session) = self.media_session.take() {
            let inner = format!(r#"<RealStreamStopRequest MediaSession="{session}" />"#);
            let _ = self.send_command(ID_STREAM_STOP, &inner).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let inner = format!(r#"<RealStreamDestroyRequest MediaSession="{session}" />"#);
            let _ = self.send_command(ID_STREAM_DESTROY, &inner).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let inner = format!(r#"<Logout UserName="{}" />"#, self.creds.username);
        let _ = self.send_command(ID_LOGOUT, &inner).await;

        self.shared.kill(Death::Closed);
        for mut task in self.tasks.drain(..) {
            if timeout(TASK_JOIN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("disconnected");
    }

    async fn send_command(&self, cmd_id: u32, inner: &str) -> Result<u32, DvrError> {
        if let Some(death) = self.shared.death() {
            return Err(death.into_error());
        }
        self.sender.lock().await.send(cmd_id, inner).await
    }

    async fn request(
        &self,
        cmd_id: u32,
        inner: &str,
        reply_tag: &'static str,
    ) -> Result<Message, DvrError> {
        self.send_command(cmd_id, inner).await?;
        self.await_reply(reply_tag, REPLY_TIMEOUT).await
    }

    async fn await_reply(
        &self,
        tag: &'static str,
        wait: Duration,
    ) -> Result<Message, DvrError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.shared.wake.notified();
            tokio::pin!(notified);
            // Register as a waiter before checking the mailbox:
            // notify_waiters stores no permit, so a notification landing
            // between the check and the first poll would otherwise be lost.
            notified.as_mut().enable();
            if let Some(msg) = self.shared.take(tag) {
                return Ok(msg);
            }
            if let Some(death) = self.shared.death() {
                return Err(death.into_error());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(DvrError::Timeout(tag)),
            }
        }
    }
}

impl Drop for DvrClient {
    fn drop(&mut self) {
        // close() already killed the session; this covers callers that
        // just drop the client on an error path.
        self.shared.kill(Death::Closed);
    }
}

/// A started live stream. Frames arrive in order; slow consumers lose the
/// oldest buffered frames, counted in `dropped`.
#[derive(Debug)]
pub struct MediaStream {
    pub session: u32,
    rx: broadcast::Receiver<Bytes>,
    pub dropped: u64,
    task: JoinHandle<()>,
}

impl MediaStream {
    /// Next H.264 slice, or None once the stream has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(lost = n, "consumer lagging, oldest media frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Read one reply during the synchronous login phase, answering any
/// heartbeat that lands in between.
async fn read_reply_inline(
    stream: &mut TcpStream,
    want: &str,
) -> Result<Message, DvrError> {
    for _ in 0..8 {
        let msg = wire::read_message(stream)
            .await?
            .ok_or(DvrError::ConnectionClosed)?;
        if msg.tag == "HeartBeatNotice" {
            stream
                .write_all(&wire::pack_command(
                    msg.header.txn,
                    ID_HEARTBEAT_REPLY,
                    HEARTBEAT_REPLY_BODY,
                ))
                .await
                .map_err(|_| DvrError::ConnectionClosed)?;
            continue;
        }
        if msg.tag == want {
            return Ok(msg);
        }
        return Err(DvrError::Protocol(format!(
            "expected {want}, got {}",
            msg.tag
        )));
    }
    Err(DvrError::Protocol(format!(
        "no {want} among interleaved messages"
    )))
}

async fn reader_loop(
    mut read: OwnedReadHalf,
    shared: Arc<Shared>,
    sender: Arc<tokio::sync::Mutex<CmdSender>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let msg = tokio::select! {
            _ = shutdown.changed() => return,
            res = wire::read_message(&mut read) => match res {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!("command socket closed by DVR");
                    shared.kill(Death::Closed);
                    return;
                }
                Err(e) => {
                    error!("command channel read failed: {e}");
                    shared.kill(Death::ReadError);
                    return;
                }
            },
        };

        shared.touch_rx();
        if msg.tag == "HeartBeatNotice" {
            debug!(txn = msg.header.txn, "heartbeat from DVR");
            let result = sender
                .lock()
                .await
                .send_with_txn(msg.header.txn, ID_HEARTBEAT_REPLY, HEARTBEAT_REPLY_BODY)
                .await;
            if result.is_err() {
                error!("failed to answer heartbeat");
                shared.kill(Death::ReadError);
                return;
            }
        } else {
            shared.file(msg);
        }
    }
}

async fn watchdog_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                let gap = shared.last_rx.lock().unwrap().elapsed();
                if gap > HEARTBEAT_GAP {
                    error!(gap_secs = gap.as_secs(), "no command-channel traffic, session dead");
                    shared.kill(Death::HeartbeatTimeout);
                    return;
                }
            }
        }
    }
}

async fn media_handshake(
    host: &str,
    media_port: u16,
    session: u32,
) -> Result<TcpStream, DvrError> {
    let addr = format!("{host}:{media_port}");
    let mut sock = TcpStream::connect(&addr)
        .await
        .map_err(|e| DvrError::DialFailed { addr, source: e })?;
    sock.write_all(&Header::media_handshake(session).pack())
        .await
        .map_err(|e| DvrError::MediaRead(format!("handshake write: {e}")))?;
    let mut echo = [0u8; HEADER_SIZE];
    sock.read_exact(&mut echo)
        .await
        .map_err(|e| DvrError::MediaRead(format!("handshake reply: {e}")))?;
    Ok(sock)
}

async fn media_reader(
    mut sock: TcpStream,
    tx: broadcast::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut assembler = FrameAssembler::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            res = sock.read(&mut chunk) => match res {
                Ok(0) => {
                    info!("media socket closed");
                    return;
                }
                Ok(n) => {
                    assembler.extend(&chunk[..n]);
                    while let Some(frame) = assembler.next_frame() {
                        if tx.send(frame).is_err() {
                            return; // consumer gone
                        }
                    }
                }
                Err(e) => {
                    warn!("media read error: {e}");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frames::SUB_HEADER_SIZE;
    use crate::protocol::{
        ID_LOGIN_GET_FLAG_REPLY, ID_STREAM_CREATE_REPLY, ID_STREAM_START_REPLY,
        ID_USER_LOGIN_REPLY, MEDIA_MAGIC, VERSION,
    };
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const NONCE: &str = "1873207978";
    const PASSWORD: &str = "123456";
    const SESSION: u32 = 77;

    fn media_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        for field in [MEDIA_MAGIC, VERSION, 0, payload.len() as u32, 0, 0, 0, 0, 0] {
            frame.extend_from_slice(&field.to_be_bytes());
        }
        let mut sub = [0u8; SUB_HEADER_SIZE];
        sub[32..36].copy_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(&sub);
        frame.extend_from_slice(payload);
        frame
    }

    fn h264_payload() -> Vec<u8> {
        let mut p = vec![0, 0, 0, 1, 0xc7];
        p.extend_from_slice(&[0x11; 17]);
        p.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x80, 0x10]);
        p
    }

    /// Command-channel side of a synthetic DVR that mirrors the reference
    /// firmware's dialogue.
    async fn serve_command(listener: TcpListener, accept_password: &'static str) {
        let (mut sock, _) = listener.accept().await.unwrap();
        loop {
            let msg = match wire::read_message(&mut sock).await {
                Ok(Some(m)) => m,
                _ => return,
            };
            let reply = match msg.tag.as_str() {
                "LoginGetFlag" => wire::pack_command(
                    msg.header.txn,
                    ID_LOGIN_GET_FLAG_REPLY,
                    &format!(r#"<LoginGetFlagReply LoginFlag="{NONCE}" CmdReply="0" />"#),
                ),
                "UserLogin" => {
                    let expected = auth::login_token(NONCE, accept_password);
                    let got = wire::attr(&msg.body, "LoginFlag").unwrap_or_default();
                    let code = if got == expected { "0" } else { "22" };
                    wire::pack_command(
                        msg.header.txn,
                        ID_USER_LOGIN_REPLY,
                        &format!(r#"<UserLoginReply CmdReply="{code}" />"#),
                    )
                }
                "RealStreamCreateRequest" => wire::pack_command(
                    msg.header.txn,
                    ID_STREAM_CREATE_REPLY,
                    &format!(
                        r#"<RealStreamCreateReply CmdReply="0" MediaSession="{SESSION}" />"#
                    ),
                ),
                "RealStreamStartRequest" => wire::pack_command(
                    msg.header.txn,
                    ID_STREAM_START_REPLY,
                    r#"<RealStreamStartReply CmdReply="0" />"#,
                ),
                _ => continue, // Logout etc: no reply needed
            };
            if sock.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    /// Media-channel side: validate the handshake, echo it, send frames.
    async fn serve_media(listener: TcpListener, frames: usize) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut hdr = [0u8; HEADER_SIZE];
        sock.read_exact(&mut hdr).await.unwrap();
        let header = Header::unpack(&hdr);
        assert_eq!(header.magic, MEDIA_MAGIC);
        assert_eq!(header.field8, SESSION);
        sock.write_all(&hdr).await.unwrap();
        for _ in 0..frames {
            sock.write_all(&media_frame(&h264_payload())).await.unwrap();
        }
        // Hold the socket open briefly so the client reads all frames.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn login_open_stream_and_receive_frames() {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cmd_port = cmd_listener.local_addr().unwrap().port();
        let media_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let media_port = media_listener.local_addr().unwrap().port();

        tokio::spawn(serve_command(cmd_listener, PASSWORD));
        tokio::spawn(serve_media(media_listener, 3));

        let mut client = DvrClient::connect("127.0.0.1", cmd_port, Credentials::default())
            .await
            .unwrap();
        let mut stream = client
            .open_stream(0, StreamType::Main, media_port)
            .await
            .unwrap();
        assert_eq!(stream.session, SESSION);

        let payload = h264_payload();
        for _ in 0..3 {
            let frame = stream.recv().await.expect("frame");
            assert_eq!(&frame[..], &payload[22..]);
        }
        assert_eq!(stream.dropped, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn second_stream_on_same_session_is_refused() {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cmd_port = cmd_listener.local_addr().unwrap().port();
        let media_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let media_port = media_listener.local_addr().unwrap().port();

        tokio::spawn(serve_command(cmd_listener, PASSWORD));
        tokio::spawn(serve_media(media_listener, 0));

        let mut client = DvrClient::connect("127.0.0.1", cmd_port, Credentials::default())
            .await
            .unwrap();
        let _stream = client
            .open_stream(0, StreamType::Main, media_port)
            .await
            .unwrap();
        let err = client
            .open_stream(1, StreamType::Main, media_port)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "StreamCreateFailed");
        client.close().await;
    }

    #[tokio::test]
    async fn wrong_password_is_auth_failed() {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cmd_port = cmd_listener.local_addr().unwrap().port();
        tokio::spawn(serve_command(cmd_listener, PASSWORD));

        let creds = Credentials {
            username: "admin".to_string(),
            password: "admin".to_string(),
        };
        let err = DvrClient::connect("127.0.0.1", cmd_port, creds)
            .await
            .unwrap_err();
        match err {
            DvrError::AuthFailed { reply } => assert_eq!(reply, "22"),
            other => panic!("expected AuthFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_is_answered_with_matching_txn() {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cmd_port = cmd_listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut sock, _) = cmd_listener.accept().await.unwrap();
            // Login exchange first.
            for _ in 0..2 {
                let msg = wire::read_message(&mut sock).await.unwrap().unwrap();
                let reply = match msg.tag.as_str() {
                    "LoginGetFlag" => wire::pack_command(
                        msg.header.txn,
                        ID_LOGIN_GET_FLAG_REPLY,
                        &format!(r#"<LoginGetFlagReply LoginFlag="{NONCE}" />"#),
                    ),
                    _ => wire::pack_command(
                        msg.header.txn,
                        ID_USER_LOGIN_REPLY,
                        r#"<UserLoginReply CmdReply="0" />"#,
                    ),
                };
                sock.write_all(&reply).await.unwrap();
            }
            // Unsolicited heartbeat with a distinctive txn.
            sock.write_all(&wire::pack_command(4242, 78, r#"<HeartBeatNotice Count="9" />"#))
                .await
                .unwrap();
            let reply = wire::read_message(&mut sock).await.unwrap().unwrap();
            seen_tx.send((reply.header.txn, reply.tag)).unwrap();
        });

        let client = DvrClient::connect("127.0.0.1", cmd_port, Credentials::default())
            .await
            .unwrap();
        let (txn, tag) = seen_rx.await.unwrap();
        assert_eq!(txn, 4242);
        assert_eq!(tag, "HeartBeatNoticeReply");
        client.close().await;
    }

    #[tokio::test]
    async fn txn_ids_increase_from_one() {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cmd_port = cmd_listener.local_addr().unwrap().port();
        let (txns_tx, txns_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut sock, _) = cmd_listener.accept().await.unwrap();
            let mut txns = Vec::new();
            for _ in 0..2 {
                let msg = wire::read_message(&mut sock).await.unwrap().unwrap();
                txns.push(msg.header.txn);
                let reply = match msg.tag.as_str() {
                    "LoginGetFlag" => wire::pack_command(
                        msg.header.txn,
                        ID_LOGIN_GET_FLAG_REPLY,
                        &format!(r#"<LoginGetFlagReply LoginFlag="{NONCE}" />"#),
                    ),
                    _ => wire::pack_command(
                        msg.header.txn,
                        ID_USER_LOGIN_REPLY,
                        r#"<UserLoginReply CmdReply="0" />"#,
                    ),
                };
                sock.write_all(&reply).await.unwrap();
            }
            txns_tx.send(txns).unwrap();
        });

        let client = DvrClient::connect("127.0.0.1", cmd_port, Credentials::default())
            .await
            .unwrap();
        let txns = txns_rx.await.unwrap();
        assert_eq!(txns, vec![1, 2]);
        client.close().await;
    }
}
