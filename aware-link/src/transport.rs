//! Transport channel: one stream socket per bring-up (accept-one or connect), framed read loop,
//! queued writer. Receive is push-based through `LinkEvent`s.

use std::net::SocketAddr;
use std::sync::Arc;

use aware_core::wire::{self, FrameKind, LEN_SIZE};
use aware_core::{encode_frame, Frame, FrameDecodeError, FrameEncodeError, Role};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{ConnectionId, LinkEvent, LostReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Error reading one frame off the stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("end of stream")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] FrameDecodeError),
}

async fn read_field<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ReadError> {
    let mut prefix = [0u8; LEN_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = wire::field_len(prefix)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read exactly one frame. EOF before the tag byte is a clean end; EOF inside a frame is an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, ReadError> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ReadError::Eof),
        Err(e) => return Err(ReadError::Io(e)),
    }
    let frame = match FrameKind::from_tag(tag[0])? {
        FrameKind::Text => Frame::text_from_wire(read_field(reader).await?)?,
        FrameKind::Attachment => {
            let mime = read_field(reader).await?;
            let payload = read_field(reader).await?;
            Frame::attachment_from_wire(mime, payload)?
        }
    };
    Ok(frame)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(b) => b,
                None => break,
            },
        };
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

struct Slot {
    id: ConnectionId,
    state: ConnectionState,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    role: Role,
    events: mpsc::UnboundedSender<LinkEvent>,
    parent: CancellationToken,
    slot: Mutex<Option<Slot>>,
}

impl Inner {
    /// Negotiating → Open. Emits `Established` before the read loop starts.
    fn open(&self, id: ConnectionId, writer: mpsc::UnboundedSender<Vec<u8>>) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(s)
                if s.id == id
                    && s.state == ConnectionState::Negotiating
                    && !s.cancel.is_cancelled() =>
            {
                s.state = ConnectionState::Open;
                s.writer = Some(writer);
                let _ = self.events.send(LinkEvent::Established {
                    role: self.role,
                    connection: id,
                });
                true
            }
            _ => false,
        }
    }

    /// Emit a frame only while `id` is the open connection.
    fn deliver(&self, id: ConnectionId, frame: Frame) -> bool {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(s) if s.id == id && s.state == ConnectionState::Open => {
                let _ = self.events.send(LinkEvent::Frame {
                    role: self.role,
                    connection: id,
                    frame,
                });
                true
            }
            _ => false,
        }
    }

    /// Close `id` after a failure. `Lost` fires once, and only if the connection had opened.
    fn fail(&self, id: ConnectionId, reason: LostReason) {
        let mut slot = self.slot.lock();
        let Some(s) = slot.as_mut().filter(|s| s.id == id) else {
            return;
        };
        let was = s.state;
        s.state = ConnectionState::Closed;
        s.writer = None;
        s.cancel.cancel();
        match was {
            ConnectionState::Open => {
                info!(role = %self.role, connection = %id, %reason, "connection lost");
                let _ = self.events.send(LinkEvent::Lost {
                    role: self.role,
                    connection: id,
                    reason,
                });
            }
            ConnectionState::Negotiating => {
                warn!(role = %self.role, connection = %id, %reason, "connection never opened");
                let _ = self.events.send(LinkEvent::ConnectFailed {
                    role: self.role,
                    reason: reason.to_string(),
                });
            }
            ConnectionState::Closed => {}
        }
    }

    async fn accept_one(self: Arc<Self>, id: ConnectionId, listener: TcpListener, cancel: CancellationToken) {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
        debug!(role = %self.role, port, "waiting for client connection");
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            r = listener.accept() => r,
        };
        // Single-peer model: one accept per bring-up cycle.
        drop(listener);
        match accepted {
            Ok((stream, from)) => {
                info!(role = %self.role, %from, "client connected");
                self.serve(id, stream, cancel).await;
            }
            Err(e) => self.fail(id, LostReason::Io(e.to_string())),
        }
    }

    async fn connect_to(self: Arc<Self>, id: ConnectionId, addr: SocketAddr, cancel: CancellationToken) {
        debug!(role = %self.role, %addr, "connecting to server");
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            r = TcpStream::connect(addr) => r,
        };
        match connected {
            Ok(stream) => {
                info!(role = %self.role, %addr, "connected to server");
                self.serve(id, stream, cancel).await;
            }
            Err(e) => self.fail(id, LostReason::Io(e.to_string())),
        }
    }

    async fn serve(self: Arc<Self>, id: ConnectionId, stream: TcpStream, cancel: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if !self.open(id, tx) {
            return;
        }
        let writer_inner = self.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(writer, rx, writer_cancel).await {
                writer_inner.fail(id, LostReason::Io(e.to_string()));
            }
        });
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                r = read_frame(&mut reader) => r,
            };
            match next {
                Ok(frame) => {
                    debug!(
                        role = %self.role,
                        connection = %id,
                        kind = ?frame.kind(),
                        len = frame.payload().len(),
                        "frame received"
                    );
                    if !self.deliver(id, frame) {
                        return;
                    }
                }
                Err(ReadError::Eof) => return self.fail(id, LostReason::Eof),
                Err(ReadError::Io(e)) => return self.fail(id, LostReason::Io(e.to_string())),
                Err(ReadError::Protocol(e)) => {
                    return self.fail(id, LostReason::Protocol(e.to_string()))
                }
            }
        }
    }
}

/// Owns at most one connection at a time. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(
        role: Role,
        events: mpsc::UnboundedSender<LinkEvent>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                events,
                parent,
                slot: Mutex::new(None),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The current connection, if one is negotiating or open.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .filter(|s| s.state != ConnectionState::Closed)
            .map(|s| s.id)
    }

    /// Start a new connection slot, retiring any previous one.
    fn begin(&self) -> (ConnectionId, CancellationToken) {
        let id = ConnectionId::next();
        let cancel = self.inner.parent.child_token();
        let old = self.inner.slot.lock().replace(Slot {
            id,
            state: ConnectionState::Negotiating,
            writer: None,
            cancel: cancel.clone(),
            task: None,
        });
        if let Some(old) = old {
            old.cancel.cancel();
            if old.state == ConnectionState::Open {
                let _ = self.inner.events.send(LinkEvent::Lost {
                    role: self.inner.role,
                    connection: old.id,
                    reason: LostReason::Replaced,
                });
            }
        }
        (id, cancel)
    }

    fn keep_task(&self, id: ConnectionId, task: JoinHandle<()>) {
        if let Some(s) = self.inner.slot.lock().as_mut().filter(|s| s.id == id) {
            s.task = Some(task);
        }
    }

    /// Server role: accept exactly one connection on `listener`, then run the read loop.
    pub fn listen(&self, listener: TcpListener) -> ConnectionId {
        let (id, cancel) = self.begin();
        let task = tokio::spawn(self.inner.clone().accept_one(id, listener, cancel));
        self.keep_task(id, task);
        id
    }

    /// Client role: connect to the negotiated peer address, then run the read loop.
    pub fn connect(&self, addr: SocketAddr) -> ConnectionId {
        let (id, cancel) = self.begin();
        let task = tokio::spawn(self.inner.clone().connect_to(id, addr, cancel));
        self.keep_task(id, task);
        id
    }

    /// Queue a frame on the open connection.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let writer = self
            .inner
            .slot
            .lock()
            .as_ref()
            .filter(|s| s.state == ConnectionState::Open)
            .and_then(|s| s.writer.clone())
            .ok_or(TransportError::NotConnected)?;
        let bytes = encode_frame(frame)?;
        writer.send(bytes).map_err(|_| TransportError::NotConnected)
    }

    /// Tear down the current connection because of an outside event (e.g. network lost).
    pub fn drop_connection(&self, reason: LostReason) {
        let id = self.inner.slot.lock().as_ref().map(|s| s.id);
        if let Some(id) = id {
            self.inner.fail(id, reason);
        }
    }

    /// Tear down `id` only if it is still the current connection.
    pub fn end(&self, id: ConnectionId, reason: LostReason) {
        self.inner.fail(id, reason);
    }

    /// A new bring-up is about to take this channel over. An open connection reports
    /// `Lost(Replaced)`; one still negotiating goes quietly.
    pub fn retire(&self) {
        let open = self
            .inner
            .slot
            .lock()
            .as_ref()
            .filter(|s| s.state == ConnectionState::Open)
            .map(|s| s.id);
        match open {
            Some(id) => self.inner.fail(id, LostReason::Replaced),
            None => {
                if let Some(s) = self.inner.slot.lock().as_mut() {
                    s.state = ConnectionState::Closed;
                    s.cancel.cancel();
                }
            }
        }
    }

    /// Resolves once `id` is closed, replaced or gone.
    pub async fn closed(&self, id: ConnectionId) {
        let token = self
            .inner
            .slot
            .lock()
            .as_ref()
            .filter(|s| s.id == id)
            .map(|s| s.cancel.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    /// Benign teardown: cancel, release the socket, wait for the worker. No `Lost` event.
    pub async fn close(&self) {
        let old = self.inner.slot.lock().take();
        if let Some(mut old) = old {
            old.cancel.cancel();
            old.writer = None;
            if let Some(task) = old.task.take() {
                let _ = task.await;
            }
            debug!(role = %self.inner.role, connection = %old.id, "transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn quiet(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) {
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "expected no further events"
        );
    }

    async fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn channel(role: Role) -> (TransportChannel, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportChannel::new(role, tx, CancellationToken::new()), rx)
    }

    async fn connected_pair() -> (
        (TransportChannel, mpsc::UnboundedReceiver<LinkEvent>),
        (TransportChannel, mpsc::UnboundedReceiver<LinkEvent>),
    ) {
        let (server, mut server_rx) = channel(Role::Publisher);
        let (client, mut client_rx) = channel(Role::Subscriber);
        let (listener, addr) = loopback_listener().await;
        server.listen(listener);
        client.connect(addr);
        assert!(matches!(next(&mut server_rx).await, LinkEvent::Established { .. }));
        assert!(matches!(next(&mut client_rx).await, LinkEvent::Established { .. }));
        ((server, server_rx), (client, client_rx))
    }

    #[tokio::test]
    async fn send_without_connection_is_not_connected() {
        let (ch, _rx) = channel(Role::Publisher);
        assert!(matches!(
            ch.send(&Frame::text("x")),
            Err(TransportError::NotConnected)
        ));
        assert_eq!(ch.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn text_and_attachment_cross_the_socket() {
        let ((server, mut server_rx), (client, mut client_rx)) = connected_pair().await;
        assert!(server.is_open() && client.is_open());

        client.send(&Frame::text("hello")).unwrap();
        match next(&mut server_rx).await {
            LinkEvent::Frame { frame, role, .. } => {
                assert_eq!(role, Role::Publisher);
                assert_eq!(frame, Frame::text("hello"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        server
            .send(&Frame::attachment("image/png", payload.clone()))
            .unwrap();
        match next(&mut client_rx).await {
            LinkEvent::Frame {
                frame: Frame::Attachment { mime_type, payload: got },
                ..
            } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(got, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_decodes_raw_text_bytes() {
        let (server, mut rx) = channel(Role::Publisher);
        let (listener, addr) = loopback_listener().await;
        server.listen(listener);
        let mut raw = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next(&mut rx).await, LinkEvent::Established { .. }));
        raw.write_all(&[0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();
        match next(&mut rx).await {
            LinkEvent::Frame { frame, .. } => assert_eq!(frame, Frame::text("hello")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_ends_connection() {
        let (server, mut rx) = channel(Role::Publisher);
        let (listener, addr) = loopback_listener().await;
        server.listen(listener);
        let mut raw = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next(&mut rx).await, LinkEvent::Established { .. }));
        raw.write_all(&[9, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            LinkEvent::Lost {
                reason: LostReason::Protocol(_),
                ..
            }
        ));
        assert!(matches!(
            server.send(&Frame::text("late")),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error_not_a_short_frame() {
        let (server, mut rx) = channel(Role::Publisher);
        let (listener, addr) = loopback_listener().await;
        server.listen(listener);
        let mut raw = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next(&mut rx).await, LinkEvent::Established { .. }));
        raw.write_all(&[0, 0, 0, 0, 10, b'a', b'b']).await.unwrap();
        drop(raw);
        assert!(matches!(
            next(&mut rx).await,
            LinkEvent::Lost {
                reason: LostReason::Io(_),
                ..
            }
        ));
        quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn lost_fires_once() {
        let ((server, mut server_rx), (_client, mut client_rx)) = connected_pair().await;
        server.drop_connection(LostReason::NetworkLost);
        server.drop_connection(LostReason::NetworkLost);
        assert!(matches!(
            next(&mut server_rx).await,
            LinkEvent::Lost {
                reason: LostReason::NetworkLost,
                ..
            }
        ));
        quiet(&mut server_rx).await;
        // Peer sees the stream end.
        assert!(matches!(next(&mut client_rx).await, LinkEvent::Lost { .. }));
        quiet(&mut client_rx).await;
    }

    #[tokio::test]
    async fn close_is_silent_and_releases() {
        let ((server, mut server_rx), _client) = connected_pair().await;
        server.close().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(server.connection().is_none());
        quiet(&mut server_rx).await;
        server.close().await;
    }

    #[tokio::test]
    async fn new_bring_up_replaces_open_connection() {
        let ((server, mut server_rx), _client) = connected_pair().await;
        let (listener, _addr) = loopback_listener().await;
        server.listen(listener);
        assert!(matches!(
            next(&mut server_rx).await,
            LinkEvent::Lost {
                reason: LostReason::Replaced,
                ..
            }
        ));
        assert_eq!(server.state(), ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn read_frame_distinguishes_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(matches!(read_frame(&mut empty).await, Err(ReadError::Eof)));
        let mut partial: &[u8] = &[1, 0, 0];
        assert!(matches!(read_frame(&mut partial).await, Err(ReadError::Io(_))));
    }

    #[tokio::test]
    async fn retire_reports_open_connection_once() {
        let ((server, mut server_rx), (_client, mut client_rx)) = connected_pair().await;
        server.retire();
        assert!(matches!(
            next(&mut server_rx).await,
            LinkEvent::Lost {
                reason: LostReason::Replaced,
                ..
            }
        ));
        server.close().await;
        quiet(&mut server_rx).await;
        assert!(matches!(next(&mut client_rx).await, LinkEvent::Lost { .. }));
    }

    #[tokio::test]
    async fn retire_while_negotiating_is_silent() {
        let (server, mut rx) = channel(Role::Publisher);
        let (listener, _addr) = loopback_listener().await;
        let id = server.listen(listener);
        server.retire();
        timeout(Duration::from_secs(1), server.closed(id))
            .await
            .expect("closed resolves");
        quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn closed_resolves_when_read_loop_fails() {
        let (server, mut rx) = channel(Role::Publisher);
        let (listener, addr) = loopback_listener().await;
        let id = server.listen(listener);
        let mut raw = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(next(&mut rx).await, LinkEvent::Established { .. }));
        raw.write_all(&[9, 0, 0, 0, 0]).await.unwrap();
        timeout(Duration::from_secs(5), server.closed(id))
            .await
            .expect("closed resolves");
        assert!(matches!(next(&mut rx).await, LinkEvent::Lost { .. }));
    }

    #[tokio::test]
    async fn end_ignores_stale_connection() {
        let ((server, mut server_rx), _client) = connected_pair().await;
        let old = server.connection().unwrap();
        let (listener, _addr) = loopback_listener().await;
        let new = server.listen(listener);
        assert!(matches!(next(&mut server_rx).await, LinkEvent::Lost { .. }));
        server.end(old, LostReason::NetworkLost);
        assert_eq!(server.connection(), Some(new));
        assert_eq!(server.state(), ConnectionState::Negotiating);
        quiet(&mut server_rx).await;
    }
}
