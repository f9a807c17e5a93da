use std::fmt::Display;
use std::future::Future;

use axum::extract::ws::Message as ClientMessage;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::PreOpenBuffer;
use crate::error::{upstream_error_notice, SetupError};
use crate::frame::{CloseSpec, ControlFrame, Frame, Inbound};

/// Characters of a client text frame shown in sampled logs.
const CLIENT_PREVIEW_CHARS: usize = 80;
/// Characters of an upstream text frame shown in sampled logs.
const UPSTREAM_PREVIEW_CHARS: usize = 120;

const CLIENT_SAMPLER: LogSampler = LogSampler::new(3, 200);
const UPSTREAM_SAMPLER: LogSampler = LogSampler::new(5, 100);

/// Lifecycle of one socket as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle of the whole session. `Errored` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    SettingUp,
    Relaying,
    Closing,
    Closed,
    Errored,
}

/// Per-direction message counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_messages: u64,
    pub upstream_messages: u64,
}

/// Decides which frame numbers get a diagnostic log line: the first `head`
/// frames, then every `every`-th.
#[derive(Debug, Clone, Copy)]
pub struct LogSampler {
    head: u64,
    every: u64,
}

impl LogSampler {
    pub const fn new(head: u64, every: u64) -> Self {
        Self { head, every }
    }

    pub fn should_log(&self, count: u64) -> bool {
        count <= self.head || (self.every > 0 && count % self.every == 0)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub session_id: Uuid,
    pub stats: RelayStats,
    pub phase: SessionPhase,
}

/// State for one accepted client connection and its upstream counterpart.
///
/// [`run`](Self::run) drives the whole lifecycle from a single dispatch
/// loop: client frames are buffered while `setup` is pending, the buffer is
/// drained once the upstream opens, and the loop then forwards both
/// directions until either side leaves the open state.
pub struct RelaySession {
    session_id: Uuid,
    agent_id: String,
    stats: RelayStats,
    buffer: PreOpenBuffer,
    client: SocketState,
    upstream: SocketState,
    phase: SessionPhase,
}

impl RelaySession {
    pub fn new(session_id: Uuid, agent_id: impl Into<String>) -> Self {
        Self {
            session_id,
            agent_id: agent_id.into(),
            stats: RelayStats::default(),
            buffer: PreOpenBuffer::new(),
            client: SocketState::Open,
            upstream: SocketState::Connecting,
            phase: SessionPhase::SettingUp,
        }
    }

    /// Relay between the client halves and the upstream produced by `setup`.
    pub async fn run<CTx, CRx, CErr, S, UTx, URx, UErr>(
        mut self,
        mut client_tx: CTx,
        mut client_rx: CRx,
        setup: S,
    ) -> RelaySummary
    where
        CTx: Sink<ClientMessage> + Unpin,
        <CTx as Sink<ClientMessage>>::Error: Display,
        CRx: Stream<Item = Result<ClientMessage, CErr>> + Unpin,
        CErr: Display,
        S: Future<Output = Result<(UTx, URx), SetupError>>,
        UTx: Sink<UpstreamMessage> + Unpin,
        <UTx as Sink<UpstreamMessage>>::Error: Display,
        URx: Stream<Item = Result<UpstreamMessage, UErr>> + Unpin,
        UErr: Display,
    {
        let mut setup = std::pin::pin!(setup);

        // ------------------------------------------------------------------
        // 1. Setting up: buffer client frames until the upstream opens.
        // ------------------------------------------------------------------
        let (mut upstream_tx, mut upstream_rx) = loop {
            tokio::select! {
                result = &mut setup => match result {
                    Ok(halves) => break halves,
                    Err(err) => {
                        self.fail_setup(&mut client_tx, err).await;
                        let _ = client_tx.close().await;
                        return self.finish();
                    }
                },
                next = client_rx.next() => match next {
                    Some(Ok(msg)) => match Inbound::from(msg) {
                        Inbound::Data(frame) => {
                            self.count_client(&frame);
                            self.buffer.push(frame);
                        }
                        Inbound::Close(close) => {
                            self.client_closed(close.as_ref());
                            self.upstream = SocketState::Closed;
                            let _ = client_tx.close().await;
                            return self.finish();
                        }
                        Inbound::Control => {}
                    },
                    Some(Err(err)) => {
                        error!(session_id = %self.session_id, %err, "client error during setup");
                        self.client = SocketState::Closed;
                        self.upstream = SocketState::Closed;
                        self.phase = SessionPhase::Errored;
                        return self.finish();
                    }
                    None => {
                        self.client_closed(None);
                        self.upstream = SocketState::Closed;
                        return self.finish();
                    }
                },
            }
        };

        // ------------------------------------------------------------------
        // 2. Upstream open: drain the buffer, mark ready, notify the client.
        //    Nothing reads the client until this block is done.
        // ------------------------------------------------------------------
        self.upstream = SocketState::Open;
        info!(
            session_id = %self.session_id,
            agent_id = %self.agent_id,
            buffered = self.buffer.len(),
            buffered_bytes = self.buffer.bytes(),
            "connected to upstream"
        );

        let pending: Vec<Frame> = self.buffer.drain().collect();
        for frame in pending {
            if let Err(err) = upstream_tx.send(frame.into_upstream()).await {
                warn!(session_id = %self.session_id, %err, "upstream write failed during flush");
                self.upstream = SocketState::Closed;
                self.phase = SessionPhase::Errored;
                self.notify_client_error(&mut client_tx, upstream_error_notice())
                    .await;
                let _ = client_tx.close().await;
                return self.finish();
            }
        }

        self.phase = SessionPhase::Relaying;
        if !self
            .send_control(&mut client_tx, ControlFrame::ProxyConnected)
            .await
        {
            self.close_upstream(&mut upstream_tx).await;
            return self.finish();
        }

        // ------------------------------------------------------------------
        // 3. Relaying: forward both directions until one side leaves open.
        // ------------------------------------------------------------------
        loop {
            tokio::select! {
                next = client_rx.next() => match next {
                    Some(Ok(msg)) => match Inbound::from(msg) {
                        Inbound::Data(frame) => {
                            self.count_client(&frame);
                            if let Err(err) = upstream_tx.send(frame.into_upstream()).await {
                                error!(session_id = %self.session_id, %err, "upstream write failed");
                                self.upstream = SocketState::Closed;
                                self.phase = SessionPhase::Errored;
                                self.notify_client_error(&mut client_tx, upstream_error_notice())
                                    .await;
                                break;
                            }
                        }
                        Inbound::Close(close) => {
                            self.client_closed(close.as_ref());
                            self.close_upstream(&mut upstream_tx).await;
                            break;
                        }
                        Inbound::Control => {}
                    },
                    Some(Err(err)) => {
                        error!(session_id = %self.session_id, %err, "client error");
                        self.client = SocketState::Closed;
                        self.phase = SessionPhase::Errored;
                        self.close_upstream(&mut upstream_tx).await;
                        break;
                    }
                    None => {
                        self.client_closed(None);
                        self.close_upstream(&mut upstream_tx).await;
                        break;
                    }
                },
                next = upstream_rx.next() => match next {
                    Some(Ok(msg)) => match Inbound::from(msg) {
                        Inbound::Data(frame) => {
                            self.count_upstream(&frame);
                            if self.client == SocketState::Open
                                && !self.send_client(&mut client_tx, frame).await
                            {
                                self.close_upstream(&mut upstream_tx).await;
                                break;
                            }
                        }
                        Inbound::Close(close) => {
                            self.upstream_closed(close.as_ref());
                            self.close_client(&mut client_tx, close.as_ref()).await;
                            break;
                        }
                        Inbound::Control => {}
                    },
                    Some(Err(err)) => {
                        error!(session_id = %self.session_id, %err, "upstream error");
                        self.upstream = SocketState::Closed;
                        self.phase = SessionPhase::Errored;
                        self.notify_client_error(&mut client_tx, upstream_error_notice())
                            .await;
                        break;
                    }
                    None => {
                        self.upstream_closed(None);
                        self.close_client(&mut client_tx, None).await;
                        break;
                    }
                },
            }
        }

        let _ = upstream_tx.close().await;
        let _ = client_tx.close().await;
        self.finish()
    }

    fn count_client(&mut self, frame: &Frame) {
        self.stats.client_messages += 1;
        let n = self.stats.client_messages;
        if CLIENT_SAMPLER.should_log(n) {
            info!(
                session_id = %self.session_id,
                n,
                binary = frame.is_binary(),
                preview = %frame.preview(CLIENT_PREVIEW_CHARS),
                "client -> upstream"
            );
        }
    }

    fn count_upstream(&mut self, frame: &Frame) {
        self.stats.upstream_messages += 1;
        let n = self.stats.upstream_messages;
        if UPSTREAM_SAMPLER.should_log(n) {
            info!(
                session_id = %self.session_id,
                n,
                binary = frame.is_binary(),
                preview = %frame.preview(UPSTREAM_PREVIEW_CHARS),
                "upstream -> client"
            );
        }
    }

    fn client_closed(&mut self, close: Option<&CloseSpec>) {
        self.client = SocketState::Closed;
        self.begin_closing();
        info!(
            session_id = %self.session_id,
            code = close.map(|c| c.code),
            reason = close.map(|c| c.reason.as_str()).unwrap_or(""),
            client_messages = self.stats.client_messages,
            upstream_messages = self.stats.upstream_messages,
            "client disconnected"
        );
    }

    fn upstream_closed(&mut self, close: Option<&CloseSpec>) {
        self.upstream = SocketState::Closed;
        self.begin_closing();
        info!(
            session_id = %self.session_id,
            code = close.map(|c| c.code),
            reason = close.map(|c| c.reason.as_str()).unwrap_or(""),
            client_messages = self.stats.client_messages,
            upstream_messages = self.stats.upstream_messages,
            "upstream disconnected"
        );
    }

    fn begin_closing(&mut self) {
        if self.phase != SessionPhase::Errored {
            self.phase = SessionPhase::Closing;
        }
    }

    async fn fail_setup<T>(&mut self, client_tx: &mut T, err: SetupError)
    where
        T: Sink<ClientMessage> + Unpin,
        T::Error: Display,
    {
        error!(
            session_id = %self.session_id,
            agent_id = %self.agent_id,
            %err,
            "session setup failed"
        );
        self.upstream = SocketState::Closed;
        self.phase = SessionPhase::Errored;
        self.notify_client_error(client_tx, err.client_notice()).await;
    }

    /// Send one error notification and close the client with `close`.
    /// Does nothing once the client has left the open state.
    async fn notify_client_error<T>(
        &mut self,
        client_tx: &mut T,
        (notice, close): (ControlFrame, CloseSpec),
    ) where
        T: Sink<ClientMessage> + Unpin,
        T::Error: Display,
    {
        if self.client != SocketState::Open {
            return;
        }
        if self.send_control(client_tx, notice).await {
            self.close_client(client_tx, Some(&close)).await;
        }
    }

    /// Encode and send a relay notification. An encoding failure is logged
    /// and skipped; only a failed write returns `false`.
    async fn send_control<T>(&mut self, client_tx: &mut T, control: ControlFrame) -> bool
    where
        T: Sink<ClientMessage> + Unpin,
        T::Error: Display,
    {
        match control.into_frame() {
            Ok(frame) => self.send_client(client_tx, frame).await,
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "failed to encode control frame");
                true
            }
        }
    }

    /// Write one data frame to the client. A failed write marks the client
    /// closed and returns `false`.
    async fn send_client<T>(&mut self, client_tx: &mut T, frame: Frame) -> bool
    where
        T: Sink<ClientMessage> + Unpin,
        T::Error: Display,
    {
        match client_tx.send(frame.into_client()).await {
            Ok(()) => true,
            Err(err) => {
                debug!(session_id = %self.session_id, %err, "client write failed");
                self.client = SocketState::Closed;
                false
            }
        }
    }

    async fn close_client<T>(&mut self, client_tx: &mut T, close: Option<&CloseSpec>)
    where
        T: Sink<ClientMessage> + Unpin,
        T::Error: Display,
    {
        if self.client != SocketState::Open {
            return;
        }
        self.client = SocketState::Closing;
        if let Err(err) = client_tx.send(CloseSpec::client_message(close)).await {
            debug!(session_id = %self.session_id, %err, "client close failed");
        }
        self.client = SocketState::Closed;
    }

    async fn close_upstream<T>(&mut self, upstream_tx: &mut T)
    where
        T: Sink<UpstreamMessage> + Unpin,
        T::Error: Display,
    {
        if self.upstream != SocketState::Open {
            return;
        }
        self.upstream = SocketState::Closing;
        if let Err(err) = upstream_tx.send(CloseSpec::upstream_message(None)).await {
            debug!(session_id = %self.session_id, %err, "upstream close failed");
        }
        self.upstream = SocketState::Closed;
    }

    fn finish(mut self) -> RelaySummary {
        if self.phase != SessionPhase::Errored {
            self.phase = SessionPhase::Closed;
        }
        info!(
            session_id = %self.session_id,
            agent_id = %self.agent_id,
            phase = ?self.phase,
            client_messages = self.stats.client_messages,
            upstream_messages = self.stats.upstream_messages,
            "session finished"
        );
        RelaySummary {
            session_id: self.session_id,
            stats: self.stats,
            phase: self.phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;

    use super::*;

    type UpstreamHalves = (
        mpsc::UnboundedSender<UpstreamMessage>,
        mpsc::UnboundedReceiver<Result<UpstreamMessage, String>>,
    );

    /// In-memory stand-in for both sockets.
    struct Harness {
        client_in: mpsc::UnboundedSender<Result<ClientMessage, String>>,
        client_out: mpsc::UnboundedReceiver<ClientMessage>,
        setup: Option<oneshot::Sender<Result<UpstreamHalves, SetupError>>>,
        handle: JoinHandle<RelaySummary>,
    }

    /// The test's view of the upstream socket.
    struct Upstream {
        sent: mpsc::UnboundedReceiver<UpstreamMessage>,
        inject: mpsc::UnboundedSender<Result<UpstreamMessage, String>>,
    }

    impl Harness {
        fn start() -> Self {
            let (client_in, client_rx) = mpsc::unbounded();
            let (client_tx, client_out) = mpsc::unbounded();
            let (setup_tx, setup_rx) = oneshot::channel::<Result<UpstreamHalves, SetupError>>();

            let setup = async move {
                setup_rx.await.unwrap_or_else(|_| {
                    Err(SetupError::MalformedResponse("setup dropped".to_string()))
                })
            };
            let session = RelaySession::new(Uuid::new_v4(), "agent_test");
            let handle = tokio::spawn(session.run(client_tx, client_rx, setup));

            Self {
                client_in,
                client_out,
                setup: Some(setup_tx),
                handle,
            }
        }

        fn client_sends(&self, msg: ClientMessage) {
            self.client_in.unbounded_send(Ok(msg)).unwrap();
        }

        fn open_upstream(&mut self) -> Upstream {
            let (upstream_tx, sent) = mpsc::unbounded();
            let (inject, upstream_rx) = mpsc::unbounded();
            let _ = self.setup.take().unwrap().send(Ok((upstream_tx, upstream_rx)));
            Upstream { sent, inject }
        }

        fn fail_setup(&mut self, err: SetupError) {
            let _ = self.setup.take().unwrap().send(Err(err));
        }

        async fn client_receives(&mut self) -> Inbound {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.client_out.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client channel closed");
            Inbound::from(msg)
        }

        async fn summary(self) -> RelaySummary {
            tokio::time::timeout(Duration::from_secs(2), self.handle)
                .await
                .expect("session did not finish")
                .unwrap()
        }
    }

    impl Upstream {
        async fn receives(&mut self) -> Option<Inbound> {
            tokio::time::timeout(Duration::from_secs(2), self.sent.next())
                .await
                .expect("timed out waiting for upstream frame")
                .map(Inbound::from)
        }

        fn sends(&self, msg: UpstreamMessage) {
            self.inject.unbounded_send(Ok(msg)).unwrap();
        }
    }

    fn text(s: &str) -> Inbound {
        Inbound::Data(Frame::Text(s.to_string()))
    }

    fn control(frame: ControlFrame) -> Inbound {
        Inbound::Data(frame.into_frame().unwrap())
    }

    /// Let the session task consume whatever is queued.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn sampler_logs_head_then_every_nth() {
        let sampler = LogSampler::new(3, 200);
        let logged: Vec<u64> = (1..=600).filter(|n| sampler.should_log(*n)).collect();
        assert_eq!(logged, vec![1, 2, 3, 200, 400, 600]);
    }

    #[tokio::test]
    async fn buffered_frames_flush_in_order_before_live_frames() {
        let mut h = Harness::start();
        h.client_sends(ClientMessage::Text("one".into()));
        h.client_sends(ClientMessage::Binary(vec![2, 2]));
        h.client_sends(ClientMessage::Text("three".into()));
        settle().await;

        let mut upstream = h.open_upstream();
        h.client_sends(ClientMessage::Text("live".into()));

        assert_eq!(upstream.receives().await, Some(text("one")));
        assert_eq!(upstream.receives().await, Some(Inbound::Data(Frame::Binary(vec![2, 2]))));
        assert_eq!(upstream.receives().await, Some(text("three")));
        assert_eq!(upstream.receives().await, Some(text("live")));

        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        h.client_sends(ClientMessage::Close(None));
        let summary = h.summary().await;
        assert_eq!(summary.stats.client_messages, 4);
        assert_eq!(summary.phase, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn upstream_frames_keep_their_kind() {
        let mut h = Harness::start();
        let upstream = h.open_upstream();
        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        upstream.sends(UpstreamMessage::Binary(vec![9u8, 8, 7].into()));
        upstream.sends(UpstreamMessage::Text("{\"type\":\"audio\"}".into()));
        upstream.sends(UpstreamMessage::Ping(Vec::<u8>::new().into()));

        assert_eq!(h.client_receives().await, Inbound::Data(Frame::Binary(vec![9, 8, 7])));
        assert_eq!(h.client_receives().await, text("{\"type\":\"audio\"}"));

        upstream.sends(UpstreamMessage::Close(None));
        let _ = h.client_receives().await;
        let summary = h.summary().await;
        assert_eq!(summary.stats.upstream_messages, 2);
    }

    #[tokio::test]
    async fn upstream_close_propagates_code_and_reason() {
        let mut h = Harness::start();
        let upstream = h.open_upstream();
        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        upstream.sends(UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })));

        assert_eq!(
            h.client_receives().await,
            Inbound::Close(Some(CloseSpec::new(1000, "done")))
        );
        assert_eq!(h.summary().await.phase, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn client_close_closes_upstream_without_forwarding_more() {
        let mut h = Harness::start();
        let mut upstream = h.open_upstream();
        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        h.client_sends(ClientMessage::Text("last".into()));
        h.client_sends(ClientMessage::Close(None));
        h.client_sends(ClientMessage::Text("after close".into()));

        assert_eq!(upstream.receives().await, Some(text("last")));
        assert_eq!(upstream.receives().await, Some(Inbound::Close(None)));
        assert_eq!(upstream.receives().await, None);
        assert_eq!(h.summary().await.stats.client_messages, 1);
    }

    #[tokio::test]
    async fn upstream_error_notifies_client_once_then_closes() {
        let mut h = Harness::start();
        let upstream = h.open_upstream();
        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        upstream
            .inject
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();

        assert_eq!(
            h.client_receives().await,
            control(ControlFrame::error("ElevenLabs connection error"))
        );
        assert_eq!(
            h.client_receives().await,
            Inbound::Close(Some(CloseSpec::new(1011, "Upstream error")))
        );
        assert!(h.client_out.next().await.is_none());
        assert_eq!(h.summary().await.phase, SessionPhase::Errored);
    }

    #[tokio::test]
    async fn client_error_closes_upstream() {
        let mut h = Harness::start();
        let mut upstream = h.open_upstream();
        assert_eq!(h.client_receives().await, control(ControlFrame::ProxyConnected));

        h.client_in
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();

        assert_eq!(upstream.receives().await, Some(Inbound::Close(None)));
        assert_eq!(h.summary().await.phase, SessionPhase::Errored);
    }

    #[tokio::test]
    async fn auth_failure_reports_status_and_never_opens_upstream() {
        let mut h = Harness::start();
        h.client_sends(ClientMessage::Text("early".into()));
        settle().await;
        h.fail_setup(SetupError::AuthFailed {
            status: 403,
            body: "forbidden".to_string(),
        });

        assert_eq!(h.client_receives().await, control(ControlFrame::error("Auth failed: 403")));
        assert_eq!(
            h.client_receives().await,
            Inbound::Close(Some(CloseSpec::new(1011, "Auth failed")))
        );
        let summary = h.summary().await;
        assert_eq!(summary.phase, SessionPhase::Errored);
        assert_eq!(summary.stats.upstream_messages, 0);
    }

    #[tokio::test]
    async fn client_leaving_during_setup_abandons_it() {
        let mut h = Harness::start();
        h.client_sends(ClientMessage::Close(None));
        let setup = h.setup.take().unwrap();

        let summary = h.summary().await;
        assert_eq!(summary.phase, SessionPhase::Closed);
        // The pending setup future was dropped with the session.
        assert!(setup.is_canceled());
    }

    #[tokio::test]
    async fn closing_twice_sends_one_close() {
        let (mut client_tx, mut client_out) = mpsc::unbounded::<ClientMessage>();
        let mut session = RelaySession::new(Uuid::new_v4(), "agent_test");
        let close = CloseSpec::new(1011, "Upstream error");

        session
            .notify_client_error(&mut client_tx, upstream_error_notice())
            .await;
        session.close_client(&mut client_tx, Some(&close)).await;
        session
            .notify_client_error(&mut client_tx, upstream_error_notice())
            .await;
        drop(client_tx);

        let sent: Vec<Inbound> = client_out.by_ref().map(Inbound::from).collect().await;
        assert_eq!(
            sent,
            vec![
                control(ControlFrame::error("ElevenLabs connection error")),
                Inbound::Close(Some(close)),
            ]
        );
    }

    #[tokio::test]
    async fn closing_upstream_twice_sends_one_close() {
        let (mut upstream_tx, upstream_out) = mpsc::unbounded::<UpstreamMessage>();
        let mut session = RelaySession::new(Uuid::new_v4(), "agent_test");
        session.upstream = SocketState::Open;

        session.close_upstream(&mut upstream_tx).await;
        session.close_upstream(&mut upstream_tx).await;
        drop(upstream_tx);

        let sent: Vec<UpstreamMessage> = upstream_out.collect().await;
        assert_eq!(sent, vec![UpstreamMessage::Close(None)]);
    }
}
