//! Request/response/callback dispatcher
//!
//! One serial line is multiplexed across concurrent synchronous requests,
//! one-shot waiters and persistent callback subscribers. Inbound frames are
//! decoded through the command registry and fanned out to every listener
//! registered for their header.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

use crate::commands::{
    rpc_error, AnyCommand, CommandMatcher, MtCommand, PatternOf, SyncRequest,
};
use crate::frame::GeneralFrame;
use crate::types::ProtocolError;
use crate::uart::{self, SerialConfig};

/// SREQ to SRSP deadline
pub const DEFAULT_SREQ_TIMEOUT: Duration = Duration::from_secs(5);

/// End-to-end deadline for a request that completes with a callback
pub const DEFAULT_ARSP_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct ZnpConfig {
    pub sreq_timeout: Duration,
    pub arsp_timeout: Duration,
}

impl Default for ZnpConfig {
    fn default() -> Self {
        Self {
            sreq_timeout: DEFAULT_SREQ_TIMEOUT,
            arsp_timeout: DEFAULT_ARSP_TIMEOUT,
        }
    }
}

type CallbackFn = Arc<dyn Fn(&AnyCommand) + Send + Sync>;

enum ListenerKind {
    /// Completion slot, consumed by the first matching frame
    OneShot(Option<oneshot::Sender<AnyCommand>>),
    /// Fired for every matching frame, never consumed
    Callback(CallbackFn),
}

struct Listener {
    matchers: Vec<Arc<dyn CommandMatcher>>,
    kind: ListenerKind,
}

impl Listener {
    fn headers(&self) -> Vec<u16> {
        let mut headers: Vec<u16> =
            self.matchers.iter().map(|m| m.header().raw()).collect();
        headers.sort_unstable();
        headers.dedup();
        headers
    }
}

#[derive(Default)]
struct ListenerTable {
    /// Listener ids per command header, in registration (FIFO) order
    by_header: HashMap<u16, Vec<u64>>,
    entries: HashMap<u64, Listener>,
}

impl ListenerTable {
    fn insert(&mut self, id: u64, listener: Listener) {
        for header in listener.headers() {
            self.by_header.entry(header).or_default().push(id);
        }
        self.entries.insert(id, listener);
    }

    fn remove(&mut self, id: u64) {
        let Some(listener) = self.entries.remove(&id) else {
            return;
        };
        for header in listener.headers() {
            if let Some(ids) = self.by_header.get_mut(&header) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.by_header.remove(&header);
                }
            }
        }
    }
}

/// Drop redundant patterns: a pattern subsumed by a more general one in the
/// same set would only cause double resolution.
pub(crate) fn deduplicate_matchers(
    matchers: Vec<Arc<dyn CommandMatcher>>,
) -> Vec<Arc<dyn CommandMatcher>> {
    let mut maximal: Vec<Arc<dyn CommandMatcher>> = Vec::new();

    for matcher in matchers {
        if maximal.iter().any(|kept| kept.subsumes(matcher.as_ref())) {
            continue;
        }
        maximal.retain(|kept| !matcher.subsumes(kept.as_ref()));
        maximal.push(matcher);
    }

    maximal
}

/// A registered one-shot listener
///
/// Dropping the future removes the listener from the table, so a cancelled
/// waiter can never consume a later unrelated frame.
pub struct ResponseFuture {
    rx: oneshot::Receiver<AnyCommand>,
    _guard: ListenerGuard,
}

impl ResponseFuture {
    /// Wait for the first matching command
    pub async fn recv(self) -> Result<AnyCommand, ProtocolError> {
        self.rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Wait and convert to a concrete command type
    pub async fn recv_as<C>(self) -> Result<C, ProtocolError>
    where
        C: TryFrom<AnyCommand, Error = AnyCommand>,
    {
        let command = self.recv().await?;
        C::try_from(command).map_err(|response| ProtocolError::InvalidCommandResponse {
            response: Box::new(response),
        })
    }
}

struct ListenerGuard {
    znp: Arc<Znp>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.znp.remove_listener(self.id);
    }
}

/// The MT dispatcher bound to one coprocessor
pub struct Znp {
    config: ZnpConfig,
    write_tx: mpsc::Sender<GeneralFrame>,
    listeners: Mutex<ListenerTable>,
    /// Held for the whole SREQ/SRSP round trip; at most one SREQ is ever
    /// outstanding on the wire
    sreq_lock: AsyncMutex<()>,
    next_listener_id: AtomicU64,
    connected: watch::Sender<bool>,
}

impl Znp {
    fn new(config: ZnpConfig, write_tx: mpsc::Sender<GeneralFrame>) -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        Arc::new(Self {
            config,
            write_tx,
            listeners: Mutex::new(ListenerTable::default()),
            sreq_lock: AsyncMutex::new(()),
            next_listener_id: AtomicU64::new(1),
            connected,
        })
    }

    /// Open the serial port and attach the reader/writer tasks
    pub async fn connect(
        serial: &SerialConfig,
        config: ZnpConfig,
    ) -> Result<Arc<Self>, ProtocolError> {
        let (write_tx, write_rx) = mpsc::channel(32);
        let znp = Self::new(config, write_tx);
        uart::attach(serial, znp.clone(), write_rx).await?;
        Ok(znp)
    }

    /// Create a dispatcher without a serial port
    ///
    /// Frames written by requests appear on the returned receiver; inbound
    /// frames are injected with [`Znp::frame_received`]. Used by tests and
    /// coprocessor simulators.
    pub fn detached(config: ZnpConfig) -> (Arc<Self>, mpsc::Receiver<GeneralFrame>) {
        let (write_tx, write_rx) = mpsc::channel(32);
        (Self::new(config, write_tx), write_rx)
    }

    #[must_use]
    pub fn config(&self) -> &ZnpConfig {
        &self.config
    }

    /// Resolves to `false` once the transport is lost or closed
    #[must_use]
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Called by the UART when the port is gone
    pub fn connection_lost(&self) {
        tracing::warn!("serial connection lost");
        self.close();
    }

    /// Cancel every pending future, drop every listener and detach from
    /// the transport. The dispatcher cannot be reused afterwards.
    pub fn close(&self) {
        let mut table = self.listeners.lock().unwrap();
        let pending = table.entries.len();
        table.entries.clear();
        table.by_header.clear();
        drop(table);

        if pending > 0 {
            tracing::debug!(pending, "cancelled listeners on close");
        }
        self.connected.send_replace(false);
    }

    fn remove_listener(&self, id: u64) {
        self.listeners.lock().unwrap().remove(id);
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().entries.len()
    }

    /// Register a one-shot listener resolving on the first command that
    /// matches any of the patterns
    pub fn wait_for_responses(
        self: &Arc<Self>,
        matchers: Vec<Arc<dyn CommandMatcher>>,
    ) -> ResponseFuture {
        let matchers = deduplicate_matchers(matchers);
        assert!(!matchers.is_empty(), "a listener needs at least one pattern");

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.listeners.lock().unwrap().insert(
            id,
            Listener {
                matchers,
                kind: ListenerKind::OneShot(Some(tx)),
            },
        );

        ResponseFuture {
            rx,
            _guard: ListenerGuard {
                znp: self.clone(),
                id,
            },
        }
    }

    /// Register a one-shot listener for a single typed pattern
    pub fn wait_for<P: PatternOf>(self: &Arc<Self>, pattern: P) -> ResponseFuture {
        self.wait_for_responses(vec![Arc::new(pattern)])
    }

    /// Register a persistent callback fired for every matching command
    ///
    /// Callbacks are only removed by [`Znp::close`]. A panicking callback
    /// is trapped and logged so it cannot stop dispatch to the others.
    pub fn callback_for_responses<F>(
        self: &Arc<Self>,
        matchers: Vec<Arc<dyn CommandMatcher>>,
        callback: F,
    ) where
        F: Fn(&AnyCommand) + Send + Sync + 'static,
    {
        let matchers = deduplicate_matchers(matchers);
        assert!(!matchers.is_empty(), "a listener needs at least one pattern");

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(
            id,
            Listener {
                matchers,
                kind: ListenerKind::Callback(Arc::new(callback)),
            },
        );
    }

    /// Register a typed persistent callback for a single pattern
    pub fn callback_for<P, F>(self: &Arc<Self>, pattern: P, callback: F)
    where
        P: PatternOf,
        F: Fn(P::Command) + Send + Sync + 'static,
    {
        self.callback_for_responses(vec![Arc::new(pattern)], move |command| {
            if let Ok(command) = P::Command::try_from(command.clone()) {
                callback(command);
            }
        });
    }

    /// Fan a decoded frame out to the listeners
    ///
    /// May be called several times per UART read when multiple frames
    /// arrive together; each call resolves its listeners before the next
    /// frame is processed.
    pub fn frame_received(&self, frame: &GeneralFrame) {
        let command = match AnyCommand::decode(frame) {
            Ok(command) => command,
            Err(ProtocolError::UnknownCommand(header)) => {
                // The line is not poisoned by unknown frames
                tracing::warn!(%header, "received a frame for an unknown command");
                return;
            }
            Err(error) => {
                tracing::warn!(header = %frame.header, %error, "failed to decode frame");
                return;
            }
        };

        tracing::debug!(command = ?command, "received command");

        let mut matched = false;
        let mut one_shot_consumed = false;
        let mut callbacks: Vec<CallbackFn> = Vec::new();

        {
            let mut table = self.listeners.lock().unwrap();
            let ids = table
                .by_header
                .get(&command.header().raw())
                .cloned()
                .unwrap_or_default();

            let mut resolved = Vec::new();
            for id in ids {
                let Some(listener) = table.entries.get_mut(&id) else {
                    continue;
                };
                if !listener.matchers.iter().any(|m| m.matches_any(&command)) {
                    continue;
                }

                match &mut listener.kind {
                    ListenerKind::OneShot(slot) => {
                        if one_shot_consumed {
                            continue;
                        }
                        if let Some(tx) = slot.take() {
                            resolved.push(id);
                            if tx.send(command.clone()).is_ok() {
                                matched = true;
                                one_shot_consumed = true;
                            }
                        }
                    }
                    ListenerKind::Callback(callback) => {
                        callbacks.push(callback.clone());
                        matched = true;
                    }
                }
            }

            for id in resolved {
                table.remove(id);
            }
        }

        // Invoked outside the table lock so a callback may register new
        // listeners or issue requests
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&command))).is_err()
            {
                tracing::warn!("a command callback panicked");
            }
        }

        if !matched {
            tracing::warn!(command = ?command, "received an unhandled command");
        }
    }

    async fn send_frame(&self, frame: GeneralFrame) -> Result<(), ProtocolError> {
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Send a fire-and-forget asynchronous request
    pub async fn send<C: MtCommand>(&self, command: C) -> Result<(), ProtocolError> {
        tracing::debug!(command = ?command, "sending async request");
        self.send_frame(command.to_frame()).await
    }

    /// Send an SREQ and await its SRSP
    ///
    /// The response is checked against `expect`; a mismatch raises
    /// [`ProtocolError::InvalidCommandResponse`], an
    /// `RPCError.CommandNotRecognized` answer raises
    /// [`ProtocolError::CommandNotRecognized`].
    pub async fn request<R: SyncRequest>(
        self: &Arc<Self>,
        request: R,
        expect: R::Pattern,
    ) -> Result<R::Rsp, ProtocolError> {
        tracing::debug!(request = ?request, "sending request");

        let response = {
            let _sreq = self.sreq_lock.lock().await;

            // The listener must exist before the frame is on the wire
            let future = self.wait_for_responses(vec![
                Arc::new(R::Pattern::default()),
                Arc::new(rpc_error::CommandNotRecognizedPattern {
                    request_header: Some(R::HEADER),
                    ..Default::default()
                }),
            ]);
            self.send_frame(request.to_frame()).await?;

            tokio::time::timeout(self.config.sreq_timeout, future.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??
        };

        if matches!(response, AnyCommand::RpcCommandNotRecognized(_)) {
            return Err(ProtocolError::CommandNotRecognized { request: R::HEADER });
        }

        if !expect.matches_any(&response) {
            return Err(ProtocolError::InvalidCommandResponse {
                response: Box::new(response),
            });
        }

        R::Rsp::try_from(response).map_err(|response| {
            ProtocolError::InvalidCommandResponse {
                response: Box::new(response),
            }
        })
    }

    /// Send an SREQ, consume its SRSP, then await the real AREQ answer
    ///
    /// The callback listener is registered before the SREQ is sent because
    /// the SRSP and the AREQ may arrive in the same UART read and be
    /// dispatched in the same step. Either side timing out tears down both
    /// listeners.
    pub async fn request_callback_rsp<R, P>(
        self: &Arc<Self>,
        request: R,
        expect: R::Pattern,
        callback: P,
    ) -> Result<P::Command, ProtocolError>
    where
        R: SyncRequest,
        P: PatternOf,
    {
        let callback_future = self.wait_for(callback);
        self.request(request, expect).await?;

        tokio::time::timeout(
            self.config.arsp_timeout,
            callback_future.recv_as::<P::Command>(),
        )
        .await
        .map_err(|_| ProtocolError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LongBytes;
    use crate::commands::{af, sys};
    use crate::types::{
        Address, MtCapabilities, ResetReason, RpcErrorCode, Status, TransmitOptions,
    };

    fn frame_of<C: MtCommand>(command: C) -> GeneralFrame {
        command.to_frame()
    }

    #[tokio::test]
    async fn test_request_resolves_on_matching_srsp() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let requester = znp.request(
            sys::Ping {},
            sys::PingRspPattern {
                capabilities: Some(MtCapabilities::SYS),
            },
        );

        let responder = async {
            let frame = writes.recv().await.unwrap();
            assert_eq!(frame, sys::Ping {}.to_frame());

            znp.frame_received(&frame_of(sys::PingRsp {
                capabilities: MtCapabilities::SYS,
            }));
        };

        let (response, ()) = tokio::join!(requester, responder);
        assert_eq!(response.unwrap().capabilities, MtCapabilities::SYS);
        assert_eq!(znp.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_request_mismatched_srsp_is_an_error() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let requester = znp.request(
            sys::Ping {},
            sys::PingRspPattern {
                capabilities: Some(MtCapabilities::APP_CNF),
            },
        );

        let responder = async {
            let _ = writes.recv().await.unwrap();
            znp.frame_received(&frame_of(sys::PingRsp {
                capabilities: MtCapabilities::SYS,
            }));
        };

        let (response, ()) = tokio::join!(requester, responder);
        assert!(matches!(
            response,
            Err(ProtocolError::InvalidCommandResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_not_recognized() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let requester = znp.request(sys::Ping {}, sys::PingRspPattern::default());

        let responder = async {
            let _ = writes.recv().await.unwrap();
            znp.frame_received(&frame_of(rpc_error::CommandNotRecognized {
                error_code: RpcErrorCode::InvalidCommandId,
                request_header: <sys::Ping as MtCommand>::HEADER,
            }));
        };

        let (response, ()) = tokio::join!(requester, responder);
        assert!(matches!(
            response,
            Err(ProtocolError::CommandNotRecognized { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_callback_rsp_same_read() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let request = af::DataRequestExt {
            dst_addr: Address::Nwk(0x1234),
            dst_endpoint: 1,
            dst_pan_id: 0x0000,
            src_endpoint: 1,
            cluster_id: 0x0006,
            tsn: 5,
            options: TransmitOptions::default(),
            radius: 30,
            data: LongBytes(vec![0x01]),
        };

        let requester = znp.request_callback_rsp(
            request,
            af::DataRequestExtRspPattern {
                status: Some(Status::Success),
            },
            af::DataConfirmPattern {
                endpoint: Some(1),
                tsn: Some(5),
                ..Default::default()
            },
        );

        let responder = async {
            let _ = writes.recv().await.unwrap();

            // SRSP and AREQ delivered back to back, as when they share a
            // single UART read
            znp.frame_received(&frame_of(af::DataRequestExtRsp {
                status: Status::Success,
            }));
            znp.frame_received(&frame_of(af::DataConfirm {
                status: Status::Success,
                endpoint: 1,
                tsn: 5,
            }));
        };

        let (confirm, ()) = tokio::join!(requester, responder);
        let confirm = confirm.unwrap();
        assert_eq!(confirm.status, Status::Success);
        assert_eq!(znp.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_listeners_resolve_fifo() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());

        let first = znp.wait_for(sys::ResetIndPattern::default());
        let second = znp.wait_for(sys::ResetIndPattern::default());
        assert_eq!(znp.listener_count(), 2);

        let reset_ind = |reason| {
            frame_of(sys::ResetInd {
                reason,
                transport_rev: 2,
                product_id: 1,
                major_rel: 2,
                minor_rel: 7,
                hw_rev: 1,
            })
        };

        znp.frame_received(&reset_ind(ResetReason::PowerUp));
        assert_eq!(znp.listener_count(), 1);

        znp.frame_received(&reset_ind(ResetReason::Watchdog));
        assert_eq!(znp.listener_count(), 0);

        let first = first.recv_as::<sys::ResetInd>().await.unwrap();
        let second = second.recv_as::<sys::ResetInd>().await.unwrap();
        assert_eq!(first.reason, ResetReason::PowerUp);
        assert_eq!(second.reason, ResetReason::Watchdog);
    }

    #[tokio::test]
    async fn test_cancelled_listener_is_removed() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());

        let cancelled = znp.wait_for(sys::ResetIndPattern::default());
        let kept = znp.wait_for(sys::ResetIndPattern::default());
        drop(cancelled);
        assert_eq!(znp.listener_count(), 1);

        znp.frame_received(&frame_of(sys::ResetInd {
            reason: ResetReason::External,
            transport_rev: 2,
            product_id: 1,
            major_rel: 2,
            minor_rel: 7,
            hw_rev: 1,
        }));

        let resolved = kept.recv_as::<sys::ResetInd>().await.unwrap();
        assert_eq!(resolved.reason, ResetReason::External);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_futures() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());

        let pending = znp.wait_for(sys::ResetIndPattern::default());
        znp.close();

        assert_eq!(znp.listener_count(), 0);
        assert!(matches!(
            pending.recv().await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(!*znp.connection_watch().borrow());
    }

    #[tokio::test]
    async fn test_callbacks_fire_for_every_match() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        znp.callback_for(sys::ResetIndPattern::default(), move |ind: sys::ResetInd| {
            sink.lock().unwrap().push(ind.reason);
        });

        let frame = frame_of(sys::ResetInd {
            reason: ResetReason::PowerUp,
            transport_rev: 2,
            product_id: 1,
            major_rel: 2,
            minor_rel: 7,
            hw_rev: 1,
        });
        znp.frame_received(&frame);
        znp.frame_received(&frame);

        assert_eq!(seen.lock().unwrap().len(), 2);
        // Callback listeners are never consumed
        assert_eq!(znp.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sreq_timeout_removes_listener() {
        let (znp, _writes) = Znp::detached(ZnpConfig {
            sreq_timeout: Duration::from_millis(100),
            ..ZnpConfig::default()
        });

        let result = znp.request(sys::Ping {}, sys::PingRspPattern::default()).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert_eq!(znp.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_serialize_on_the_wire() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let ping = znp.request(sys::Ping {}, sys::PingRspPattern::default());
        let version = znp.request(sys::Version {}, sys::VersionRspPattern::default());

        let responder = async {
            for _ in 0..2 {
                let frame = writes.recv().await.unwrap();
                // Each SRSP is produced only after its own SREQ was seen,
                // so neither waiter can observe the other's response
                if frame.header == <sys::Ping as MtCommand>::HEADER {
                    znp.frame_received(&frame_of(sys::PingRsp {
                        capabilities: MtCapabilities::SYS | MtCapabilities::AF,
                    }));
                } else {
                    assert_eq!(frame.header, <sys::Version as MtCommand>::HEADER);
                    znp.frame_received(&frame_of(sys::VersionRsp {
                        transport_rev: 2,
                        product_id: 1,
                        major_rel: 2,
                        minor_rel: 7,
                        maint_rel: 1,
                        code_revision: Some(20220219),
                    }));
                }
            }
        };

        let (ping_rsp, version_rsp, ()) = tokio::join!(ping, version, responder);
        assert!(ping_rsp.unwrap().capabilities.contains(MtCapabilities::SYS));
        assert_eq!(version_rsp.unwrap().code_revision, Some(20220219));
    }

    #[test]
    fn test_matcher_deduplication() {
        let general = af::DataConfirmPattern {
            endpoint: Some(1),
            ..Default::default()
        };
        let specific = af::DataConfirmPattern {
            endpoint: Some(1),
            tsn: Some(5),
            ..Default::default()
        };

        let deduplicated = deduplicate_matchers(vec![
            Arc::new(specific.clone()),
            Arc::new(general.clone()),
        ]);
        assert_eq!(deduplicated.len(), 1);
        assert!(deduplicated[0]
            .as_any()
            .downcast_ref::<af::DataConfirmPattern>()
            .is_some_and(|kept| *kept == general));

        // Unrelated patterns are kept
        let deduplicated = deduplicate_matchers(vec![
            Arc::new(af::DataConfirmPattern::default()),
            Arc::new(sys::ResetIndPattern::default()),
        ]);
        assert_eq!(deduplicated.len(), 2);
    }
}
