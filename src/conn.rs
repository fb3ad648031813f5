// One LDAP connection: a single reader task demultiplexing responses by message ID,
// serialized writes, and the typed operations built on the send primitive.

use crate::ber::{self, Packet};
use crate::error::{LdapError, Result, RESULT_COMPARE_FALSE, RESULT_COMPARE_TRUE, RESULT_SASL_BIND_IN_PROGRESS};
use crate::ldap_protocol::{
    decode_bind_response, decode_result, decode_search_reference, envelope, message_id, op_name, response_op,
    AbandonRequest, AddRequest, BindAuthentication, BindRequest, BindResponse, CompareRequest, Control, DelRequest, ExtendedRequest,
    ExtendedResponse, LdapOperation, LdapResult, ModifyDnRequest, ModifyRequest, SearchEntry, SearchRequest,
    SearchResult, UnbindRequest, APP_BIND_RESPONSE, APP_COMPARE_RESPONSE, APP_EXTENDED_RESPONSE, APP_INTERMEDIATE_RESPONSE,
    APP_SEARCH_RESULT_DONE, APP_SEARCH_RESULT_ENTRY, APP_SEARCH_RESULT_REFERENCE, NOTICE_OF_DISCONNECTION_OID,
};
use crate::metrics::Metrics;
use crate::observer::{NoopObserver, PacketObserver};
use crate::registry::{Delivery, MessageRegistry, ResponseItem, ResponseReceiver, SlotKind};
use arc_swap::ArcSwap;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Deadline for each request, from send to final response.
    pub timeout: Option<Duration>,
    /// Fail on a response tag mismatch instead of logging and reading the result.
    pub strict_responses: bool,
    /// Largest inbound message accepted before the connection is torn down.
    pub max_message_size: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            strict_responses: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

type Observer = Arc<ArcSwap<Box<dyn PacketObserver>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct ConnInner {
    writer: tokio::sync::Mutex<Writer>,
    registry: Arc<MessageRegistry>,
    observer: Observer,
    metrics: Arc<Metrics>,
    options: ConnOptions,
    reader: JoinHandle<()>,
}

impl ConnInner {
    /// Fail every pending request, stop the reader and drop our write half.
    /// Only call while holding the writer lock.
    fn shutdown(&self, writer: &mut Writer, reason: &str) {
        let closed = self.registry.close_all();
        *writer = Box::new(tokio::io::sink());
        self.reader.abort();
        Metrics::inc(&self.metrics.network_shutdowns);
        warn!("LDAP connection shut down ({}), closed {} pending requests", reason, closed);
    }
}

/// Held across a write; shuts the connection down unless the write completed.
struct WriteGuard<'a> {
    writer: tokio::sync::MutexGuard<'a, Writer>,
    inner: &'a ConnInner,
    reason: String,
    done: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.inner.shutdown(&mut self.writer, &self.reason);
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Cloneable handle to a connection; the reader task stops when the last handle is dropped.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
    Cancelled,
}

/// A request that has been written and owns its registry entry.
/// Dropping it releases the entry; late responses are then discarded by the reader.
pub struct PendingResponse {
    id: i32,
    receiver: ResponseReceiver,
    registry: Arc<MessageRegistry>,
    deadline: Option<(Instant, Duration)>,
    state: RequestState,
    released: bool,
}

impl PendingResponse {
    pub fn message_id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Next message for this request, bounded by the connection's request timeout.
    pub async fn recv(&mut self) -> Result<Packet> {
        match self.deadline {
            Some((deadline, timeout)) => {
                match tokio::time::timeout_at(deadline.into(), self.recv_inner()).await {
                    Ok(item) => item,
                    Err(_) => {
                        self.cancel();
                        Err(LdapError::Timeout(timeout))
                    }
                }
            }
            None => self.recv_inner().await,
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Packet> {
        match tokio::time::timeout(timeout, self.recv_inner()).await {
            Ok(item) => item,
            Err(_) => {
                self.cancel();
                Err(LdapError::Timeout(timeout))
            }
        }
    }

    async fn recv_inner(&mut self) -> Result<Packet> {
        if self.released {
            return Err(LdapError::channel_closed());
        }
        self.state = RequestState::AwaitingResponse;
        match self.receiver.recv().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.fail();
                Err(e)
            }
            None => {
                self.fail();
                Err(LdapError::channel_closed())
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.remove(self.id);
        }
    }

    /// Final response consumed.
    pub fn finish(&mut self) {
        self.state = RequestState::Completed;
        self.release();
    }

    pub fn cancel(&mut self) {
        self.state = RequestState::Cancelled;
        self.release();
    }

    fn fail(&mut self) {
        self.state = RequestState::Failed;
        self.release();
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.release();
    }
}

/// State the reader task shares with the connection handles.
struct ReaderShared {
    registry: Arc<MessageRegistry>,
    observer: Observer,
    metrics: Arc<Metrics>,
    max_message_size: usize,
}

impl Conn {
    /// Take ownership of an established stream and start the reader task.
    /// Must be called inside a tokio runtime.
    pub fn new<S>(stream: S, options: ConnOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_metrics(stream, options, Arc::new(Metrics::new()))
    }

    pub fn with_metrics<S>(stream: S, options: ConnOptions, metrics: Arc<Metrics>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let registry = Arc::new(MessageRegistry::new());
        let observer: Observer = Arc::new(ArcSwap::from_pointee(
            Box::new(NoopObserver) as Box<dyn PacketObserver>
        ));
        let shared = ReaderShared {
            registry: Arc::clone(&registry),
            observer: Arc::clone(&observer),
            metrics: Arc::clone(&metrics),
            max_message_size: options.max_message_size,
        };
        let reader = tokio::spawn(reader_loop(read_half, shared));
        Self {
            inner: Arc::new(ConnInner {
                writer: tokio::sync::Mutex::new(Box::new(write_half)),
                registry,
                observer,
                metrics,
                options,
                reader,
            }),
        }
    }

    /// Replace the packet observer; takes effect for the next packet.
    pub fn set_observer<O: PacketObserver + 'static>(&self, observer: O) {
        self.inner.observer.store(Arc::new(Box::new(observer)));
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn options(&self) -> &ConnOptions {
        &self.inner.options
    }

    /// Requests still waiting for their response.
    pub fn outstanding(&self) -> usize {
        self.inner.registry.outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registry.is_closed()
    }

    /// Frame `op` with a fresh message ID and write it. The returned handle yields the responses.
    pub async fn send(&self, op: Packet, controls: &[Control]) -> Result<PendingResponse> {
        self.dispatch(op, controls, SlotKind::Single, "other").await
    }

    async fn dispatch(
        &self,
        op: Packet,
        controls: &[Control],
        kind: SlotKind,
        name: &'static str,
    ) -> Result<PendingResponse> {
        let (id, receiver) = self.inner.registry.register(kind)?;
        let deadline = self.inner.options.timeout.map(|t| (Instant::now() + t, t));
        let mut pending = PendingResponse {
            id,
            receiver,
            registry: Arc::clone(&self.inner.registry),
            deadline,
            state: RequestState::Idle,
            released: false,
        };
        let message = envelope(id, op, controls);
        self.inner.observer.load().on_send(id, &message);
        let bytes = message.serialize();
        debug!("Sending {} (msgid {}, {} bytes)", op_name(message.children[1].tag), id, bytes.len());

        let written = match deadline {
            Some((at, timeout)) => tokio::time::timeout_at(at.into(), self.write_frame(&bytes))
                .await
                .unwrap_or(Err(LdapError::Timeout(timeout))),
            None => self.write_frame(&bytes).await,
        };
        if let Err(e) = written {
            pending.fail();
            return Err(e);
        }
        pending.state = RequestState::Sent;
        self.inner.metrics.inc_request(name);
        Ok(pending)
    }

    /// Write one whole envelope under the writer lock. A write that fails or is
    /// dropped part way tears the connection down, so no later envelope can
    /// follow a truncated one.
    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let writer = self.inner.writer.lock().await;
        if self.inner.registry.is_closed() {
            return Err(LdapError::Network("connection closed".to_string()));
        }
        let mut guard = WriteGuard {
            writer,
            inner: &self.inner,
            reason: "write interrupted".to_string(),
            done: false,
        };
        let written: std::io::Result<()> = async {
            guard.writer.write_all(bytes).await?;
            guard.writer.flush().await
        }
        .await;
        match written {
            Ok(()) => {
                guard.done = true;
                Ok(())
            }
            Err(e) => {
                guard.reason = format!("write failed: {}", e);
                Err(LdapError::Network(guard.reason.clone()))
            }
        }
    }

    /// Send an operation the server never answers (unbind, abandon).
    async fn send_without_response<O: LdapOperation + ?Sized>(&self, op: &O) -> Result<i32> {
        let packet = op.to_packet()?;
        let mut pending = self
            .dispatch(packet, op.controls(), SlotKind::Single, op.name())
            .await?;
        pending.finish();
        Ok(pending.message_id())
    }

    /// Decode the LDAPResult of a final response, honoring the strictness mode.
    fn check_result(&self, message: &Packet, expected: u32) -> Result<LdapResult> {
        if response_op(message).is_ok_and(|op| op.tag != expected) {
            Metrics::inc(&self.inner.metrics.unexpected_responses);
        }
        let result = decode_result(message, expected, self.inner.options.strict_responses)?;
        self.inner.metrics.inc_result_code(result.result_code);
        Ok(result)
    }

    fn observe<T>(&self, op: &'static str, started: Instant, outcome: &Result<T>) {
        self.inner.metrics.observe_duration(op, started.elapsed());
        if let Err(e) = outcome {
            self.inner.metrics.inc_error(op);
            if matches!(e, LdapError::Timeout(_)) {
                Metrics::inc(&self.inner.metrics.timeouts);
            }
            debug!("{} failed: {}", op, e);
        }
    }

    /// Send `op` and wait for its single final response message.
    async fn round_trip<O: LdapOperation + ?Sized>(&self, op: &O) -> Result<Packet> {
        let packet = op.to_packet()?;
        let mut pending = self
            .dispatch(packet, op.controls(), SlotKind::Single, op.name())
            .await?;
        let message = pending.recv().await?;
        pending.finish();
        Ok(message)
    }

    /// Run any single-response operation and map its result code.
    pub async fn execute<O: LdapOperation>(&self, op: &O) -> Result<LdapResult> {
        let Some(expected) = op.response_tag() else {
            self.send_without_response(op).await?;
            return Ok(LdapResult::default());
        };
        let started = Instant::now();
        let outcome = match self.round_trip(op).await {
            Ok(message) => self.check_result(&message, expected).and_then(LdapResult::success),
            Err(e) => Err(e),
        };
        self.observe(op.name(), started, &outcome);
        outcome
    }

    pub async fn bind(&self, req: &BindRequest) -> Result<BindResponse> {
        let started = Instant::now();
        let outcome: Result<BindResponse> = async {
            let message = self.round_trip(req).await?;
            if response_op(&message).is_ok_and(|op| op.tag != APP_BIND_RESPONSE) {
                Metrics::inc(&self.inner.metrics.unexpected_responses);
            }
            let response = decode_bind_response(&message, self.inner.options.strict_responses)?;
            self.inner.metrics.inc_result_code(response.result.result_code);
            match response.result.result_code {
                // SASL exchanges continue with the server's challenge
                RESULT_SASL_BIND_IN_PROGRESS if matches!(req.authentication, BindAuthentication::Sasl { .. }) => {
                    Ok(response)
                }
                _ => {
                    let BindResponse {
                        result,
                        server_sasl_creds,
                    } = response;
                    Ok(BindResponse {
                        result: result.success()?,
                        server_sasl_creds,
                    })
                }
            }
        }
        .await;
        self.observe(req.name(), started, &outcome);
        outcome
    }

    pub async fn simple_bind(&self, dn: &str, password: &str) -> Result<LdapResult> {
        Ok(self.bind(&BindRequest::simple(dn, password)).await?.result)
    }

    pub async fn sasl_bind(&self, mechanism: &str, credentials: Option<Vec<u8>>) -> Result<BindResponse> {
        self.bind(&BindRequest::sasl(mechanism, credentials)).await
    }

    pub async fn delete(&self, dn: &str) -> Result<LdapResult> {
        self.execute(&DelRequest::new(dn)).await
    }

    pub async fn modify(&self, req: &ModifyRequest) -> Result<LdapResult> {
        self.execute(req).await
    }

    pub async fn add(&self, req: &AddRequest) -> Result<LdapResult> {
        self.execute(req).await
    }

    pub async fn modify_dn(&self, req: &ModifyDnRequest) -> Result<LdapResult> {
        self.execute(req).await
    }

    /// `compareTrue` and `compareFalse` are the two successful outcomes.
    pub async fn compare(&self, dn: &str, attr: &str, value: impl AsRef<[u8]>) -> Result<bool> {
        let req = CompareRequest::new(dn, attr, value);
        let started = Instant::now();
        let outcome: Result<bool> = async {
            let message = self.round_trip(&req).await?;
            let result = self.check_result(&message, APP_COMPARE_RESPONSE)?;
            match result.result_code {
                RESULT_COMPARE_TRUE => Ok(true),
                RESULT_COMPARE_FALSE => Ok(false),
                0 => Err(LdapError::protocol("compare answered success instead of compareTrue/compareFalse")),
                _ => Err(result.into_error()),
            }
        }
        .await;
        self.observe(req.name(), started, &outcome);
        outcome
    }

    /// Collect every entry and reference until the SearchResultDone.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResult> {
        let started = Instant::now();
        let outcome = self.collect_search(req).await;
        self.observe(req.name(), started, &outcome);
        outcome
    }

    async fn collect_search(&self, req: &SearchRequest) -> Result<SearchResult> {
        let packet = req.to_packet()?;
        let mut pending = self
            .dispatch(packet, req.controls(), SlotKind::Stream, req.name())
            .await?;
        let mut result = SearchResult::default();
        loop {
            let message = pending.recv().await?;
            let op = response_op(&message)?;
            match op.tag {
                APP_SEARCH_RESULT_ENTRY => result.entries.push(SearchEntry::from_op(op)?),
                APP_SEARCH_RESULT_REFERENCE => result.referrals.extend(decode_search_reference(op)?),
                APP_INTERMEDIATE_RESPONSE => {
                    debug!("Ignoring intermediate response for search {}", pending.message_id())
                }
                _ => {
                    pending.finish();
                    result.result = self.check_result(&message, APP_SEARCH_RESULT_DONE)?.success()?;
                    return Ok(result);
                }
            }
        }
    }

    pub async fn extended(&self, req: &ExtendedRequest) -> Result<ExtendedResponse> {
        let started = Instant::now();
        let outcome: Result<ExtendedResponse> = async {
            let message = self.round_trip(req).await?;
            if response_op(&message).is_ok_and(|op| op.tag != APP_EXTENDED_RESPONSE) {
                Metrics::inc(&self.inner.metrics.unexpected_responses);
            }
            let response = ExtendedResponse::from_message(&message, self.inner.options.strict_responses)?;
            self.inner.metrics.inc_result_code(response.result.result_code);
            let ExtendedResponse {
                result,
                response_name,
                response_value,
            } = response;
            Ok(ExtendedResponse {
                result: result.success()?,
                response_name,
                response_value,
            })
        }
        .await;
        self.observe(req.name(), started, &outcome);
        outcome
    }

    /// RFC 4532 authorization identity of the bound user; empty for anonymous.
    pub async fn who_am_i(&self) -> Result<String> {
        let response = self.extended(&ExtendedRequest::who_am_i()).await?;
        match response.response_value {
            Some(value) => String::from_utf8(value).map_err(|_| LdapError::protocol("authzId is not UTF-8")),
            None => Ok(String::new()),
        }
    }

    /// Ask the server to stop processing `message_id`. Nothing is awaited.
    pub async fn abandon(&self, message_id: i32) -> Result<()> {
        self.send_without_response(&AbandonRequest::new(message_id)).await?;
        Ok(())
    }

    /// Send an unbind and close the connection. Outstanding requests fail with a network error.
    pub async fn unbind(&self) -> Result<()> {
        let sent = self.send_without_response(&UnbindRequest::default()).await;
        let closed = self.inner.registry.close_all();
        if let Err(e) = self.inner.writer.lock().await.shutdown().await {
            debug!("Shutdown after unbind failed: {}", e);
        }
        debug!("Unbind sent, closed {} pending requests", closed);
        sent.map(|_| ())
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(mut reader: R, shared: ReaderShared) {
    let mut buf = BytesMut::with_capacity(4096);
    let reason = loop {
        match ber::read_frame(&mut reader, &mut buf, shared.max_message_size).await {
            Ok(Some(frame)) => shared.handle_frame(&frame),
            Ok(None) => break "connection closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    let was_closed = shared.registry.is_closed();
    let closed = shared.registry.close_all();
    if was_closed {
        debug!("LDAP reader stopped: {}", reason);
    } else {
        Metrics::inc(&shared.metrics.network_shutdowns);
        info!("LDAP reader stopped ({}), closed {} pending requests", reason, closed);
    }
}

impl ReaderShared {
    fn handle_frame(&self, frame: &[u8]) {
        let decoded = ber::decode(frame).and_then(|packet| Ok((message_id(&packet)?, packet)));
        let (id, packet) = match decoded {
            Ok(message) => message,
            Err(e) => {
                Metrics::inc(&self.metrics.decode_errors);
                self.observer.load().on_decode_error(frame, &e);
                match ber::message_id_hint(frame).filter(|id| *id > 0) {
                    Some(id) => {
                        warn!("Malformed response for msgid {}: {}", id, e);
                        self.deliver(id, Err(e));
                    }
                    None => {
                        warn!("Dropping malformed message: {}", e);
                        Metrics::inc(&self.metrics.frames_dropped);
                    }
                }
                return;
            }
        };
        self.observer.load().on_receive(id, &packet);
        if id == 0 {
            self.handle_unsolicited(&packet);
            return;
        }
        self.deliver(id, Ok(packet));
    }

    fn deliver(&self, id: i32, item: ResponseItem) {
        match self.registry.deliver(id, item) {
            Delivery::Delivered => Metrics::inc(&self.metrics.responses_delivered),
            Delivery::Full => {
                warn!("Response slot for msgid {} already full, dropping message", id);
                Metrics::inc(&self.metrics.slots_full);
            }
            Delivery::Abandoned => {
                debug!("Request {} no longer waiting, dropping message", id);
                Metrics::inc(&self.metrics.frames_dropped);
            }
            Delivery::Unknown => {
                debug!("No pending request for msgid {}, dropping message", id);
                Metrics::inc(&self.metrics.frames_dropped);
            }
        }
    }

    fn handle_unsolicited(&self, packet: &Packet) {
        Metrics::inc(&self.metrics.frames_dropped);
        match ExtendedResponse::from_message(packet, false) {
            Ok(notice) if notice.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) => {
                warn!(
                    "Notice of Disconnection from server: code {} {}",
                    notice.result.result_code, notice.result.diagnostic_message
                );
            }
            _ => debug!("Dropping unsolicited notification"),
        }
    }
}
