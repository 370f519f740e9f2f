//! Connection supervision, reply demultiplexing, and the send/listen/respond
//! paths.

use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_broker::{Connection, Delivery, Dial, Gate, Publishing};
use courier_wire::{headers, Request, Response, ENCODING_REQUEST, ENCODING_RESPONSE};

use crate::{Config, TransportError, DIRECT_REPLY_QUEUE};

/// A handle to the broker-coupled RPC transport.
///
/// Cheap to clone; all clones share one supervisor, one reply consumer and
/// one listener registry. The transport starts lazily: the first call to
/// [`readiness`](Transport::readiness), [`send`](Transport::send),
/// [`listen`](Transport::listen) or [`respond`](Transport::respond) installs
/// a connection handle and spawns the supervisor, so every method must be
/// invoked from within a tokio runtime.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

/// The connection pair. Only ever replaced together, under the write side of
/// the lock; readers snapshot both under the read side.
struct ConnState {
    conn: Option<Arc<dyn Connection>>,
    ready: Gate,
}

struct ListenerEntry {
    /// Kills this listener.
    kill: CancellationToken,
    /// Fired by the listener once it has deregistered and released
    /// everything it owns.
    done: Gate,
}

/// Lock order when more than one is held: `conn`, then `listeners`, then
/// `inflight`. No guard is ever held across an await point.
struct Shared {
    dialer: Arc<dyn Dial>,
    config: Config,
    reply_queue: String,
    conn: RwLock<ConnState>,
    /// Correlation id → the pending caller's rendezvous.
    inflight: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    listeners: RwLock<HashMap<String, ListenerEntry>>,
    /// Teardown broadcast: fired by `stop`, by the connect timeout, and by a
    /// reply-queue failure.
    dying: CancellationToken,
    /// Fired once the supervisor has killed listeners and closed the
    /// connection.
    stopped: Gate,
    /// Terminal error, recorded before `dying` fires when the supervisor
    /// dies on its own.
    fatal: OnceLock<TransportError>,
    run_once: Once,
}

impl Transport {
    /// Build a transport over the given dialer with default configuration.
    pub fn new(dialer: impl Dial) -> Self {
        Self::with_config(dialer, Config::default())
    }

    /// Build a transport over the given dialer.
    pub fn with_config(dialer: impl Dial, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                dialer: Arc::new(dialer),
                config,
                reply_queue: DIRECT_REPLY_QUEUE.to_string(),
                conn: RwLock::new(ConnState {
                    conn: None,
                    ready: Gate::new(),
                }),
                inflight: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                dying: CancellationToken::new(),
                stopped: Gate::new(),
                fatal: OnceLock::new(),
                run_once: Once::new(),
            }),
        }
    }

    /// The current readiness gate.
    ///
    /// It may already have fired; callers wait on it with their own timeout.
    /// After a reconnect, callers that already observed a previous gate are
    /// unaffected; new callers observe the fresh gate.
    pub fn readiness(&self) -> Gate {
        ensure_running(&self.shared);
        self.shared.readiness_snapshot()
    }

    /// Number of in-flight requests awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.inflight.lock().len()
    }

    /// Number of live service listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().len()
    }

    /// Publish `req` and wait for its response.
    ///
    /// `timeout` is a single budget across the readiness wait and the
    /// response wait. A request with no id gets a fresh uuid; a
    /// caller-provided id is never overwritten.
    pub async fn send(
        &self,
        mut req: Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let shared = &self.shared;
        ensure_running(shared);

        if req.id.is_empty() {
            req.id = Uuid::new_v4().to_string();
        }

        let rsp_rx = {
            let (tx, rx) = oneshot::channel();
            shared.inflight.lock().insert(req.id.clone(), tx);
            rx
        };
        let _inflight = InflightGuard {
            shared: Arc::clone(shared),
            id: req.id.clone(),
        };

        let service = req.service.clone();
        let endpoint = req.endpoint.clone();
        req.set_header(headers::CONTENT_ENCODING, ENCODING_REQUEST);
        req.set_header(headers::SERVICE, service);
        req.set_header(headers::ENDPOINT, endpoint);

        tokio::pin! {
            let deadline = sleep(timeout);
        }

        let ready = shared.readiness_snapshot();
        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => return Err(shared.exit_error()),
            _ = ready.fired() => {}
            _ = &mut deadline => {
                warn!(after = ?timeout, "timed out waiting for ready");
                return Err(TransportError::Timeout);
            }
        }

        let publishing = Publishing {
            correlation_id: req.id.clone(),
            timestamp: SystemTime::now(),
            body: req.payload.clone(),
            reply_to: Some(shared.reply_queue.clone()),
            headers: req.headers.clone(),
        };
        if let Err(e) = shared
            .connection()
            .publish(&shared.config.exchange, &req.service, publishing)
            .await
        {
            error!(error = %e, "failed to publish");
            return Err(TransportError::Broker(e));
        }

        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => Err(shared.exit_error()),
            rsp = rsp_rx => match rsp {
                Ok(rsp) => Ok(rsp),
                Err(_) => {
                    // The rendezvous can only vanish if another caller reused
                    // this id and clobbered the entry.
                    debug!(id = %req.id, "rendezvous dropped; treating as timeout");
                    Err(TransportError::Timeout)
                }
            },
            _ = &mut deadline => {
                warn!(id = %req.id, after = ?timeout, "timed out waiting for response");
                Err(TransportError::Timeout)
            }
        }
    }

    /// Register a listener for `service`, forwarding inbound requests into
    /// `sink`. Returns once the underlying consume is live.
    ///
    /// The channel closes when the listener stops. A second listener for the
    /// same service is refused with
    /// [`AlreadyListening`](TransportError::AlreadyListening) without
    /// touching its channel.
    pub async fn listen(
        &self,
        service: &str,
        sink: mpsc::Sender<Request>,
    ) -> Result<(), TransportError> {
        let shared = &self.shared;
        ensure_running(shared);

        let kill = CancellationToken::new();
        let done = Gate::new();
        {
            let mut listeners = shared.listeners.write();
            if listeners.contains_key(service) {
                return Err(TransportError::AlreadyListening);
            }
            listeners.insert(
                service.to_string(),
                ListenerEntry {
                    kill: kill.clone(),
                    done: done.clone(),
                },
            );
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::spawn(run_listener(
            Arc::clone(shared),
            service.to_string(),
            sink,
            kill,
            done,
            ack_tx,
        ));

        match ack_rx.await {
            Ok(result) => result,
            // The listener died before its consume came up: teardown.
            Err(_) => Err(shared.exit_error()),
        }
    }

    /// Kill the listener for `service` and wait for it to drain. Returns
    /// whether a listener existed.
    pub async fn stop_listening(&self, service: &str) -> bool {
        let entry = {
            let listeners = self.shared.listeners.read();
            listeners
                .get(service)
                .map(|e| (e.kill.clone(), e.done.clone()))
        };
        match entry {
            Some((kill, done)) => {
                kill.cancel();
                done.fired().await;
                true
            }
            None => false,
        }
    }

    /// Publish `rsp` back to the caller of `req`, using the request's
    /// reply-to address as the routing key on the default exchange.
    pub async fn respond(&self, req: &Request, mut rsp: Response) -> Result<(), TransportError> {
        let shared = &self.shared;
        ensure_running(shared);

        let Some(reply_to) = req.reply_to() else {
            return Err(TransportError::NoReplyTo);
        };
        rsp.set_header(headers::CONTENT_ENCODING, ENCODING_RESPONSE);

        let ready = shared.readiness_snapshot();
        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => return Err(shared.exit_error()),
            _ = ready.fired() => {}
            _ = sleep(shared.config.respond_timeout) => return Err(TransportError::Timeout),
        }

        let publishing = Publishing {
            correlation_id: rsp.id.clone(),
            timestamp: SystemTime::now(),
            body: rsp.payload.clone(),
            reply_to: None,
            headers: rsp.headers.clone(),
        };
        shared
            .connection()
            .publish("", reply_to, publishing)
            .await
            .map_err(TransportError::Broker)
    }

    /// Tear the transport down: kill listeners, close the connection.
    /// Returns once the supervisor has fully exited. Idempotent.
    pub async fn stop(&self) {
        self.shared.dying.cancel();
        if self.shared.run_once.is_completed() {
            self.shared.stopped.fired().await;
        }
    }
}

impl Shared {
    /// Dial a fresh handle and install it as the current connection,
    /// re-arming the ready gate if the previous one had fired. Pre-start and
    /// pre-reconnect waiters keep the gate they already hold.
    fn install_fresh_conn(&self) -> Arc<dyn Connection> {
        let conn = self.dialer.dial();
        let mut state = self.conn.write();
        state.conn = Some(Arc::clone(&conn));
        if state.ready.is_fired() {
            state.ready = Gate::new();
        }
        conn
    }

    fn readiness_snapshot(&self) -> Gate {
        self.conn.read().ready.clone()
    }

    fn connection(&self) -> Arc<dyn Connection> {
        let state = self.conn.read();
        // The supervisor installs a connection synchronously before any
        // caller can get this far.
        state.conn.clone().expect("transport started")
    }

    /// What a caller observes once `dying` has fired.
    fn exit_error(&self) -> TransportError {
        self.fatal
            .get()
            .cloned()
            .unwrap_or(TransportError::Stopped)
    }

    /// Record a terminal error and begin teardown.
    fn die(&self, err: TransportError) {
        let _ = self.fatal.set(err);
        self.dying.cancel();
    }

    async fn kill_listeners(&self) {
        let entries: Vec<(CancellationToken, Gate)> = self
            .listeners
            .read()
            .values()
            .map(|e| (e.kill.clone(), e.done.clone()))
            .collect();
        for (kill, _) in &entries {
            kill.cancel();
        }
        for (_, done) in &entries {
            done.fired().await;
        }
    }

    /// Route one reply-queue delivery to its in-flight caller.
    ///
    /// The rendezvous is single-slot and its entry is removed before the
    /// hand-off, so the hand-off itself never blocks: if the caller has
    /// already left, the response is dropped here.
    fn handle_rsp_delivery(&self, delivery: Delivery) {
        let log_id = log_id(&delivery);
        match delivery
            .headers
            .get(headers::CONTENT_ENCODING)
            .map(String::as_str)
        {
            Some(ENCODING_RESPONSE) => {
                let rsp = response_from_delivery(delivery);
                let waiter = self.inflight.lock().remove(&rsp.id);
                match waiter {
                    Some(tx) => {
                        if tx.send(rsp).is_err() {
                            error!(delivery = %log_id, "could not deliver response: caller already gone");
                        }
                    }
                    None => {
                        warn!(delivery = %log_id, "could not match response to a pending call");
                    }
                }
            }
            enc => {
                error!(delivery = %log_id, encoding = ?enc, "cannot handle content encoding as response");
            }
        }
    }
}

/// Start the supervisor exactly once, installing the first connection handle
/// synchronously so callers immediately observe a `(conn, ready)` pair.
fn ensure_running(shared: &Arc<Shared>) {
    let cloned = Arc::clone(shared);
    shared.run_once.call_once(move || {
        let conn = cloned.install_fresh_conn();
        tokio::spawn(run_supervisor(cloned, conn));
    });
}

/// Removes the caller's rendezvous on every exit path of `send`.
struct InflightGuard {
    shared: Arc<Shared>,
    id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.shared.inflight.lock().remove(&self.id);
    }
}

/// Why the reply consumer returned.
enum ReplyOutcome {
    /// Teardown was requested.
    Dying,
    /// The broker session died underneath the consumer; reconnect.
    SessionLost,
    /// The reply queue could not be established; the transport cannot serve
    /// calls and must die.
    Fatal(TransportError),
}

/// The connection run loop: owns the handle, serves replies, dials a fresh
/// handle on session loss, and tears everything down on exit.
async fn run_supervisor(shared: Arc<Shared>, mut conn: Arc<dyn Connection>) {
    loop {
        info!("run loop connecting");
        let up = conn.session_up();
        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => break,
            _ = up.fired() => {
                info!("run loop connected");
                match serve_replies(&shared, &conn).await {
                    ReplyOutcome::Dying => break,
                    ReplyOutcome::Fatal(e) => {
                        shared.die(e);
                        break;
                    }
                    ReplyOutcome::SessionLost => {
                        if shared.dying.is_cancelled() {
                            break;
                        }
                        conn.close().await;
                        conn = shared.install_fresh_conn();
                    }
                }
            }
            _ = sleep(shared.config.connect_timeout) => {
                error!(after = ?shared.config.connect_timeout, "run loop timed out waiting to connect");
                shared.die(TransportError::CouldNotConnect);
                break;
            }
        }
    }
    shared.kill_listeners().await;
    conn.close().await;
    shared.stopped.fire();
    info!("transport dead; connection closed");
}

/// Declare the reply queue, begin consuming, fire the ready gate, then
/// demultiplex response deliveries to in-flight callers until the session is
/// lost or teardown begins.
async fn serve_replies(shared: &Shared, conn: &Arc<dyn Connection>) -> ReplyOutcome {
    if let Err(e) = conn.declare_reply_queue(&shared.reply_queue).await {
        error!(queue = %shared.reply_queue, error = %e, "failed to declare reply queue; cannot serve calls");
        return ReplyOutcome::Fatal(TransportError::Broker(e));
    }
    let mut consumer = match conn.consume(&shared.reply_queue).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(queue = %shared.reply_queue, error = %e, "failed to consume reply queue; cannot serve calls");
            return ReplyOutcome::Fatal(TransportError::Broker(e));
        }
    };
    debug!(queue = %shared.reply_queue, "listening for replies");

    // Readiness only fires once replies can actually be received.
    let ready = shared.readiness_snapshot();
    if !ready.is_fired() {
        ready.fire();
    }

    loop {
        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => {
                info!("reply consumer terminating");
                return ReplyOutcome::Dying;
            }
            delivery = consumer.deliveries.recv() => match delivery {
                Some(delivery) => shared.handle_rsp_delivery(delivery),
                None => {
                    warn!(queue = %shared.reply_queue, cause = %TransportError::DeliveriesClosed, "reply delivery stream closed");
                    return ReplyOutcome::SessionLost;
                }
            }
        }
    }
}

/// Deregisters the listener exactly once, on whichever path its task exits.
struct ListenerGuard {
    shared: Arc<Shared>,
    service: String,
    done: Gate,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.shared.listeners.write().remove(&self.service);
        self.done.fire();
        debug!(service = %self.service, "listener stopped");
    }
}

/// Supervises one service-queue consumer: waits for readiness, starts the
/// consume, acknowledges the `listen` caller, then forwards request
/// deliveries until killed or the stream closes.
async fn run_listener(
    shared: Arc<Shared>,
    service: String,
    sink: mpsc::Sender<Request>,
    kill: CancellationToken,
    done: Gate,
    ack: oneshot::Sender<Result<(), TransportError>>,
) {
    // Dropping `sink` on exit (once the per-delivery hand-offs finish)
    // closes the caller's channel; an unsent `ack` closes the handshake.
    let _cleanup = ListenerGuard {
        shared: Arc::clone(&shared),
        service: service.clone(),
        done,
    };

    let ready = shared.readiness_snapshot();
    tokio::select! {
        biased;
        _ = shared.dying.cancelled() => return,
        _ = kill.cancelled() => return,
        _ = ready.fired() => {}
        _ = sleep(shared.config.connect_timeout) => {
            let _ = ack.send(Err(TransportError::Timeout));
            return;
        }
    }

    let mut consumer = match shared.connection().consume(&service).await {
        Ok(consumer) => consumer,
        Err(e) => {
            warn!(service = %service, error = %e, "failed to consume");
            let _ = ack.send(Err(TransportError::Broker(e)));
            return;
        }
    };
    let _ = ack.send(Ok(()));
    info!(service = %service, "listening");

    loop {
        tokio::select! {
            biased;
            _ = shared.dying.cancelled() => return,
            _ = kill.cancelled() => return,
            delivery = consumer.deliveries.recv() => match delivery {
                Some(delivery) => {
                    // One task per delivery: a slow receiver must not block
                    // the queue behind it. Each task is bounded by the
                    // hand-off timeout.
                    let sink = sink.clone();
                    let handoff = shared.config.handoff_timeout;
                    tokio::spawn(handle_req_delivery(delivery, sink, handoff));
                }
                None => {
                    warn!(service = %service, "delivery stream closed; stopping listener");
                    return;
                }
            }
        }
    }
}

/// Hand one service-queue delivery off into the listener's channel.
async fn handle_req_delivery(delivery: Delivery, sink: mpsc::Sender<Request>, handoff: Duration) {
    let log_id = log_id(&delivery);
    match delivery
        .headers
        .get(headers::CONTENT_ENCODING)
        .map(String::as_str)
    {
        Some(ENCODING_REQUEST) => {
            let req = request_from_delivery(delivery);
            match sink.send_timeout(req, handoff).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    error!(delivery = %log_id, after = ?handoff, "could not deliver request: receiving channel is full");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(delivery = %log_id, "receiver gone; request dropped");
                }
            }
        }
        enc => {
            debug!(delivery = %log_id, encoding = ?enc, "cannot handle content encoding as request");
        }
    }
}

/// `routing_key[correlation_id]`, the form log lines identify deliveries by.
fn log_id(delivery: &Delivery) -> String {
    format!("{}[{}]", delivery.routing_key, delivery.correlation_id)
}

/// Materialize a request from a service-queue delivery.
fn request_from_delivery(delivery: Delivery) -> Request {
    let Delivery {
        correlation_id,
        reply_to,
        routing_key: _,
        headers: delivery_headers,
        body,
    } = delivery;
    let mut req = Request {
        id: correlation_id,
        service: String::new(),
        endpoint: String::new(),
        headers: delivery_headers,
        payload: body,
    };
    req.set_header(headers::REPLY_TO, reply_to);
    let service = req.header(headers::SERVICE).unwrap_or_default().to_string();
    let endpoint = req.header(headers::ENDPOINT).unwrap_or_default().to_string();
    req.service = service;
    req.endpoint = endpoint;
    req
}

/// Materialize a response from a reply-queue delivery.
fn response_from_delivery(delivery: Delivery) -> Response {
    let Delivery {
        correlation_id,
        reply_to,
        routing_key: _,
        headers: delivery_headers,
        body,
    } = delivery;
    let mut rsp = Response {
        id: correlation_id,
        headers: delivery_headers,
        payload: body,
    };
    rsp.set_header(headers::REPLY_TO, reply_to);
    rsp
}
