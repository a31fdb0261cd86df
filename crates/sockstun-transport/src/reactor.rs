//! Tokio event loop driving an [`Engine`]
//!
//! The reactor owns every socket, timer and lookup. Each connection gets a reader task
//! and a writer task that talk to the loop over channels; the engine itself only ever
//! runs on the loop task, one event at a time.

use crate::offload::{Delivery, DeliveryReceiver};
use crate::{ConnId, Engine, Event, LookupId, Net, TimerId, TransportError, TransportResult, HIGH_WATER_MARK};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, trace, warn, Span};

/// Read chunk size per connection
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long a closing connection may take to flush and see the peer's EOF
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Longest timer the loop arms; the timer wheel cannot hold deadlines much past two years
const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Bind a listener, retrying while the address is still in TIME_WAIT
pub async fn bind_listener(addr: SocketAddr) -> TransportResult<TcpListener> {
    for attempt in 1..=3 {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/3", addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Address {} is in use (attempt {}/3), retrying in 1 second...",
                    addr, attempt
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(TransportError::BindError {
                    address: addr,
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(TransportError::BindError {
        address: addr,
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadGate {
    Open,
    Paused,
    /// Closing: discard input until the peer's EOF
    Draining,
}

enum Outbound {
    Data(Bytes),
    Shutdown,
}

enum IoEvent {
    Connect {
        conn: ConnId,
        result: std::io::Result<TcpStream>,
    },
    Data {
        conn: ConnId,
        data: Bytes,
    },
    ReadEnded {
        conn: ConnId,
    },
    WriteEnded {
        conn: ConnId,
        clean: bool,
    },
    Drained {
        conn: ConnId,
    },
    Resolved {
        lookup: LookupId,
        result: std::io::Result<Vec<SocketAddr>>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Timer(TimerId),
    Linger(ConnId),
}

struct Conn {
    outbound: mpsc::UnboundedSender<Outbound>,
    gate: watch::Sender<ReadGate>,
    queued: Arc<AtomicUsize>,
    over_mark: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    closing: bool,
    /// The engine is done with this connection; only `Closed` is reported
    retired: bool,
    reader_done: bool,
    writer_done: bool,
    closed_reported: bool,
}

/// Loop-side state; the `Net` handed to the engine
struct LoopIo {
    conns: HashMap<ConnId, Conn>,
    connecting: HashMap<ConnId, JoinHandle<()>>,
    timers: DelayQueue<Expiry>,
    timer_keys: HashMap<TimerId, delay_queue::Key>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    /// Events raised synchronously by engine calls, dispatched before the next poll
    pending: VecDeque<Event>,
    high_water_mark: usize,
    next_conn: u64,
    next_timer: u64,
    next_lookup: u64,
}

impl LoopIo {
    fn new(io_tx: mpsc::UnboundedSender<IoEvent>) -> Self {
        Self {
            conns: HashMap::new(),
            connecting: HashMap::new(),
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            io_tx,
            pending: VecDeque::new(),
            high_water_mark: HIGH_WATER_MARK,
            next_conn: 1,
            next_timer: 1,
            next_lookup: 1,
        }
    }

    fn next_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        id
    }

    fn attach(&mut self, conn: ConnId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%conn, "Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (gate_tx, gate_rx) = watch::channel(ReadGate::Open);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let over_mark = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(conn, read_half, gate_rx, self.io_tx.clone()));
        let writer = tokio::spawn(write_loop(
            conn,
            write_half,
            out_rx,
            queued.clone(),
            over_mark.clone(),
            self.io_tx.clone(),
        ));

        self.conns.insert(
            conn,
            Conn {
                outbound: out_tx,
                gate: gate_tx,
                queued,
                over_mark,
                reader,
                writer,
                closing: false,
                retired: false,
                reader_done: false,
                writer_done: false,
                closed_reported: false,
            },
        );
    }

    fn live(&self, conn: ConnId) -> Option<&Conn> {
        self.conns.get(&conn).filter(|c| !c.closing)
    }

    /// Live and still of interest to the engine
    fn watched(&self, conn: ConnId) -> Option<&Conn> {
        self.live(conn).filter(|c| !c.retired)
    }

    /// Start closing `conn`: flush, FIN, then drain input until EOF or the linger expires
    fn begin_close(&mut self, conn: ConnId) {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return;
        };
        if entry.closing {
            return;
        }
        entry.closing = true;
        entry.gate.send_replace(ReadGate::Draining);
        let _ = entry.outbound.send(Outbound::Shutdown);
        self.timers.insert(Expiry::Linger(conn), CLOSE_LINGER);
    }

    /// Drop `conn` once both of its tasks are done. Returns whether `Closed` is owed.
    fn reap(&mut self, conn: ConnId) -> bool {
        let done = self
            .conns
            .get(&conn)
            .map(|c| c.reader_done && c.writer_done)
            .unwrap_or(false);
        if !done {
            return false;
        }
        match self.conns.remove(&conn) {
            Some(entry) => {
                trace!(%conn, "connection reaped");
                !entry.closed_reported
            }
            None => false,
        }
    }

    fn force_close(&mut self, conn: ConnId) -> bool {
        match self.conns.remove(&conn) {
            Some(entry) => {
                entry.reader.abort();
                entry.writer.abort();
                debug!(%conn, "connection closed forcibly");
                !entry.closed_reported
            }
            None => false,
        }
    }
}

impl Net for LoopIo {
    fn send(&mut self, conn: ConnId, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let Some(entry) = self.live(conn) else {
            trace!(%conn, bytes = data.len(), "send to dead connection ignored");
            return;
        };

        let len = data.len();
        let queued = entry.queued.fetch_add(len, Ordering::SeqCst) + len;
        if entry.outbound.send(Outbound::Data(data)).is_err() {
            entry.queued.fetch_sub(len, Ordering::SeqCst);
            return;
        }
        if queued >= self.high_water_mark && !entry.over_mark.swap(true, Ordering::SeqCst) && !entry.retired {
            self.pending.push_back(Event::HighWater { conn, queued });
        }
    }

    fn pause_read(&mut self, conn: ConnId) {
        if let Some(entry) = self.live(conn) {
            entry.gate.send_if_modified(|gate| {
                if *gate == ReadGate::Open {
                    *gate = ReadGate::Paused;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn resume_read(&mut self, conn: ConnId) {
        if let Some(entry) = self.live(conn) {
            entry.gate.send_if_modified(|gate| {
                if *gate == ReadGate::Paused {
                    *gate = ReadGate::Open;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn shutdown(&mut self, conn: ConnId) {
        if let Some(connect) = self.connecting.remove(&conn) {
            connect.abort();
            debug!(%conn, "pending connect abandoned");
            return;
        }
        self.begin_close(conn);
    }

    fn retire(&mut self, conn: ConnId) {
        // Nothing can have been sent on a connection that is not up yet
        if let Some(connect) = self.connecting.remove(&conn) {
            connect.abort();
            debug!(%conn, "pending connect abandoned");
            return;
        }
        let Some(entry) = self.conns.get_mut(&conn) else {
            return;
        };
        if entry.closing || entry.retired {
            return;
        }
        entry.retired = true;
        entry.gate.send_replace(ReadGate::Draining);
        trace!(%conn, "connection retired");
    }

    fn connect(&mut self, addr: SocketAddr) -> ConnId {
        let conn = self.next_conn_id();
        let io_tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let result = TcpStream::connect(addr).await;
            let _ = io_tx.send(IoEvent::Connect { conn, result });
        });
        self.connecting.insert(conn, task);
        debug!(%conn, %addr, "connecting");
        conn
    }

    fn is_alive(&self, conn: ConnId) -> bool {
        self.connecting.contains_key(&conn) || self.live(conn).is_some()
    }

    fn queued(&self, conn: ConnId) -> usize {
        self.conns
            .get(&conn)
            .map(|c| c.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn arm_timer(&mut self, after: Duration) -> TimerId {
        let timer = TimerId(self.next_timer);
        self.next_timer += 1;
        if after > MAX_TIMER {
            warn!(?after, "timer clamped to {:?}", MAX_TIMER);
        }
        let key = self.timers.insert(Expiry::Timer(timer), after.min(MAX_TIMER));
        self.timer_keys.insert(timer, key);
        timer
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        if let Some(key) = self.timer_keys.remove(&timer) {
            self.timers.remove(&key);
        }
    }

    fn lookup(&mut self, host: &str, port: u16) -> LookupId {
        let lookup = LookupId(self.next_lookup);
        self.next_lookup += 1;

        let host = host.to_string();
        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let result = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = io_tx.send(IoEvent::Resolved { lookup, result });
        });
        lookup
    }
}

/// Event loop for one listening agent
pub struct Reactor<E> {
    listener: TcpListener,
    engine: E,
    deliveries: DeliveryReceiver,
    io: LoopIo,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    span: Span,
}

impl<E: Engine> Reactor<E> {
    pub fn new(listener: TcpListener, engine: E, deliveries: DeliveryReceiver) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            listener,
            engine,
            deliveries,
            io: LoopIo::new(io_tx),
            io_rx,
            span: Span::none(),
        }
    }

    /// Span entered around every engine call
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.io.high_water_mark = bytes;
        self
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run until the task is dropped
    pub async fn run(mut self) -> TransportResult<()> {
        info!("Listening on {}", self.local_addr()?);
        let mut deliveries_open = true;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = self.io.next_conn_id();
                        self.io.attach(conn, stream);
                        debug!(%conn, %peer, "accepted connection");
                        self.dispatch(Event::Accepted { conn, peer });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(io_event) = self.io_rx.recv() => self.on_io_event(io_event),
                delivery = self.deliveries.recv(), if deliveries_open => match delivery {
                    Some(delivery) => self.on_delivery(delivery),
                    None => {
                        warn!("Compression pool stopped delivering frames");
                        deliveries_open = false;
                    }
                },
                Some(expired) = self.io.timers.next(), if !self.io.timers.is_empty() => {
                    match expired.into_inner() {
                        Expiry::Timer(timer) => {
                            if self.io.timer_keys.remove(&timer).is_some() {
                                self.dispatch(Event::Timer(timer));
                            }
                        }
                        Expiry::Linger(conn) => {
                            if self.io.force_close(conn) {
                                self.dispatch(Event::Closed { conn });
                            }
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let _entered = self.span.enter();
        self.engine.on_event(event, &mut self.io);
        while let Some(event) = self.io.pending.pop_front() {
            self.engine.on_event(event, &mut self.io);
        }
    }

    fn on_io_event(&mut self, io_event: IoEvent) {
        match io_event {
            IoEvent::Connect { conn, result } => {
                if self.io.connecting.remove(&conn).is_none() {
                    // Abandoned while connecting; the stream is dropped here
                    return;
                }
                let stream = result.and_then(|stream| stream.local_addr().map(|local| (stream, local)));
                match stream {
                    Ok((stream, local_addr)) => {
                        self.io.attach(conn, stream);
                        self.dispatch(Event::Connected { conn, local_addr });
                    }
                    Err(error) => self.dispatch(Event::ConnectFailed { conn, error }),
                }
            }
            IoEvent::Data { conn, data } => {
                if self.io.watched(conn).is_some() {
                    self.dispatch(Event::Data { conn, data });
                }
            }
            IoEvent::Drained { conn } => {
                let report = self
                    .io
                    .watched(conn)
                    .map(|c| !c.over_mark.load(Ordering::SeqCst))
                    .unwrap_or(false);
                if report {
                    self.dispatch(Event::Drained { conn });
                }
            }
            IoEvent::ReadEnded { conn } => {
                let Some(entry) = self.io.conns.get_mut(&conn) else {
                    return;
                };
                entry.reader_done = true;
                if !entry.closing {
                    debug!(%conn, "peer closed connection");
                    entry.closed_reported = true;
                    self.io.begin_close(conn);
                    self.dispatch(Event::Closed { conn });
                }
                if self.io.reap(conn) {
                    self.dispatch(Event::Closed { conn });
                }
            }
            IoEvent::WriteEnded { conn, clean } => {
                let Some(entry) = self.io.conns.get_mut(&conn) else {
                    return;
                };
                entry.writer_done = true;
                if !clean {
                    if self.io.force_close(conn) {
                        self.dispatch(Event::Closed { conn });
                    }
                    return;
                }
                if self.io.reap(conn) {
                    self.dispatch(Event::Closed { conn });
                }
            }
            IoEvent::Resolved { lookup, result } => self.dispatch(Event::Resolved { lookup, result }),
        }
    }

    fn on_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Frame { dest, frame: Ok(frame) } => {
                if !self.io.is_alive(dest) {
                    trace!(%dest, bytes = frame.len(), "frame for dead connection discarded");
                    return;
                }
                self.io.send(dest, frame);
                if !self.io.pending.is_empty() {
                    let _entered = self.span.enter();
                    while let Some(event) = self.io.pending.pop_front() {
                        self.engine.on_event(event, &mut self.io);
                    }
                }
            }
            Delivery::Frame { dest, frame: Err(e) } => {
                error!(%dest, "Failed to encode message: {}", e);
                self.io.shutdown(dest);
            }
            Delivery::Close { dest } => self.io.shutdown(dest),
        }
    }
}

async fn read_loop(
    conn: ConnId,
    mut read_half: OwnedReadHalf,
    mut gate: watch::Receiver<ReadGate>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let state = match gate.wait_for(|g| *g != ReadGate::Paused).await {
            Ok(state) => *state,
            Err(_) => break,
        };

        if state == ReadGate::Draining {
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => trace!(%conn, "discarding {} bytes from closing connection", n),
                }
            }
            break;
        }

        tokio::select! {
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            result = read_half.read(&mut buffer) => match result {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buffer[..n]);
                    if io_tx.send(IoEvent::Data { conn, data }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(%conn, "read error: {}", e);
                    break;
                }
            }
        }
    }

    let _ = io_tx.send(IoEvent::ReadEnded { conn });
}

async fn write_loop(
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    queued: Arc<AtomicUsize>,
    over_mark: Arc<AtomicBool>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
) {
    let clean = loop {
        match outbound.recv().await {
            Some(Outbound::Data(data)) => {
                if let Err(e) = write_half.write_all(&data).await {
                    debug!(%conn, "write error: {}", e);
                    break false;
                }
                let left = queued.fetch_sub(data.len(), Ordering::SeqCst) - data.len();
                if left == 0 && over_mark.swap(false, Ordering::SeqCst) {
                    let _ = io_tx.send(IoEvent::Drained { conn });
                }
            }
            Some(Outbound::Shutdown) | None => {
                let _ = write_half.shutdown().await;
                break true;
            }
        }
    };

    let _ = io_tx.send(IoEvent::WriteEnded { conn, clean });
}
