// TCP server and main event loop for the dedicated lockstep relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per client): call `recv_json()` in a loop and
//   send `InternalEvent::MessageFrom` to the main thread. On error/EOF,
//   send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `ServerSession`, receives events from the
//   channel, and dispatches them. `recv_timeout` doubles as the match
//   clock tick: after every wake-up the elapsed wall time is fed to
//   `ServerSession::update`, which finalizes due turns.
//
// The main thread is the only writer to client TCP streams (via
// `TcpServerTransport`). Reader threads only read from streams.
//
// Session events are forwarded to the `RelayHandle`, so an embedding host
// (or the binary) can watch for the end of the match.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`; the main thread
// aborts a match still in progress, closes every stream, and exits.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use lockstep_protocol::framing::{recv_json, send_json};
use lockstep_protocol::message::{ClientMessage, ServerMessage};
use lockstep_protocol::types::ConnectionId;
use log::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::config::RelayConfig;
use crate::error::{LockstepError, Result};
use crate::session::{MatchPhase, ServerEvent, ServerSession};
use crate::transport::{ClientEndpoint, ServerTransport};

/// Upper bound on how long the main loop sleeps between clock updates.
const MAX_TICK: Duration = Duration::from_millis(10);

/// Events sent from listener/reader threads (and the handle) to the main
/// thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
    Abort {
        reason: String,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    control: Sender<InternalEvent>,
    events: Receiver<ServerEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Drain session events forwarded by the main loop (non-blocking).
    pub fn poll_events(&self) -> Vec<ServerEvent> {
        self.events.try_iter().collect()
    }

    /// Abort the running match; every ready client receives `ClientEnd`.
    pub fn abort(&self, reason: &str) {
        let _ = self.control.send(InternalEvent::Abort {
            reason: reason.to_owned(),
        });
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Writes framed JSON to each connected client.
struct TcpServerTransport {
    writers: HashMap<ConnectionId, BufWriter<TcpStream>>,
    clock: MonotonicClock,
}

impl TcpServerTransport {
    fn new() -> Self {
        Self {
            writers: HashMap::new(),
            clock: MonotonicClock::new(),
        }
    }

    fn add(&mut self, conn: ConnectionId, stream: TcpStream) {
        self.writers.insert(conn, BufWriter::new(stream));
    }

    fn remove(&mut self, conn: ConnectionId) {
        if let Some(writer) = self.writers.remove(&conn) {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
    }

    /// Close every stream, unblocking the reader threads.
    fn shutdown_all(&mut self) {
        for (_, writer) in self.writers.drain() {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

impl ServerTransport for TcpServerTransport {
    fn send(&mut self, to: ConnectionId, message: &ServerMessage) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&to)
            .ok_or_else(|| LockstepError::Transport(format!("{to} is not connected")))?;
        send_json(writer, message)?;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr)> {
    let session = ServerSession::new(config.server, TcpServerTransport::new())?;
    let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();

    let keep_running_clone = keep_running.clone();
    let tx_clone = tx.clone();
    let thread = thread::spawn(move || {
        run_relay(listener, session, tx_clone, rx, event_tx, keep_running_clone);
    });
    info!("relay listening on {addr}");

    Ok((
        RelayHandle {
            keep_running,
            control: tx,
            events: event_rx,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(
    listener: TcpListener,
    mut session: ServerSession<TcpServerTransport>,
    tx: Sender<InternalEvent>,
    rx: Receiver<InternalEvent>,
    events: Sender<ServerEvent>,
    keep_running: Arc<AtomicBool>,
) {
    // Non-blocking so the accept thread can check keep_running periodically.
    listener.set_nonblocking(true).ok();

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    });

    let turn_duration = Duration::from_millis(session.config().lockstep.turn_duration_ms());
    let tick = turn_duration.min(MAX_TICK);
    let mut next_connection = 0u32;
    let mut last_update = Instant::now();

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(tick) {
            Ok(event) => {
                handle_event(&mut session, event, &tx, &keep_running, &mut next_connection);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut session, event, &tx, &keep_running, &mut next_connection);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        // Whole milliseconds only; the remainder carries into the next tick.
        let elapsed_ms = last_update.elapsed().as_millis() as u64;
        if elapsed_ms > 0 {
            last_update += Duration::from_millis(elapsed_ms);
            session.update(elapsed_ms);
        }
        forward_events(&mut session, &events);
    }

    if session.phase() != MatchPhase::Finished {
        session.fail("relay shutting down");
        forward_events(&mut session, &events);
    }
    session.transport_mut().shutdown_all();
    info!("relay stopped");
}

fn forward_events(session: &mut ServerSession<TcpServerTransport>, events: &Sender<ServerEvent>) {
    for event in session.poll_events() {
        if let ServerEvent::Error(e) = &event {
            warn!("session error: {e}");
        }
        let _ = events.send(event);
    }
}

/// Dispatch a single event to the session.
fn handle_event(
    session: &mut ServerSession<TcpServerTransport>,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
    next_connection: &mut u32,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            let conn = ConnectionId(*next_connection);
            *next_connection += 1;
            handle_new_connection(session, conn, stream, tx, keep_running);
        }
        InternalEvent::MessageFrom { conn, message } => {
            session.on_message(ClientEndpoint::Remote(conn), message);
        }
        InternalEvent::Disconnected { conn } => {
            session.transport_mut().remove(conn);
            session.on_disconnected(ClientEndpoint::Remote(conn));
        }
        InternalEvent::Abort { reason } => session.fail(&reason),
    }
}

/// Register the write half with the transport, spawn a reader thread, and
/// hand the connection to the session (which sends `ClientSetup`).
fn handle_new_connection(
    session: &mut ServerSession<TcpServerTransport>,
    conn: ConnectionId,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    stream.set_nodelay(true).ok();
    let reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            warn!("could not clone stream for {conn}: {e}");
            return;
        }
    };
    session.transport_mut().add(conn, stream);

    let tx_reader = tx.clone();
    let keep_running_reader = keep_running.clone();
    thread::spawn(move || {
        reader_loop(reader, conn, tx_reader, keep_running_reader);
    });

    session.on_connected(ClientEndpoint::Remote(conn));
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    conn: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match recv_json::<_, ClientMessage>(&mut reader) {
            Ok(message) => {
                if tx.send(InternalEvent::MessageFrom { conn, message }).is_err() {
                    return;
                }
            }
            Err(e) => {
                // EOF, broken pipe, or malformed frame: drop the connection.
                debug!("{conn} closed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(InternalEvent::Disconnected { conn });
}
