// TCP client transport for connecting to the lockstep relay.
//
// Provides a non-blocking interface for the game's main thread:
// - `connect()` performs the TCP connect on the calling thread, then spawns
//   a background reader thread.
// - The reader thread calls `recv_json()` in a loop and pushes each
//   `ServerMessage` into an `mpsc` channel, followed by one
//   `NetEvent::Disconnected` when the stream ends.
// - The main thread holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox non-blocking.
//
// `NetClient` implements `ClientTransport`, so it plugs straight into a
// `ClientSession`; `ClientSession::<NetClient>::pump_network()` feeds the
// drained inbox into the session.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use lockstep_protocol::framing::{recv_json, send_json};
use lockstep_protocol::message::{ClientMessage, ServerMessage};
use lockstep_protocol::types::PlayerId;
use log::debug;

use crate::client_session::ClientSession;
use crate::clock::MonotonicClock;
use crate::error::Result;
use crate::transport::ClientTransport;

/// What the reader thread saw.
#[derive(Debug)]
pub enum NetEvent {
    Message(ServerMessage),
    Disconnected,
}

/// TCP client for relay communication.
pub struct NetClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<NetEvent>,
    clock: MonotonicClock,
    _reader_thread: Option<JoinHandle<()>>,
}

impl NetClient {
    /// Connect to a relay server and spawn a reader thread.
    pub fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_clock(addr, MonotonicClock::new())
    }

    fn connect_with_clock(addr: &str, clock: MonotonicClock) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::new(stream.try_clone()?);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, tx);
        });
        debug!("connected to {addr}");

        Ok(Self {
            writer: BufWriter::new(stream),
            inbox: rx,
            clock,
            _reader_thread: Some(reader_thread),
        })
    }

    /// Replace the connection with a fresh one to `addr`. The local clock
    /// keeps running across reconnects.
    pub fn reconnect(&mut self, addr: &str) -> Result<()> {
        self.close();
        *self = Self::connect_with_clock(addr, self.clock)?;
        Ok(())
    }

    /// Close the connection. The reader thread reports `Disconnected`.
    pub fn close(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }

    /// Drain everything the reader thread has received (non-blocking).
    pub fn poll(&self) -> Vec<NetEvent> {
        self.inbox.try_iter().collect()
    }
}

impl ClientTransport for NetClient {
    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        send_json(&mut self.writer, message)?;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<NetEvent>) {
    loop {
        match recv_json::<_, ServerMessage>(&mut reader) {
            Ok(message) => {
                if tx.send(NetEvent::Message(message)).is_err() {
                    return; // Main thread dropped the receiver
                }
            }
            Err(e) => {
                debug!("relay connection closed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(NetEvent::Disconnected);
}

/// Connect to `addr` and wrap the connection in a `ClientSession`.
pub fn connect_session(addr: &str, player_id: PlayerId) -> Result<ClientSession<NetClient>> {
    let mut session = ClientSession::new(player_id, NetClient::connect(addr)?);
    session.on_connected();
    Ok(session)
}

impl ClientSession<NetClient> {
    /// Feed everything received since the last call into the session.
    /// Returns `false` once the connection is gone.
    pub fn pump_network(&mut self) -> bool {
        let mut connected = true;
        for event in self.transport().poll() {
            match event {
                NetEvent::Message(message) => self.on_message(message),
                NetEvent::Disconnected => {
                    self.on_disconnected();
                    connected = false;
                }
            }
        }
        connected
    }

    /// Reconnect to `addr`. The session rejoins automatically once the new
    /// `ClientSetup` arrives.
    pub fn reconnect(&mut self, addr: &str) -> Result<()> {
        self.on_disconnected();
        self.transport_mut().reconnect(addr)?;
        self.on_connected();
        Ok(())
    }
}
