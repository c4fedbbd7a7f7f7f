//! Optional TCP diagnostic interface.
//!
//! A single-client TCP listener that streams line-oriented records of
//! discipline events and applied slew changes, for protocol bring-up and
//! tuning.  The client may send `r` or `R` to reset the record IDs.  Not
//! required for correct operation; the daemon enables it on request.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::{Result, TimeServiceError};

/// Default diagnostic listen port.
pub const DEFAULT_DIAG_PORT: u16 = 9876;

// Bounded queue between the recovery loop and the diag thread; events are
// dropped rather than ever blocking the discipline path.
const EVENT_QUEUE_DEPTH: usize = 64;

/// A record streamed to the diagnostic client.
#[derive(Debug, Clone, Copy)]
pub enum DiagEvent {
    /// One processed discipline data point.
    Discipline {
        local_time: i64,
        observed_common_time: i64,
        nominal_common_time: i64,
        correction: i32,
        rtt: i64,
    },
    /// A slew-control value handed to the local clock.
    SlewApplied { local_time: i64, correction: i32 },
}

/// Producer handle given to the recovery loop.
#[derive(Clone)]
pub struct DiagSink {
    tx: SyncSender<DiagEvent>,
}

impl DiagSink {
    /// Queue an event for the diagnostic client, dropping it when the
    /// queue is full or the server is gone.
    pub fn push(&self, event: DiagEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// The diagnostic TCP server thread.
pub struct DiagServer {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    port: u16,
}

impl DiagServer {
    /// Bind the listen socket and start the worker thread.  Returns the
    /// server handle and the sink to attach to the recovery loop.
    pub fn spawn(port: u16) -> Result<(DiagServer, DiagSink)> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(TimeServiceError::SocketSetup)?;
        listener
            .set_nonblocking(true)
            .map_err(TimeServiceError::SocketSetup)?;
        let port = listener
            .local_addr()
            .map_err(TimeServiceError::SocketSetup)?
            .port();

        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let worker = thread::Builder::new()
            .name("common-time-diag".to_string())
            .spawn(move || run_diag(listener, rx, thread_shutdown))
            .map_err(TimeServiceError::Io)?;

        info!("diagnostic interface listening on port {port}");
        Ok((
            DiagServer {
                shutdown,
                worker: Some(worker),
                port,
            },
            DiagSink { tx },
        ))
    }

    /// The bound listen port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for DiagServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_diag(listener: TcpListener, rx: Receiver<DiagEvent>, shutdown: Arc<AtomicBool>) {
    let mut client: Option<TcpStream> = None;
    let mut discipline_id: u64 = 0;
    let mut slew_id: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        if client.is_none() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let _ = stream.set_nonblocking(true);
                    info!("diagnostic client connected from {peer}");
                    client = Some(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => warn!("diagnostic accept failed: {e}"),
            }
        }

        // The receive timeout doubles as the poll interval for new
        // connections and client commands.
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                emit(&mut client, event, &mut discipline_id, &mut slew_id);
                while let Ok(event) = rx.try_recv() {
                    emit(&mut client, event, &mut discipline_id, &mut slew_id);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(stream) = client.as_mut() {
            let mut byte = [0u8; 1];
            match stream.read(&mut byte) {
                Ok(0) => client = None,
                Ok(_) => {
                    if byte[0] == b'r' || byte[0] == b'R' {
                        discipline_id = 0;
                        slew_id = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => client = None,
            }
        }
    }
}

fn emit(client: &mut Option<TcpStream>, event: DiagEvent, discipline_id: &mut u64, slew_id: &mut u64) {
    let Some(stream) = client.as_mut() else {
        return;
    };

    let line = match event {
        DiagEvent::Discipline {
            local_time,
            observed_common_time,
            nominal_common_time,
            correction,
            rtt,
        } => {
            *discipline_id += 1;
            format!(
                "disc {discipline_id} {local_time} {observed_common_time} \
                 {nominal_common_time} {correction} {rtt}\n"
            )
        }
        DiagEvent::SlewApplied {
            local_time,
            correction,
        } => {
            *slew_id += 1;
            format!("slew {slew_id} {local_time} {correction}\n")
        }
    };

    if stream.write_all(line.as_bytes()).is_err() {
        *client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::io::BufReader;

    #[test]
    fn sink_drops_events_without_server() {
        let (tx, rx) = mpsc::sync_channel(1);
        let sink = DiagSink { tx };
        drop(rx);
        // Must not panic or block.
        sink.push(DiagEvent::SlewApplied {
            local_time: 0,
            correction: 0,
        });
    }

    #[test]
    fn streams_records_to_a_client() {
        let (server, sink) = DiagServer::spawn(0).unwrap();

        let stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Give the worker a moment to accept, then push an event.
        thread::sleep(Duration::from_millis(300));
        sink.push(DiagEvent::Discipline {
            local_time: 10,
            observed_common_time: 20,
            nominal_common_time: 30,
            correction: 5,
            rtt: 7,
        });

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), "disc 1 10 20 30 5 7");

        drop(server);
    }
}
