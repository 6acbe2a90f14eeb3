//! In-process mock of the OPO controller's TCP line protocol.
//!
//! Behaves like the lab simulator: GOTO accepts 710-880 nm and rejects a move
//! while one is active, SETSPD accepts 0.5-5.0 nm/s, TELLWL answers with five
//! decimals, TELLSTAT answers `0x0` or `0x80085`. Moves take a fixed time and
//! land `bias` nm away from the commanded wavelength.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Controller simulation state.
#[derive(Debug)]
pub struct ControllerState {
    pub wavelength: f64,
    pub speed: f64,
    pub moving: bool,
    pub bias: f64,
    pub move_time: Duration,
    pub received: Vec<String>,
}

/// Handle to a running mock controller.
pub struct MockController {
    pub addr: SocketAddr,
    state: Arc<Mutex<ControllerState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    kill_clients: Arc<Mutex<CancellationToken>>,
    shutdown: CancellationToken,
}

impl MockController {
    /// Start listening on an ephemeral localhost port.
    pub async fn start(move_time: Duration, bias: f64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ControllerState {
            wavelength: 750.0,
            speed: 1.0,
            moving: false,
            bias,
            move_time,
            received: Vec::new(),
        }));
        let outbound = Arc::new(Mutex::new(None));
        let kill_clients = Arc::new(Mutex::new(CancellationToken::new()));
        let shutdown = CancellationToken::new();

        let accept = {
            let state = state.clone();
            let outbound = outbound.clone();
            let kill_clients = kill_clients.clone();
            let shutdown = shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, _)) = accepted else { break };
                            let (tx, rx) = mpsc::unbounded_channel();
                            *outbound.lock().unwrap() = Some(tx);
                            let kill = kill_clients.lock().unwrap().clone();
                            tokio::spawn(serve(
                                stream,
                                state.clone(),
                                rx,
                                kill,
                                shutdown.clone(),
                            ));
                        }
                    }
                }
            }
        };
        tokio::spawn(accept);

        Self {
            addr,
            state,
            outbound,
            kill_clients,
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received so far.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn wavelength(&self) -> f64 {
        self.state.lock().unwrap().wavelength
    }

    /// Force the motor flag, e.g. to simulate a motor that never stops.
    pub fn set_moving(&self, moving: bool) {
        self.state.lock().unwrap().moving = moving;
    }

    /// Send an unsolicited line to the connected client.
    pub fn push_line(&self, line: &str) {
        if let Some(tx) = self.outbound.lock().unwrap().as_ref() {
            let _ = tx.send(line.to_string());
        }
    }

    /// Drop every open client connection; the listener keeps accepting.
    pub fn drop_clients(&self) {
        let mut kill = self.kill_clients.lock().unwrap();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// Whether a CLOSE command shut the listener down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<Mutex<ControllerState>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    kill: CancellationToken,
    shutdown: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let reply = tokio::select! {
            _ = kill.cancelled() => return,
            Some(line) = outbound.recv() => Some(line),
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(line.trim(), &state, &shutdown),
                _ => return,
            },
        };
        if let Some(reply) = reply {
            if write
                .write_all(format!("{}\r\n", reply).as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

fn handle_command(
    line: &str,
    state: &Arc<Mutex<ControllerState>>,
    shutdown: &CancellationToken,
) -> Option<String> {
    state.lock().unwrap().received.push(line.to_string());

    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() > 2 {
        return Some("1".to_string());
    }
    let value = parts.get(1).and_then(|v| v.parse::<f64>().ok());

    let reply = match parts[0] {
        "GOTO" => {
            let Some(target) = value else {
                return Some("1".to_string());
            };
            let mut s = state.lock().unwrap();
            if !(710.0..=880.0).contains(&target) {
                "3".to_string()
            } else if s.moving {
                "5".to_string()
            } else {
                s.moving = true;
                let landing = target + s.bias;
                let delay = s.move_time;
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut s = state.lock().unwrap();
                    s.moving = false;
                    s.wavelength = landing;
                });
                "0".to_string()
            }
        }
        "SETSPD" => match value {
            None => "1".to_string(),
            Some(speed) if !(0.5..=5.0).contains(&speed) => "4".to_string(),
            Some(speed) => {
                state.lock().unwrap().speed = speed;
                "0".to_string()
            }
        },
        "TELLWL" => format!("{:.5}", state.lock().unwrap().wavelength),
        "TELLSTAT" => {
            if state.lock().unwrap().moving {
                "0x80085".to_string()
            } else {
                "0x0".to_string()
            }
        }
        "CLOSE" => {
            shutdown.cancel();
            return None;
        }
        _ => "1".to_string(),
    };
    Some(reply)
}
