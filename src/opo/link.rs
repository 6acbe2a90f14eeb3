//! Persistent TCP link to the OPO controller.
//!
//! `OpoLink` owns one connection. Outbound commands are fire-and-forget: the
//! controller's reply arrives asynchronously, is decoded by a background reader
//! task, and updates the link state before being published on a broadcast
//! event stream. Awaitable helpers ([`OpoLink::wait_for_motor_stop`],
//! [`OpoLink::read_wavelength`]) are built on top of that stream.
//!
//! # Usage
//!
//! ```rust,ignore
//! let link = OpoLink::new(LinkOptions::default());
//! link.connect().await?;
//! let cancel = CancellationToken::new();
//! link.move_and_settle(750.0, &cancel).await?;
//! println!("{:?}", link.last_wavelength());
//! ```

use super::protocol::{
    classify_line, ConnectionState, ErrorCode, Inbound, LineBuffer, MotorStatus, OpoCommand,
};
use super::TunableOpo;
use crate::conversion::validate_near_ir;
use crate::error::{AppResult, OpoError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Runtime options for [`OpoLink`].
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Controller host
    pub host: String,
    /// Controller TCP port
    pub port: u16,
    /// Bound on socket connect
    pub connect_timeout: Duration,
    /// Bound on a single query/response exchange
    pub response_timeout: Duration,
    /// Fixed delay between TELLSTAT polls while waiting for a move
    pub motor_poll_interval: Duration,
    /// Bound on waiting for the motor to report idle
    pub motor_stop_timeout: Duration,
    /// Broadcast channel depth
    pub event_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: super::protocol::DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(2),
            motor_poll_interval: Duration::from_millis(500),
            motor_stop_timeout: Duration::from_secs(120),
            event_capacity: 256,
        }
    }
}

/// Events published by the link's reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum OpoEvent {
    /// Controller reported a wavelength (nm)
    WavelengthUpdated(f64),
    /// Controller reported the all-zero status word
    MotorStopped,
    /// Controller replied with a code (0 = success)
    ErrorReceived(ErrorCode),
    /// Socket closed or failed
    Disconnected,
}

/// Byte stream the link can run over (TCP socket, or an in-memory pipe in tests).
pub trait LinkIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIo for T {}
type DynStream = Box<dyn LinkIo>;

struct Connection {
    writer: WriteHalf<DynStream>,
    reader: JoinHandle<()>,
}

/// State shared with the reader task.
struct Shared {
    connection: watch::Sender<ConnectionState>,
    motor: watch::Sender<MotorStatus>,
    wavelength: watch::Sender<Option<f64>>,
    events: broadcast::Sender<OpoEvent>,
}

impl Shared {
    fn handle_line(&self, line: &str) {
        match classify_line(line) {
            Inbound::Status(MotorStatus::Idle) => {
                self.motor.send_replace(MotorStatus::Idle);
                debug!("OPO motor idle");
                let _ = self.events.send(OpoEvent::MotorStopped);
            }
            Inbound::Status(MotorStatus::Moving) => {
                self.motor.send_replace(MotorStatus::Moving);
            }
            Inbound::Message(message) => {
                info!(%message, "OPO controller message");
            }
            Inbound::Code(code) => {
                if code.is_fault() {
                    warn!(kind = "protocol", code = code.code(), "OPO controller error: {}", code);
                } else {
                    debug!("OPO command acknowledged");
                }
                let _ = self.events.send(OpoEvent::ErrorReceived(code));
            }
            Inbound::Wavelength(nm) => {
                self.wavelength.send_replace(Some(nm));
                debug!(wavelength_nm = nm, "OPO wavelength update");
                let _ = self.events.send(OpoEvent::WavelengthUpdated(nm));
            }
        }
    }

    fn mark_disconnected(&self) {
        let previous = self.connection.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            warn!(kind = "connection", "OPO link disconnected");
            let _ = self.events.send(OpoEvent::Disconnected);
        }
    }
}

async fn read_loop(mut reader: ReadHalf<DynStream>, shared: Arc<Shared>) {
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("OPO controller closed the connection");
                break;
            }
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    shared.handle_line(&line);
                }
            }
            Err(e) => {
                error!(kind = "connection", error = %e, "OPO read failed");
                break;
            }
        }
    }
    shared.mark_disconnected();
}

/// Client side of the OPO line protocol.
pub struct OpoLink {
    options: LinkOptions,
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
    session: Arc<Mutex<()>>,
}

impl OpoLink {
    /// Create a disconnected link.
    pub fn new(options: LinkOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let shared = Shared {
            connection: watch::channel(ConnectionState::Disconnected).0,
            motor: watch::channel(MotorStatus::Idle).0,
            wavelength: watch::channel(None).0,
            events,
        };
        Self {
            options,
            shared: Arc::new(shared),
            connection: Mutex::new(None),
            session: Arc::new(Mutex::new(())),
        }
    }

    /// Link options.
    pub fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Open the TCP connection. Also used to reconnect after a disconnect.
    #[instrument(skip(self), fields(host = %self.options.host, port = self.options.port), err)]
    pub async fn connect(&self) -> AppResult<()> {
        let addr = format!("{}:{}", self.options.host, self.options.port);
        self.shared
            .connection
            .send_replace(ConnectionState::Connecting);

        let stream = match timeout(self.options.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.mark_disconnected();
                return Err(OpoError::Connection(format!(
                    "failed to connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                self.shared.mark_disconnected();
                return Err(OpoError::Connection(format!(
                    "connection to {} timed out after {:?}",
                    addr, self.options.connect_timeout
                )));
            }
        };
        stream.set_nodelay(true)?;

        self.attach(stream).await;
        info!("Connected to OPO controller at {}", addr);
        Ok(())
    }

    /// Run the link over an already-open byte stream.
    pub async fn attach<S: LinkIo + 'static>(&self, stream: S) {
        let (reader, writer) = tokio::io::split(Box::new(stream) as DynStream);
        let reader = tokio::spawn(read_loop(reader, self.shared.clone()));

        let mut guard = self.connection.lock().await;
        if let Some(old) = guard.replace(Connection { writer, reader }) {
            old.reader.abort();
        }
        self.shared.motor.send_replace(MotorStatus::Idle);
        self.shared.connection.send_replace(ConnectionState::Connected);
    }

    /// Close the socket. Emits `Disconnected` if the link was connected.
    pub async fn disconnect(&self) {
        if let Some(mut conn) = self.connection.lock().await.take() {
            let _ = conn.writer.shutdown().await;
            conn.reader.abort();
        }
        self.shared.mark_disconnected();
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    /// Current motor status.
    pub fn motor_status(&self) -> MotorStatus {
        *self.shared.motor.borrow()
    }

    /// Last wavelength reported by the controller.
    pub fn last_wavelength(&self) -> Option<f64> {
        *self.shared.wavelength.borrow()
    }

    /// Subscribe to inbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<OpoEvent> {
        self.shared.events.subscribe()
    }

    /// Watch the last-known wavelength.
    pub fn wavelength_watch(&self) -> watch::Receiver<Option<f64>> {
        self.shared.wavelength.subscribe()
    }

    /// Acquire the per-connection session guard.
    ///
    /// Hold it for the whole of a multi-command request so that concurrent
    /// requests cannot interleave commands and responses.
    pub async fn lock_session(&self) -> OwnedMutexGuard<()> {
        self.session.clone().lock_owned().await
    }

    async fn send(&self, command: OpoCommand) -> AppResult<()> {
        let mut guard = self.connection.lock().await;
        let conn = match guard.as_mut() {
            Some(conn) if self.connection_state() == ConnectionState::Connected => conn,
            _ => {
                return Err(OpoError::Connection(
                    "OPO link is not connected".to_string(),
                ))
            }
        };

        debug!("OPO write: {}", command);
        let line = command.to_line();
        let mut result = conn.writer.write_all(line.as_bytes()).await;
        if result.is_ok() {
            result = conn.writer.flush().await;
        }

        if let Err(e) = result {
            error!(kind = "connection", error = %e, "OPO write failed");
            self.shared.mark_disconnected();
            return Err(OpoError::Connection(format!(
                "failed to send '{}': {}",
                command, e
            )));
        }
        Ok(())
    }

    /// Command a move to `wavelength_nm`.
    ///
    /// Rejected locally, without network I/O, if the wavelength is outside the
    /// 710-880 nm motor range or a move is already in flight.
    #[instrument(skip(self), err)]
    pub async fn move_to(&self, wavelength_nm: f64) -> AppResult<()> {
        validate_near_ir(wavelength_nm)?;
        if self.motor_status() == MotorStatus::Moving {
            return Err(OpoError::Busy(format!(
                "cannot move to {} nm while a move is in flight",
                wavelength_nm
            )));
        }

        self.shared.motor.send_replace(MotorStatus::Moving);
        if let Err(e) = self.send(OpoCommand::Goto(wavelength_nm)).await {
            self.shared.motor.send_replace(MotorStatus::Idle);
            return Err(e);
        }
        info!(wavelength_nm, "OPO move issued");
        Ok(())
    }

    /// Set motor speed (nm/s). Range checking is the controller's business.
    #[instrument(skip(self), err)]
    pub async fn set_speed(&self, nm_per_sec: f64) -> AppResult<()> {
        if !nm_per_sec.is_finite() {
            return Err(OpoError::Validation(format!(
                "speed {} is not a number",
                nm_per_sec
            )));
        }
        self.send(OpoCommand::SetSpeed(nm_per_sec)).await
    }

    /// Set motor speed and await the controller's reply code.
    ///
    /// Consuming the reply here keeps a late rejection from being mistaken for
    /// the outcome of a following move.
    #[instrument(skip(self), err)]
    pub async fn apply_speed(&self, nm_per_sec: f64) -> AppResult<()> {
        let mut events = self.subscribe();
        self.set_speed(nm_per_sec).await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(OpoEvent::ErrorReceived(code)) if code.is_fault() => {
                        return Err(OpoError::Protocol { code })
                    }
                    Ok(OpoEvent::ErrorReceived(_)) => return Ok(()),
                    Ok(OpoEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(OpoError::Connection(
                            "link closed while waiting for speed reply".to_string(),
                        ))
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };
        timeout(self.options.response_timeout, wait)
            .await
            .map_err(|_| OpoError::Timeout(self.options.response_timeout, "speed reply"))?
    }

    /// Ask for the current wavelength; the reply arrives as `WavelengthUpdated`.
    pub async fn query_wavelength(&self) -> AppResult<()> {
        self.send(OpoCommand::TellWavelength).await
    }

    /// Ask for the motor status; the reply updates [`Self::motor_status`].
    pub async fn query_motor_status(&self) -> AppResult<()> {
        self.send(OpoCommand::TellStatus).await
    }

    /// Ask the controller to shut its listener down.
    pub async fn close_server(&self) -> AppResult<()> {
        self.send(OpoCommand::Close).await
    }

    /// Query and await the current wavelength.
    pub async fn read_wavelength(&self) -> AppResult<f64> {
        let mut events = self.subscribe();
        self.query_wavelength().await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(OpoEvent::WavelengthUpdated(nm)) => return Ok(nm),
                    Ok(OpoEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(OpoError::Connection(
                            "link closed while waiting for wavelength".to_string(),
                        ))
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };
        timeout(self.options.response_timeout, wait)
            .await
            .map_err(|_| OpoError::Timeout(self.options.response_timeout, "wavelength reply"))?
    }

    /// Query and await the motor status.
    pub async fn read_motor_status(&self) -> AppResult<MotorStatus> {
        let mut status = self.shared.motor.subscribe();
        let _ = status.borrow_and_update();
        self.query_motor_status().await?;

        timeout(self.options.response_timeout, status.changed())
            .await
            .map_err(|_| OpoError::Timeout(self.options.response_timeout, "status reply"))?
            .map_err(|_| OpoError::Connection("link dropped".to_string()))?;
        let current = *status.borrow();
        Ok(current)
    }

    /// Issue a move and wait until the controller reports the motor idle.
    ///
    /// On success the last-known wavelength has been refreshed from the
    /// controller, unless the reply did not arrive within `response_timeout`.
    pub async fn move_and_settle(
        &self,
        wavelength_nm: f64,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        // Subscribe before the move so the GOTO reply cannot be missed
        let mut events = self.subscribe();
        self.move_to(wavelength_nm).await?;
        self.settle(&mut events, cancel).await
    }

    /// Poll TELLSTAT at a fixed interval until the motor reports idle.
    pub async fn wait_for_motor_stop(&self, cancel: &CancellationToken) -> AppResult<()> {
        let mut events = self.subscribe();
        self.settle(&mut events, cancel).await
    }

    async fn settle(
        &self,
        events: &mut broadcast::Receiver<OpoEvent>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let deadline = Instant::now() + self.options.motor_stop_timeout;
        let mut ticker = tokio::time::interval(self.options.motor_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Set once the motor is idle and TELLWL has been sent
        let mut refresh: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("motor stop wait cancelled");
                    return Err(OpoError::Cancelled("motor stop wait"));
                }
                _ = tokio::time::sleep_until(deadline), if refresh.is_none() => {
                    error!(kind = "timeout", "OPO motor never reported idle");
                    return Err(OpoError::Timeout(self.options.motor_stop_timeout, "motor stop"));
                }
                _ = tokio::time::sleep_until(refresh.unwrap_or(deadline)), if refresh.is_some() => {
                    warn!("no wavelength reply after motor stop");
                    return Ok(());
                }
                _ = ticker.tick(), if refresh.is_none() => {
                    self.query_motor_status().await?;
                }
                event = events.recv() => match event {
                    Ok(OpoEvent::MotorStopped) if refresh.is_none() => {
                        self.query_wavelength().await?;
                        refresh = Some(Instant::now() + self.options.response_timeout);
                    }
                    Ok(OpoEvent::WavelengthUpdated(nm)) if refresh.is_some() => {
                        debug!(wavelength_nm = nm, "OPO settled");
                        return Ok(());
                    }
                    Ok(OpoEvent::ErrorReceived(code)) if code.is_fault() => {
                        // A rejected GOTO leaves the local status stale; resync it
                        if let Err(e) = self.read_motor_status().await {
                            warn!(error = %e, "motor status resync failed");
                        }
                        return Err(OpoError::Protocol { code });
                    }
                    Ok(OpoEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(OpoError::Connection(
                            "link closed while waiting for motor stop".to_string(),
                        ));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "OPO event stream lagged");
                    }
                    Ok(_) => {}
                },
            }
        }
    }
}

#[async_trait]
impl TunableOpo for OpoLink {
    async fn lock_session(&self) -> OwnedMutexGuard<()> {
        OpoLink::lock_session(self).await
    }

    async fn move_and_settle(
        &self,
        wavelength_nm: f64,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        OpoLink::move_and_settle(self, wavelength_nm, cancel).await
    }
}
