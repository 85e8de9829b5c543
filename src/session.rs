use futures::StreamExt;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::{BleManager, Bm2Connection, NotificationStream, Transport},
    cipher::FrameCipher,
    command::Command,
    error::{Bm2Error, Result},
    protocol::{decode_frame, unix_time_ms, Message},
    types::{ConnectionParams, ConnectionState, DeviceInfo, DeviceTarget, SessionState},
};

/// Connection session with a BM2 battery monitor
///
/// A session owns one link at a time. Incoming notifications are handed to a
/// dedicated task which decrypts and parses them strictly in arrival order,
/// so the voltage timers a crank test depends on are always those of the
/// preceding voltage status. Every parsed [`Message`] is delivered on the
/// receiver returned by [`Bm2Session::new`].
///
/// # Examples
///
/// ```no_run
/// use bm2_ble::{Bm2Session, Command, ConnectionParams, DeviceTarget};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (session, mut messages) = Bm2Session::new(ConnectionParams::default());
///     session.connect(&DeviceTarget::Name("BM2".to_string())).await?;
///
///     session.send(&Command::SetTestMode { test: 2, option: 0 }).await?;
///
///     if let Some(message) = messages.recv().await {
///         println!("{message:?}");
///     }
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Bm2Session {
    params: ConnectionParams,
    cipher: FrameCipher,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
    link_open: RwLock<Arc<AtomicBool>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    write_lock: Mutex<()>,
    device_info: RwLock<Option<DeviceInfo>>,
    messages: mpsc::UnboundedSender<Message>,
}

impl Bm2Session {
    /// Create a disconnected session and the receiver its messages arrive on
    #[must_use]
    pub fn new(params: ConnectionParams) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (messages, receiver) = mpsc::unbounded_channel();

        let session = Self {
            params,
            cipher: FrameCipher::default(),
            state: RwLock::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            link_open: RwLock::new(Arc::new(AtomicBool::new(false))),
            transport: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            device_info: RwLock::new(None),
            messages,
        };

        (session, receiver)
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether notifications are flowing
    ///
    /// Turns false as soon as the device drops the notification stream, even
    /// though [`Bm2Session::state`] stays `Subscribed` until [`Bm2Session::disconnect`].
    pub async fn is_subscribed(&self) -> bool {
        self.state().await == ConnectionState::Subscribed
            && self.link_open.read().await.load(Ordering::SeqCst)
    }

    /// Device of the current connection, if it was located by scanning
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.read().await.clone()
    }

    /// Get connection parameters
    #[must_use]
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Locate the monitor over BLE, connect and subscribe to notifications
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::InvalidState`] if the session is not disconnected,
    /// [`Bm2Error::DeviceNotFound`] if the device cannot be found,
    /// [`Bm2Error::ConnectTimeout`] if connecting times out,
    /// or any other transport error. The session stays disconnected on error.
    pub async fn connect(&self, target: &DeviceTarget) -> Result<()> {
        let generation = self.begin_connect().await?;

        let connection = match self.open_link(target).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to connect to {target}: {e}");
                self.abandon_connect(generation).await;
                return Err(e);
            }
        };

        let info = connection.info().clone();
        self.attach(Arc::new(connection), Some(info), generation).await
    }

    async fn open_link(&self, target: &DeviceTarget) -> Result<Bm2Connection> {
        let manager = BleManager::new().await?;
        manager.connect(target, &self.params).await
    }

    /// Subscribe over an already connected transport
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::InvalidState`] if the session is not disconnected,
    /// or the transport's error if subscribing fails.
    pub async fn connect_with_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let generation = self.begin_connect().await?;
        self.attach(transport, None, generation).await
    }

    /// Move to `Connecting` and return the attempt's generation
    async fn begin_connect(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        if *state != ConnectionState::Disconnected {
            return Err(Bm2Error::InvalidState {
                expected: ConnectionState::Disconnected,
                actual: *state,
            });
        }
        *state = ConnectionState::Connecting;
        Ok(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Whether `generation` is still the live connect attempt
    fn is_current(&self, state: ConnectionState, generation: u64) -> bool {
        state == ConnectionState::Connecting && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Return to `Disconnected` unless a newer attempt or a disconnect took over
    async fn abandon_connect(&self, generation: u64) {
        let mut state = self.state.write().await;
        if self.is_current(*state, generation) {
            *state = ConnectionState::Disconnected;
        }
    }

    async fn attach(
        &self,
        transport: Arc<dyn Transport>,
        info: Option<DeviceInfo>,
        generation: u64,
    ) -> Result<()> {
        let stream = match transport.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to subscribe to notifications: {e}");
                self.close_transport(transport.as_ref()).await;
                self.abandon_connect(generation).await;
                return Err(e);
            }
        };

        let link_open = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_frames(stream, frame_tx, link_open.clone()));
        let processor = tokio::spawn(process_frames(frame_rx, self.messages.clone()));

        let mut state = self.state.write().await;
        if !self.is_current(*state, generation) {
            // disconnect() or a newer connect ran while the link was being set up
            drop(state);
            receiver.abort();
            processor.abort();
            self.unsubscribe_transport(transport.as_ref()).await;
            self.close_transport(transport.as_ref()).await;
            return Err(Bm2Error::ConnectionFailed(
                "connection attempt was superseded".to_string(),
            ));
        }

        *self.tasks.lock().await = vec![receiver, processor];
        *self.transport.write().await = Some(transport);
        *self.link_open.write().await = link_open;
        *self.device_info.write().await = info;
        *state = ConnectionState::Subscribed;
        info!("Subscribed to BM2 notifications");

        Ok(())
    }

    /// Encode, encrypt and write a command
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::InvalidState`] if the session is not subscribed,
    /// or [`Bm2Error::WriteRejected`] if the device does not acknowledge the
    /// write in time.
    pub async fn send(&self, command: &Command) -> Result<()> {
        debug!("Sending command: {command:?}");
        self.send_raw(&command.to_bytes()).await
    }

    /// Encrypt and write an arbitrary plaintext payload
    ///
    /// Writes are serialized: a call waits for the previous write's
    /// acknowledgment before sending.
    ///
    /// # Errors
    ///
    /// Returns [`Bm2Error::InvalidState`] if the session is not subscribed,
    /// or [`Bm2Error::WriteRejected`] if the device does not acknowledge the
    /// write in time.
    pub async fn send_raw(&self, plaintext: &[u8]) -> Result<()> {
        let _write_guard = self.write_lock.lock().await;

        let transport = self.subscribed_transport().await?;
        let frame = self.cipher.encrypt(plaintext);
        debug!("TX plaintext: {}", hex::encode(plaintext));

        let write_timeout_ms = self.params.write_timeout_ms;
        timeout(Duration::from_millis(write_timeout_ms), transport.write(&frame))
            .await
            .map_err(|_| {
                Bm2Error::WriteRejected(format!("no acknowledgment within {write_timeout_ms}ms"))
            })?
    }

    async fn subscribed_transport(&self) -> Result<Arc<dyn Transport>> {
        let state = self.state.read().await;
        if *state != ConnectionState::Subscribed {
            return Err(Bm2Error::InvalidState {
                expected: ConnectionState::Subscribed,
                actual: *state,
            });
        }

        self.transport
            .read()
            .await
            .clone()
            .ok_or(Bm2Error::InvalidState {
                expected: ConnectionState::Subscribed,
                actual: ConnectionState::Disconnected,
            })
    }

    /// Unsubscribe, stop processing and close the link.
    ///
    /// Always ends in [`ConnectionState::Disconnected`]; cleanup failures are
    /// logged, not returned. Calling this while already disconnected is a no-op.
    ///
    /// # Errors
    ///
    /// Currently never fails.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                debug!("Already disconnected");
                return Ok(());
            }
            *state = ConnectionState::Disconnecting;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        info!("Disconnecting from device");

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.link_open.read().await.store(false, Ordering::SeqCst);

        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            self.unsubscribe_transport(transport.as_ref()).await;
            self.close_transport(transport.as_ref()).await;
        }

        *self.device_info.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;
        info!("Disconnected");

        Ok(())
    }

    async fn unsubscribe_transport(&self, transport: &dyn Transport) {
        let timeout_ms = self.params.disconnect_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), transport.unsubscribe()).await {
            Ok(Ok(())) => debug!("Unsubscribed from notifications"),
            Ok(Err(e)) if e.is_benign_cleanup() => debug!("Notifications already unsubscribed"),
            Ok(Err(e)) => warn!("Failed to unsubscribe: {e}"),
            Err(_) => warn!("Unsubscribe did not finish within {timeout_ms}ms"),
        }
    }

    async fn close_transport(&self, transport: &dyn Transport) {
        let timeout_ms = self.params.disconnect_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Ignoring disconnect error: {e}"),
            Err(_) => warn!("Transport did not close within {timeout_ms}ms"),
        }
    }
}

impl Drop for Bm2Session {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }

        if let Some(transport) = self.transport.get_mut().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = transport.unsubscribe().await;
                    let _ = transport.disconnect().await;
                });
            }
        }
    }
}

/// Forward notifications into the processing queue without waiting on parsing
async fn receive_frames(
    mut stream: NotificationStream,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    link_open: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        debug!("RX notification: {}", hex::encode(&frame));
        if frames.send(frame).is_err() {
            error!("Frame processing stopped, dropping notifications");
            break;
        }
    }
    link_open.store(false, Ordering::SeqCst);
    info!("Notification stream ended");
}

/// Decode frames one at a time; owns the connection's [`SessionState`]
async fn process_frames(
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    messages: mpsc::UnboundedSender<Message>,
) {
    let cipher = FrameCipher::default();
    let mut state = SessionState::default();

    while let Some(frame) = frames.recv().await {
        match decode_frame(&cipher, &frame, &mut state, unix_time_ms()) {
            Ok(Message::Unrecognized) => {
                info!("No parser matched frame {}", hex::encode(&frame));
            }
            Ok(message) => {
                debug!("Parsed message: {message:?}");
                if messages.send(message).is_err() {
                    debug!("Message receiver dropped");
                }
            }
            Err(e) => warn!("Dropping frame: {e}"),
        }
    }

    debug!("Frame processing finished");
}
