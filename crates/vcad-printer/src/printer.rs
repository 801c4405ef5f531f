//! High-level printer session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, OnceCell};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::config::{ChannelSettings, PrinterConfig};
use crate::envelope::{decode_report, encode_request, Params, ReportEnvelope};
use crate::error::{ConnError, Error, Result, SendError};
use crate::mqtt::MqttTransport;
use crate::requests::{LedNode, ProjectOptions, Request, SpeedLevel};
use crate::router::{InboundMessage, RawHandler};
use crate::sequence::SequenceAllocator;
use crate::status::PrinterStatus;
use crate::tls::TlsPolicy;
use crate::transport::{SessionParams, Transport};
use crate::trust::{build_verifier, resolve_trust_root, TrustRoot};

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 16;

/// Control session for one printer.
///
/// The pinned certificate and the sequence counter outlive reconnects; a new
/// [`Printer::connect`] after [`Printer::disconnect`] keeps numbering where it left off.
pub struct Printer {
    config: PrinterConfig,
    channel: SecureChannel,
    sequence: SequenceAllocator,
    trust_root: OnceCell<TrustRoot>,
    status_tx: broadcast::Sender<PrinterStatus>,
    latest_status: Arc<Mutex<Option<PrinterStatus>>>,
    status_feed: AtomicBool,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("device_id", &self.config.device_id())
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Printer {
    /// Session over MQTT with default settings.
    pub fn new(config: PrinterConfig) -> Self {
        Self::with_settings(config, ChannelSettings::default())
    }

    /// Session over MQTT.
    pub fn with_settings(config: PrinterConfig, settings: ChannelSettings) -> Self {
        Self::with_transport(config, settings, Arc::new(MqttTransport))
    }

    /// Session over a caller-supplied transport.
    pub fn with_transport(
        config: PrinterConfig,
        settings: ChannelSettings,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config,
            channel: SecureChannel::new(transport, settings),
            sequence: SequenceAllocator::new(),
            trust_root: OnceCell::new(),
            status_tx,
            latest_status: Arc::new(Mutex::new(None)),
            status_feed: AtomicBool::new(false),
        }
    }

    /// Pin `root` up front, skipping certificate resolution on connect.
    pub fn with_trust_root(mut self, root: TrustRoot) -> Self {
        self.trust_root = OnceCell::new_with(Some(root));
        self
    }

    /// Printer configuration.
    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    /// The pinned certificate, once resolved.
    pub fn trust_root(&self) -> Option<&TrustRoot> {
        self.trust_root.get()
    }

    /// Whether the broker connection is up.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Resolve trust (first time only) and connect before `deadline`.
    pub async fn connect(&self, deadline: Instant) -> Result<()> {
        if !self.channel.is_connected() {
            // The status subscription went with the previous connection.
            self.status_feed.store(false, Ordering::SeqCst);
        }

        let tls = if self.config.is_local() {
            let capture_timeout = self.channel.settings().capture_timeout;
            let root = timeout_at(
                deadline,
                self.trust_root.get_or_try_init(|| {
                    resolve_trust_root(&self.config, self.config.ca_cert_path(), capture_timeout)
                }),
            )
            .await
            .map_err(|_| ConnError::Timeout)?
            .map_err(ConnError::from)?;
            TlsPolicy::Pinned(build_verifier(root.clone(), self.config.device_id()))
        } else {
            TlsPolicy::PublicRoots
        };

        let params = SessionParams::for_printer(&self.config, tls, self.channel.settings());
        self.channel.connect(&params, deadline).await?;
        info!(device = self.config.device_id(), "printer session ready");
        Ok(())
    }

    /// Close the connection. Subscriptions are dropped; the counter and pinned
    /// certificate are kept.
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
        self.status_feed.store(false, Ordering::SeqCst);
    }

    /// Publish `category`/`command` with `params` to the request topic.
    ///
    /// Success means the broker accepted the message, not that the printer acted on it.
    pub async fn send(
        &self,
        category: &str,
        command: &str,
        params: Params,
        deadline: Instant,
    ) -> std::result::Result<(), SendError> {
        if !self.channel.is_connected() {
            return Err(SendError::NotConnected);
        }

        let sequence_id = self.sequence.next();
        let payload = encode_request(category, command, &sequence_id, &params)?;
        debug!(category, command, sequence_id = %sequence_id, "sending request");

        self.channel
            .publish(&self.config.request_topic(), payload, deadline)
            .await?;
        Ok(())
    }

    /// Send a catalogued request.
    pub async fn send_request(
        &self,
        request: &Request,
        deadline: Instant,
    ) -> std::result::Result<(), SendError> {
        self.send(request.category(), request.command(), request.params(), deadline)
            .await
    }

    /// Deliver every decodable report to `handler`.
    ///
    /// Payloads that fail to decode are dropped; the subscription carries on.
    pub async fn subscribe_reports<F>(&self, handler: F, deadline: Instant) -> Result<()>
    where
        F: Fn(ReportEnvelope) + Send + Sync + 'static,
    {
        let raw: RawHandler = Arc::new(move |message: &InboundMessage| {
            match decode_report(&message.payload) {
                Ok(report) => handler(report),
                Err(err) => debug!(topic = %message.topic, error = %err, "dropping report"),
            }
        });

        self.channel
            .subscribe(&self.config.report_topic(), raw, deadline)
            .await?;
        Ok(())
    }

    /// Stream of status snapshots, updated from every telemetry report.
    ///
    /// Subscribes to the report topic on first use per connection.
    pub async fn watch_status(&self, deadline: Instant) -> Result<broadcast::Receiver<PrinterStatus>> {
        let receiver = self.status_tx.subscribe();
        if self.status_feed.swap(true, Ordering::SeqCst) {
            return Ok(receiver);
        }

        let latest = Arc::clone(&self.latest_status);
        let status_tx = self.status_tx.clone();
        let subscribed = self
            .subscribe_reports(
                move |report| {
                    let snapshot = {
                        let mut latest = latest.lock();
                        let mut status = latest.clone().unwrap_or_default();
                        if !status.apply(&report) {
                            return;
                        }
                        *latest = Some(status.clone());
                        status
                    };
                    // No receivers is fine.
                    let _ = status_tx.send(snapshot);
                },
                deadline,
            )
            .await;

        if let Err(err) = subscribed {
            self.status_feed.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(receiver)
    }

    /// Last status snapshot received, if any.
    pub fn last_status(&self) -> Option<PrinterStatus> {
        self.latest_status.lock().clone()
    }

    /// Ask for a full status push and wait for it.
    ///
    /// Falls back to the last known snapshot if nothing arrives by `deadline`.
    pub async fn status(&self, deadline: Instant) -> Result<PrinterStatus> {
        let mut updates = self.watch_status(deadline).await?;
        self.request_full_status(deadline).await?;

        loop {
            match timeout_at(deadline, updates.recv()).await {
                Ok(Ok(status)) => return Ok(status),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "status receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.last_status().ok_or_else(|| {
                        warn!(device = self.config.device_id(), "no status report received");
                        Error::Timeout("printer status".into())
                    });
                }
            }
        }
    }

    /// Pause the current print.
    pub async fn pause(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::Pause, deadline).await?)
    }

    /// Resume a paused print.
    pub async fn resume(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::Resume, deadline).await?)
    }

    /// Stop the current print.
    pub async fn stop(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::Stop, deadline).await?)
    }

    /// Send a raw G-code line.
    pub async fn send_gcode(&self, gcode: &str, deadline: Instant) -> Result<()> {
        Ok(self
            .send_request(&Request::GcodeLine(gcode.to_string()), deadline)
            .await?)
    }

    /// Print a G-code file already on the printer.
    pub async fn start_print(&self, filename: &str, deadline: Instant) -> Result<()> {
        Ok(self
            .send_request(&Request::GcodeFile(filename.to_string()), deadline)
            .await?)
    }

    /// Print a plate from a sliced project already on the printer.
    pub async fn print_project(
        &self,
        file: &str,
        options: ProjectOptions,
        deadline: Instant,
    ) -> Result<()> {
        let request = Request::ProjectFile {
            file: file.to_string(),
            options,
        };
        Ok(self.send_request(&request, deadline).await?)
    }

    /// Set print speed level (1-4).
    pub async fn set_speed(&self, level: u8, deadline: Instant) -> Result<()> {
        let request = Request::PrintSpeed(SpeedLevel::from_level(level));
        Ok(self.send_request(&request, deadline).await?)
    }

    /// Turn the chamber light on or off.
    pub async fn set_light(&self, on: bool, deadline: Instant) -> Result<()> {
        Ok(self
            .send_request(&Request::light(LedNode::ChamberLight, on), deadline)
            .await?)
    }

    /// Set the nozzle target temperature.
    pub async fn set_nozzle_temp(&self, temp: u32, deadline: Instant) -> Result<()> {
        self.send_gcode(&format!("M104 S{temp}"), deadline).await
    }

    /// Set the bed target temperature.
    pub async fn set_bed_temp(&self, temp: u32, deadline: Instant) -> Result<()> {
        self.send_gcode(&format!("M140 S{temp}"), deadline).await
    }

    /// Ask the printer to push its full status.
    pub async fn request_full_status(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::PushAll, deadline).await?)
    }

    /// Ask for firmware versions; the answer arrives as an `info/get_version` report.
    pub async fn get_version(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::GetVersion, deadline).await?)
    }

    /// Unload the loaded filament.
    pub async fn unload_filament(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::UnloadFilament, deadline).await?)
    }

    /// Run the calibration routine.
    pub async fn calibrate(&self, deadline: Instant) -> Result<()> {
        Ok(self.send_request(&Request::Calibration, deadline).await?)
    }

    /// Skip objects in the running print.
    pub async fn skip_objects(&self, objects: Vec<i64>, deadline: Instant) -> Result<()> {
        Ok(self
            .send_request(&Request::skip_objects(objects), deadline)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let printer = Printer::new(PrinterConfig::local(
            "01P00C490700226",
            "192.168.0.33",
            "74462393",
        ));

        let err = printer
            .send("print", "pause", Params::new(), soon())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
        assert!(matches!(
            printer.pause(soon()).await,
            Err(Error::Send(SendError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_watch_status_requires_connection() {
        let printer = Printer::new(PrinterConfig::cloud("01P00C490700226", "42", "token"));
        assert!(printer.watch_status(soon()).await.is_err());
        // A failed attempt does not mark the feed as running.
        assert!(!printer.status_feed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreadable_ca_fails_connect() {
        let config = PrinterConfig::local("01P00C490700226", "192.168.0.33", "74462393")
            .with_ca_cert("/nonexistent/printer.pem");
        let printer = Printer::new(config);

        let err = printer.connect(soon()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Conn(ConnError::Trust(crate::TrustError::InvalidCa(_)))
        ));
        assert!(printer.trust_root().is_none());
        assert!(!printer.is_connected());
    }
}
