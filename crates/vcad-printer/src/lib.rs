#![warn(missing_docs)]

//! Trusted control channel for network-attached Bambu Lab printers.
//!
//! This crate provides:
//! - Trust-on-first-use certificate pinning for LAN printers
//! - An MQTT-over-TLS session with deadline-bounded connect and publish
//! - Request/report envelope encoding with per-session sequence ids
//! - Topic-routed report subscriptions and a typed status feed
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use vcad_printer::{Printer, PrinterConfig};
//!
//! let config = PrinterConfig::local("01P00C490700226", "192.168.0.33", "74462393");
//! let printer = Printer::new(config);
//!
//! let deadline = Instant::now() + Duration::from_secs(10);
//! printer.connect(deadline).await?;
//!
//! printer
//!     .subscribe_reports(|report| println!("{} {}", report.category, report.command), deadline)
//!     .await?;
//!
//! printer.pause(deadline).await?;
//! printer.disconnect().await;
//! ```

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mqtt;
pub mod printer;
pub mod requests;
pub mod router;
pub mod sequence;
pub mod status;
pub mod tls;
pub mod transport;
pub mod trust;

pub use channel::{ChannelState, SecureChannel};
pub use config::{ChannelSettings, PrinterConfig, UnackedPublish};
pub use envelope::{decode_report, encode_request, ParamValue, Params, ReportEnvelope, RequestEnvelope};
pub use error::{
    ConfigError, ConnError, DecodeError, Error, PubError, Result, SendError, SubError, TrustError,
};
pub use mqtt::MqttTransport;
pub use printer::Printer;
pub use requests::{LedMode, LedNode, ProjectOptions, Request, SpeedLevel};
pub use router::{InboundMessage, SubscriptionRouter};
pub use sequence::SequenceAllocator;
pub use status::{AmsSlot, AmsStatus, AmsUnit, PrintState, PrinterStatus};
pub use tls::TlsPolicy;
pub use transport::{Link, PublishAck, SessionParams, Transport};
pub use trust::{build_verifier, resolve_trust_root, CertificateVerifier, TrustRoot};
