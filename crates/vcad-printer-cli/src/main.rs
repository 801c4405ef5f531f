//! vcad-printer CLI - control a Bambu Lab printer from the terminal
//!
//! Connects with a TOML printer profile, sends commands and prints reports.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vcad_printer::{
    ChannelSettings, ParamValue, Params, Printer, PrinterConfig, ReportEnvelope,
};

#[derive(Parser)]
#[command(name = "vcad-printer")]
#[command(about = "Control a Bambu Lab printer over MQTT", long_about = None)]
struct Cli {
    /// Printer profile (TOML)
    #[arg(short, long, global = true, default_value = "printer.toml")]
    config: PathBuf,

    /// Seconds allowed for connecting and for each command
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture the certificate a printer presents and save it as PEM
    FetchCert {
        /// Printer address
        host: String,
        /// Broker port
        #[arg(long, default_value_t = vcad_printer::config::MQTT_PORT)]
        port: u16,
        /// Where to write the certificate
        #[arg(short, long, default_value = "printer.pem")]
        output: PathBuf,
    },
    /// Request a full status push and print it
    Status,
    /// Send an arbitrary command
    Send {
        /// Envelope category, e.g. print or system
        category: String,
        /// Command name
        command: String,
        /// Parameters as key=value (numbers and booleans are typed)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Execute a G-code line
    Gcode {
        /// G-code, e.g. "G28"
        line: String,
    },
    /// Print every report until interrupted
    Watch {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

/// Log subscriber writing to `writer` in either format. Stdout stays reserved
/// for command output.
fn subscriber<W>(
    log_json: bool,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        Box::new(registry.with(tracing_subscriber::fmt::layer().json().with_writer(writer)))
    } else {
        Box::new(registry.with(tracing_subscriber::fmt::layer().with_writer(writer)))
    }
}

fn init_tracing(log_json: bool) {
    let env_filter =
        EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "vcad_printer=info".into()));
    subscriber(log_json, env_filter, std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = ChannelSettings::default();
    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(settings.connect_timeout);

    match cli.command {
        Commands::FetchCert { host, port, output } => {
            fetch_cert(&host, port, &output, timeout).await?;
        }
        Commands::Status => {
            let printer = connect(&cli.config, settings, timeout).await?;
            let status = printer.status(Instant::now() + timeout).await;
            printer.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&status?)?);
        }
        Commands::Send {
            category,
            command,
            params,
        } => {
            let params = parse_params(&params)?;
            let printer = connect(&cli.config, settings, timeout).await?;
            let sent = printer
                .send(&category, &command, params, Instant::now() + timeout)
                .await;
            printer.disconnect().await;
            sent?;
            println!("Sent {category}/{command}");
        }
        Commands::Gcode { line } => {
            let printer = connect(&cli.config, settings, timeout).await?;
            let sent = printer.send_gcode(&line, Instant::now() + timeout).await;
            printer.disconnect().await;
            sent?;
            println!("Sent {line}");
        }
        Commands::Watch { duration } => {
            let printer = connect(&cli.config, settings, timeout).await?;
            watch(&printer, duration.map(Duration::from_secs), timeout).await?;
            printer.disconnect().await;
        }
    }

    Ok(())
}

async fn fetch_cert(host: &str, port: u16, output: &Path, timeout: Duration) -> Result<()> {
    let cert = vcad_printer::trust::fetch_device_certificate(host, port, timeout).await?;
    std::fs::write(output, cert.to_pem())
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "Saved certificate for {} to {}",
        cert.common_name().as_deref().unwrap_or("<no common name>"),
        output.display()
    );
    Ok(())
}

async fn connect(config: &Path, settings: ChannelSettings, timeout: Duration) -> Result<Printer> {
    let config = PrinterConfig::load(config)
        .with_context(|| format!("loading printer profile {}", config.display()))?;
    let printer = Printer::with_settings(config, settings);
    printer
        .connect(Instant::now() + timeout)
        .await
        .context("connecting to printer")?;
    Ok(printer)
}

async fn watch(printer: &Printer, duration: Option<Duration>, timeout: Duration) -> Result<()> {
    printer
        .subscribe_reports(print_report, Instant::now() + timeout)
        .await?;
    printer.request_full_status(Instant::now() + timeout).await?;

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    Ok(())
}

fn print_report(report: ReportEnvelope) {
    let mut line = format!("{}/{}", report.category, report.command);
    if !report.sequence_id.is_empty() {
        line.push_str(&format!(" #{}", report.sequence_id));
    }
    if !report.result.is_empty() {
        line.push_str(&format!(" {}", report.result));
    }
    if !report.reason.is_empty() {
        line.push_str(&format!(" ({})", report.reason));
    }
    if !report.extra_fields.is_empty() {
        line.push(' ');
        line.push_str(&serde_json::Value::Object(report.extra_fields).to_string());
    }
    println!("{line}");
}

fn parse_params(raw: &[String]) -> Result<Params> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("parameter {pair:?} is not key=value"))?;
            Ok((key.to_string(), parse_value(value)))
        })
        .collect()
}

fn parse_value(value: &str) -> ParamValue {
    if let Ok(int) = value.parse::<i64>() {
        ParamValue::Int(int)
    } else if let Ok(float) = value.parse::<f64>() {
        ParamValue::Float(float)
    } else if let Ok(flag) = value.parse::<bool>() {
        ParamValue::Bool(flag)
    } else {
        ParamValue::Str(value.to_string())
    }
}
