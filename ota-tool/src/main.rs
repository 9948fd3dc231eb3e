use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use portal_core::hash;
use portal_core::http::backup_file_name;
use portal_core::UpdateTarget;
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(180);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "ESP32 Captive Portal OTA Tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware or filesystem image
    Upload {
        /// Device address, e.g. 192.168.4.1
        host: String,
        /// Image file to upload
        image: PathBuf,
        #[arg(short = 't', long = "type", value_enum, default_value_t = Kind::Firmware)]
        kind: Kind,
        /// Do not send a SHA-256 digest with the image
        #[arg(long)]
        no_hash: bool,
    },
    /// Show the device's update status
    Status { host: String },
    /// Download a raw partition backup
    Backup {
        host: String,
        #[arg(short = 't', long = "type", value_enum)]
        kind: Kind,
        /// Output file (defaults to esp32_<type>_backup.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Firmware,
    Filesystem,
}

impl From<Kind> for UpdateTarget {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Firmware => UpdateTarget::Firmware,
            Kind::Filesystem => UpdateTarget::Filesystem,
        }
    }
}

/// Body of `GET /api/ota`.
#[derive(Debug, Deserialize, PartialEq)]
struct DeviceStatus {
    state: u8,
    #[serde(rename = "type")]
    kind: u8,
    progress: u8,
    backup_available: bool,
    backup_created: bool,
    backup_skipped: bool,
    current_partition: String,
    error: String,
}

/// Body of `GET /api/version`.
#[derive(Debug, Deserialize)]
struct DeviceVersion {
    version: String,
    partition: String,
}

#[derive(Debug, Deserialize)]
struct UploadReply {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Upload { host, image, kind, no_hash } => upload(&host, &image, kind.into(), !no_hash),
        Commands::Status { host } => status(&host),
        Commands::Backup { host, kind, output } => backup(&host, kind.into(), output),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

/// `http://<host>` without a trailing slash. Accepts bare addresses or URLs.
fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn state_name(state: u8) -> &'static str {
    match state {
        0 => "Idle",
        1 => "Uploading",
        2 => "Verifying",
        3 => "Flashing",
        4 => "Success",
        5 => "Error",
        _ => "Unknown",
    }
}

/// Turns a non-200 reply into an error carrying the device's message.
fn device_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    match serde_json::from_str::<ErrorReply>(body) {
        Ok(reply) => anyhow::anyhow!("HTTP {} {}: {}", status.as_u16(), reply.error.code, reply.error.message),
        Err(_) => anyhow::anyhow!("HTTP {}: {}", status.as_u16(), body.trim()),
    }
}

fn upload(host: &str, image: &Path, target: UpdateTarget, with_hash: bool) -> Result<()> {
    let data = fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;
    if data.is_empty() {
        bail!("{} is empty", image.display());
    }
    let size = data.len() as u64;
    let file_name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.bin".to_string());

    println!("{} {} update", "🚀".blue(), target.display_name());
    println!("   Device: {}", base_url(host));
    println!("   Image:  {} ({} bytes, {:.2} MB)", file_name, size, size as f64 / 1024.0 / 1024.0);

    let mut form = multipart::Form::new().text("type", target.as_str());
    if with_hash {
        let digest = hash::to_hex(&hash::sha256(&data));
        println!("   SHA256: {}", digest.dimmed());
        form = form.text("hash", digest);
    }

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    let file_part = multipart::Part::reader_with_length(pb.wrap_read(Cursor::new(data)), size)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;
    form = form.part("file", file_part);

    let client = Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
    let response = client.post(format!("{}/api/ota", base_url(host))).multipart(form).send();
    pb.finish_and_clear();

    let response = response.context("Upload request failed")?;
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(device_error(status, &body));
    }

    let reply: UploadReply = serde_json::from_str(&body).context("Unexpected reply from device")?;
    println!("   {} {}", "✅".green(), reply.message);
    Ok(())
}

fn status(host: &str) -> Result<()> {
    let client = Client::builder().timeout(STATUS_TIMEOUT).build()?;
    let response = client.get(format!("{}/api/ota", base_url(host))).send()?;
    let code = response.status();
    if !code.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(device_error(code, &body));
    }
    let status: DeviceStatus = response.json()?;
    // Older firmware has no version endpoint.
    let version = client
        .get(format!("{}/api/version", base_url(host)))
        .send()
        .ok()
        .filter(|response| response.status().is_success())
        .and_then(|response| response.json::<DeviceVersion>().ok());

    println!("{} Device {}", "📟".blue(), base_url(host));
    if let Some(version) = version {
        println!("   Firmware:  {} (running from {})", version.version.bold(), version.partition);
    }
    println!("   Partition: {}", status.current_partition.bold());
    println!(
        "   State:     {} ({})",
        state_name(status.state),
        if status.kind == 1 { "filesystem" } else { "firmware" }
    );
    println!("   Progress:  {}%", status.progress);
    println!(
        "   Backup:    available={} created={} skipped={}",
        status.backup_available, status.backup_created, status.backup_skipped
    );
    if !status.error.is_empty() {
        println!("   Error:     {}", status.error.red());
    }
    Ok(())
}

fn backup(host: &str, target: UpdateTarget, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from(backup_file_name(target)));
    println!("{} Downloading {} backup to {}", "💾".blue(), target.as_str(), output.display());

    let client = Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
    let response = client
        .get(format!("{}/api/ota", base_url(host)))
        .query(&[("backup", target.as_str())])
        .send()?;
    let code = response.status();
    if !code.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(device_error(code, &body));
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("   {spinner:.green} {bytes} ({bytes_per_sec})")?);
    pb.enable_steady_tick(Duration::from_millis(120));

    let file = File::create(&output).with_context(|| format!("Failed to create {}", output.display()))?;
    let mut reader = pb.wrap_read(response);
    let mut writer = io::BufWriter::new(file);
    let written = io::copy(&mut reader, &mut writer).context("Backup download interrupted")?;
    pb.finish_and_clear();

    println!("   {} {} bytes written", "✅".green(), written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_become_urls() {
        assert_eq!(base_url("192.168.4.1"), "http://192.168.4.1");
        assert_eq!(base_url("http://192.168.4.1/"), "http://192.168.4.1");
        assert_eq!(base_url(" portal.local:8080 "), "http://portal.local:8080");
    }

    #[test]
    fn decodes_status_reply() {
        let body = r#"{"state":5,"type":1,"progress":42,"backup_available":false,"backup_created":false,"backup_skipped":true,"current_partition":"ota_0","error":"Hash verification failed"}"#;
        let status: DeviceStatus = serde_json::from_str(body).unwrap();
        assert_eq!(state_name(status.state), "Error");
        assert_eq!(status.kind, 1);
        assert_eq!(status.current_partition, "ota_0");
        assert_eq!(status.error, "Hash verification failed");
    }

    #[test]
    fn decodes_version_reply() {
        let version: DeviceVersion =
            serde_json::from_str(r#"{"version":"v1.2-rust (0.1.0)","partition":"ota_1"}"#).unwrap();
        assert_eq!(version.version, "v1.2-rust (0.1.0)");
        assert_eq!(version.partition, "ota_1");
    }

    #[test]
    fn device_errors_carry_message() {
        let err = device_error(
            reqwest::StatusCode::CONFLICT,
            r#"{"error":{"code":"CONFLICT","message":"Update already in progress"}}"#,
        );
        assert_eq!(err.to_string(), "HTTP 409 CONFLICT: Update already in progress");

        let err = device_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down\n");
        assert_eq!(err.to_string(), "HTTP 502: upstream down");
    }

    #[test]
    fn cli_parses_upload() {
        let cli = Cli::try_parse_from(["ota-tool", "upload", "192.168.4.1", "fs.bin", "--type", "filesystem", "--no-hash"])
            .unwrap();
        match cli.command {
            Commands::Upload { kind, no_hash, .. } => {
                assert_eq!(UpdateTarget::from(kind), UpdateTarget::Filesystem);
                assert!(no_hash);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn backup_requires_type() {
        assert!(Cli::try_parse_from(["ota-tool", "backup", "192.168.4.1"]).is_err());
    }
}
