//! Terminal output for the devfleet CLI: status lines, key/value blocks
//! and tables, plus `--format json` passthrough.

use chrono::{DateTime, TimeDelta, Utc};
use colored::{ColoredString, Colorize};
use serde::Serialize;

use crate::engine::models::{Device, DeviceStatus, UpdateRecord};
use crate::engine::updater::state::AgentPhase;

const COLUMN_SEPARATOR: &str = " │ ";

fn status_line(mark: ColoredString, message: &str) -> String {
    format!("{mark} {message}")
}

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{}", status_line("✓".green().bold(), message));
    }

    /// Errors go to stderr so `--format json` output stays parseable
    pub fn error(message: &str) {
        eprintln!("{}", status_line("✗".red().bold(), message));
    }

    pub fn warning(message: &str) {
        println!("{}", status_line("!".yellow().bold(), message));
    }

    pub fn info(message: &str) {
        println!("{}", status_line("·".blue().bold(), message));
    }

    pub fn header(title: &str) {
        let rule = "─".repeat(title.chars().count());
        println!("\n{}\n{}", title.bright_cyan().bold(), rule.bright_black());
    }

    pub fn kv(key: &str, value: &str) {
        println!("  {:<16} {value}", format!("{key}:").bold());
    }

    pub fn item(text: &str) {
        println!("    - {text}");
    }

    pub fn table_header(columns: &[&str]) {
        let plain = columns.join(COLUMN_SEPARATOR);
        let styled: Vec<String> = columns.iter().map(|c| c.bold().to_string()).collect();
        println!("  {}", styled.join(COLUMN_SEPARATOR));
        println!("  {}", "─".repeat(plain.chars().count()).bright_black());
    }

    pub fn table_row(values: &[&str]) {
        println!("  {}", values.join(COLUMN_SEPARATOR));
    }

    /// Pretty JSON for `--format json`
    pub fn json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn update(record: &UpdateRecord) {
        Self::header(&record.version.to_string());
        Self::kv("Description", &record.description);
        Self::kv("Policy", record.policy.as_str());
        Self::kv("Published", &format_time(Some(record.created_at)));
        Self::kv("Size", &format_size(record.package_size));
        Self::kv("Checksum", &record.package_checksum);
        if record.requires_system_packages {
            Self::kv("System packages", &record.system_packages.join(", "));
        }
    }

    pub fn updates(records: &[UpdateRecord]) {
        if records.is_empty() {
            Self::info("No updates published");
            return;
        }
        Self::table_header(&["Version", "Policy", "Size", "Published"]);
        for record in records {
            Self::table_row(&[
                &record.version.to_string(),
                record.policy.as_str(),
                &format_size(record.package_size),
                &format_time(Some(record.created_at)),
            ]);
        }
    }

    pub fn device(device: &Device) {
        Self::header(&device.display_name);
        Self::kv("UUID", &device.uuid);
        Self::kv("Status", &status_label(device.status).to_string());
        Self::kv("Version", &device.current_version.to_string());
        Self::kv("Timezone", &device.timezone);
        Self::kv("Last seen", &format_time(device.last_seen));
        for (key, value) in &device.metadata {
            Self::item(&format!("{key} = {value}"));
        }
    }

    pub fn devices(devices: &[Device]) {
        if devices.is_empty() {
            Self::info("No devices registered");
            return;
        }
        Self::table_header(&["Name", "UUID", "Status", "Version", "Last seen"]);
        for device in devices {
            Self::table_row(&[
                &device.display_name,
                &device.uuid,
                &status_label(device.status).to_string(),
                &device.current_version.to_string(),
                &format_time(device.last_seen),
            ]);
        }
    }

    pub fn phase(phase: &AgentPhase) -> ColoredString {
        match phase {
            AgentPhase::Error { .. } => phase.name().red(),
            AgentPhase::UpToDate | AgentPhase::Idle => phase.name().green(),
            _ => phase.name().yellow(),
        }
    }
}

fn status_label(status: DeviceStatus) -> ColoredString {
    match status {
        DeviceStatus::Online => status.as_str().green(),
        DeviceStatus::Updating => status.as_str().yellow(),
        DeviceStatus::Offline => status.as_str().bright_black(),
        DeviceStatus::Disabled => status.as_str().red(),
    }
}

/// Package sizes in binary units
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}

/// Coarse remaining time, negative deltas read as zero
pub fn format_duration(delta: TimeDelta) -> String {
    let secs = delta.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}
