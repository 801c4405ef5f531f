//! Printer telemetry parsed from reports.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::ReportEnvelope;

/// Printer state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrintState {
    /// Printer is idle.
    Idle,
    /// Print in progress.
    Printing,
    /// Print paused.
    Paused,
    /// Print finished.
    Finished,
    /// Error state.
    Error(String),
    /// Preparing to print.
    Preparing,
    /// Unknown state.
    #[default]
    Unknown,
}

impl PrintState {
    /// Parse a `gcode_state` value.
    pub fn from_gcode_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "idle" | "standby" => Self::Idle,
            "printing" | "running" => Self::Printing,
            "paused" | "pause" => Self::Paused,
            "finished" | "finish" | "completed" => Self::Finished,
            "preparing" | "prepare" | "slicing" => Self::Preparing,
            s if s.contains("error") || s.contains("fail") => Self::Error(state.to_string()),
            _ => Self::Unknown,
        }
    }
}

/// AMS (Automatic Material System) status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmsStatus {
    /// AMS units.
    pub units: Vec<AmsUnit>,
    /// Currently active AMS unit.
    pub active_unit: Option<usize>,
    /// Currently active slot within the unit.
    pub active_slot: Option<usize>,
}

/// Single AMS unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsUnit {
    /// Unit ID.
    pub id: u8,
    /// Slots in this unit.
    pub slots: Vec<AmsSlot>,
    /// Humidity level as reported (1 driest to 5 wettest on current firmware).
    pub humidity: Option<u8>,
    /// Temperature (°C).
    pub temperature: Option<f32>,
}

/// One AMS tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsSlot {
    /// Slot ID (0-3).
    pub id: u8,
    /// Filament type (e.g., "PLA", "PETG").
    pub filament_type: Option<String>,
    /// Filament colour, RRGGBBAA.
    pub color: Option<String>,
    /// Remaining filament percentage.
    pub remaining: Option<u8>,
}

/// Printer status snapshot.
///
/// The printer sends a full status after `pushall` and deltas afterwards;
/// [`PrinterStatus::apply`] merges either into the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    /// Current print state.
    pub state: PrintState,
    /// Print progress (0-100).
    pub progress_percent: f64,
    /// Current layer number.
    pub layer_current: u32,
    /// Total layer count.
    pub layer_total: u32,
    /// Remaining time in minutes.
    pub time_remaining_min: u32,
    /// Nozzle temperature (°C).
    pub nozzle_temp: f64,
    /// Target nozzle temperature.
    pub nozzle_target: f64,
    /// Bed temperature (°C).
    pub bed_temp: f64,
    /// Target bed temperature.
    pub bed_target: f64,
    /// Chamber temperature (if available).
    pub chamber_temp: Option<f64>,
    /// Part cooling fan (0-100).
    pub fan_speed: u8,
    /// Print speed level (1-4).
    pub print_speed: u8,
    /// AMS status (if available).
    pub ams_status: Option<AmsStatus>,
    /// Current file name.
    pub filename: Option<String>,
    /// WiFi signal strength (dBm).
    pub wifi_signal: Option<i32>,
    /// Firmware version of the main board.
    pub firmware_version: Option<String>,
}

impl PrinterStatus {
    /// Snapshot built from a single report.
    pub fn from_report(report: &ReportEnvelope) -> Self {
        let mut status = Self::default();
        status.apply(report);
        status
    }

    /// Merge the telemetry carried by `report`. Returns whether anything applied.
    ///
    /// Handles `print/push_status` and `info/get_version`; other reports are ignored.
    pub fn apply(&mut self, report: &ReportEnvelope) -> bool {
        match (report.category.as_str(), report.command.as_str()) {
            ("print", "push_status") => {
                self.apply_push_status(&report.extra_fields);
                true
            }
            ("info", "get_version") => self.apply_version(&report.extra_fields),
            _ => false,
        }
    }

    fn apply_push_status(&mut self, print: &Map<String, Value>) {
        if let Some(state) = print.get("gcode_state").and_then(Value::as_str) {
            self.state = PrintState::from_gcode_state(state);
        }
        if let Some(pct) = number(print, "mc_percent") {
            self.progress_percent = pct;
        }
        if let Some(layer) = number(print, "layer_num") {
            self.layer_current = layer as u32;
        }
        if let Some(total) = number(print, "total_layer_num") {
            self.layer_total = total as u32;
        }
        if let Some(remaining) = number(print, "mc_remaining_time") {
            self.time_remaining_min = remaining as u32;
        }

        if let Some(temp) = number(print, "nozzle_temper") {
            self.nozzle_temp = temp;
        }
        if let Some(target) = number(print, "nozzle_target_temper") {
            self.nozzle_target = target;
        }
        if let Some(temp) = number(print, "bed_temper") {
            self.bed_temp = temp;
        }
        if let Some(target) = number(print, "bed_target_temper") {
            self.bed_target = target;
        }
        if let Some(temp) = number(print, "chamber_temper") {
            self.chamber_temp = Some(temp);
        }

        if let Some(fan) = number(print, "cooling_fan_speed") {
            // Reported as 0-15.
            self.fan_speed = ((fan.clamp(0.0, 15.0) * 100.0) / 15.0).round() as u8;
        }
        if let Some(speed) = number(print, "spd_lvl") {
            self.print_speed = speed as u8;
        }

        if let Some(name) = print.get("gcode_file").and_then(Value::as_str) {
            self.filename = (!name.is_empty()).then(|| name.to_string());
        }
        if let Some(signal) = print.get("wifi_signal").and_then(Value::as_str) {
            self.wifi_signal = signal.replace("dBm", "").trim().parse().ok();
        }

        if let Some(ams) = print.get("ams").and_then(Value::as_object) {
            self.ams_status = Some(parse_ams(ams));
        }
    }

    fn apply_version(&mut self, info: &Map<String, Value>) -> bool {
        let ota = info
            .get("module")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|module| module.get("name").and_then(Value::as_str) == Some("ota"));

        match ota.and_then(|m| m.get("sw_ver")).and_then(Value::as_str) {
            Some(version) => {
                self.firmware_version = Some(version.to_string());
                true
            }
            None => false,
        }
    }
}

fn parse_ams(ams: &Map<String, Value>) -> AmsStatus {
    let units: Vec<AmsUnit> = ams
        .get("ams")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .map(|unit| AmsUnit {
            id: number(unit, "id").unwrap_or_default() as u8,
            humidity: number(unit, "humidity").map(|h| h as u8),
            temperature: number(unit, "temp").map(|t| t as f32),
            slots: unit
                .get("tray")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_object)
                .map(|tray| AmsSlot {
                    id: number(tray, "id").unwrap_or_default() as u8,
                    filament_type: text(tray, "tray_type"),
                    color: text(tray, "tray_color"),
                    remaining: number(tray, "remain")
                        .filter(|r| *r >= 0.0)
                        .map(|r| r as u8),
                })
                .collect(),
        })
        .collect();

    // tray_now is a global tray index: unit * 4 + slot. 254/255 mean external spool or none.
    let (active_unit, active_slot) = match number(ams, "tray_now").map(|t| t as usize) {
        Some(tray) if tray < 16 => (Some(tray / 4), Some(tray % 4)),
        _ => (None, None),
    };

    AmsStatus {
        units,
        active_unit,
        active_slot,
    }
}

/// Numeric field, accepting numbers or numeric strings.
fn number(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode_report;

    fn report(json: &str) -> ReportEnvelope {
        decode_report(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(PrintState::from_gcode_state("RUNNING"), PrintState::Printing);
        assert_eq!(PrintState::from_gcode_state("PAUSE"), PrintState::Paused);
        assert_eq!(PrintState::from_gcode_state("FINISH"), PrintState::Finished);
        assert_eq!(
            PrintState::from_gcode_state("FAILED"),
            PrintState::Error("FAILED".into())
        );
        assert_eq!(PrintState::from_gcode_state("???"), PrintState::Unknown);
    }

    #[test]
    fn test_push_status() {
        let status = PrinterStatus::from_report(&report(
            r#"{"print": {
                "command": "push_status", "sequence_id": "2021",
                "gcode_state": "RUNNING", "mc_percent": 42, "layer_num": 10,
                "total_layer_num": 120, "mc_remaining_time": 35,
                "nozzle_temper": 219.5, "nozzle_target_temper": 220,
                "bed_temper": 54.9, "bed_target_temper": 55,
                "cooling_fan_speed": "15", "spd_lvl": 2,
                "gcode_file": "benchy.gcode", "wifi_signal": "-44dBm"
            }}"#,
        ));

        assert_eq!(status.state, PrintState::Printing);
        assert_eq!(status.progress_percent, 42.0);
        assert_eq!(status.layer_current, 10);
        assert_eq!(status.layer_total, 120);
        assert_eq!(status.time_remaining_min, 35);
        assert_eq!(status.nozzle_target, 220.0);
        assert_eq!(status.fan_speed, 100);
        assert_eq!(status.print_speed, 2);
        assert_eq!(status.filename.as_deref(), Some("benchy.gcode"));
        assert_eq!(status.wifi_signal, Some(-44));
    }

    #[test]
    fn test_delta_keeps_previous_fields() {
        let mut status = PrinterStatus::from_report(&report(
            r#"{"print": {"command": "push_status", "gcode_state": "RUNNING", "bed_temper": 55}}"#,
        ));
        assert!(status.apply(&report(
            r#"{"print": {"command": "push_status", "mc_percent": 80}}"#
        )));

        assert_eq!(status.state, PrintState::Printing);
        assert_eq!(status.bed_temp, 55.0);
        assert_eq!(status.progress_percent, 80.0);
    }

    #[test]
    fn test_ams_trays() {
        let status = PrinterStatus::from_report(&report(
            r#"{"print": {"command": "push_status", "ams": {
                "tray_now": "5",
                "ams": [
                    {"id": "0", "humidity": "4", "temp": "24.5", "tray": [
                        {"id": "0", "tray_type": "PLA", "tray_color": "FF0000FF", "remain": 80},
                        {"id": "1"}
                    ]},
                    {"id": "1", "humidity": "3", "temp": "25.0", "tray": [
                        {"id": "0", "tray_type": "PETG", "tray_color": "00FF00FF", "remain": -1},
                        {"id": "1", "tray_type": "PLA", "tray_color": "000000FF", "remain": 10}
                    ]}
                ]
            }}}"#,
        ));

        let ams = status.ams_status.unwrap();
        assert_eq!(ams.units.len(), 2);
        assert_eq!(ams.units[0].humidity, Some(4));
        assert_eq!(ams.units[0].slots[0].filament_type.as_deref(), Some("PLA"));
        assert_eq!(ams.units[0].slots[1].filament_type, None);
        assert_eq!(ams.units[1].slots[0].remaining, None);
        assert_eq!(ams.active_unit, Some(1));
        assert_eq!(ams.active_slot, Some(1));
    }

    #[test]
    fn test_firmware_version() {
        let mut status = PrinterStatus::default();
        assert!(status.apply(&report(
            r#"{"info": {"command": "get_version", "module": [
                {"name": "rv1126", "sw_ver": "00.00.19.15"},
                {"name": "ota", "sw_ver": "01.07.00.00"}
            ]}}"#
        )));
        assert_eq!(status.firmware_version.as_deref(), Some("01.07.00.00"));
    }

    #[test]
    fn test_unrelated_report_ignored() {
        let mut status = PrinterStatus::default();
        assert!(!status.apply(&report(
            r#"{"print": {"command": "pause", "result": "success"}}"#
        )));
        assert_eq!(status, PrinterStatus::default());
    }
}
