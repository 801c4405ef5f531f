//! Printer command catalogue.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::envelope::{Params, RequestEnvelope};
use crate::params;

/// Firmware module a request's `src_id` refers to.
const SRC_ID: i64 = 1;

/// Print speed level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedLevel {
    /// Level 1.
    Silent = 1,
    /// Level 2.
    Standard = 2,
    /// Level 3.
    Sport = 3,
    /// Level 4.
    Ludicrous = 4,
}

impl SpeedLevel {
    /// Clamp a numeric level into 1..=4.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => Self::Silent,
            2 => Self::Standard,
            3 => Self::Sport,
            _ => Self::Ludicrous,
        }
    }
}

/// LED to drive with [`Request::LedControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedNode {
    /// Chamber light.
    ChamberLight,
    /// Toolhead work light.
    WorkLight,
}

impl LedNode {
    fn as_str(self) -> &'static str {
        match self {
            Self::ChamberLight => "chamber_light",
            Self::WorkLight => "work_light",
        }
    }
}

/// LED mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedMode {
    /// Steady on.
    On,
    /// Off.
    Off,
    /// Blink with the request's timings.
    Flashing,
}

impl LedMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Flashing => "flashing",
        }
    }
}

/// Options for [`Request::ProjectFile`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectOptions {
    /// Location of the project on the printer.
    pub url: String,
    /// Record a timelapse.
    pub timelapse: bool,
    /// Level the bed first.
    pub bed_leveling: bool,
    /// Flow calibration.
    pub flow_calibration: bool,
    /// Vibration calibration.
    pub vibration_calibration: bool,
    /// First-layer inspection.
    pub layer_inspect: bool,
    /// Feed from the AMS.
    pub use_ams: bool,
    /// AMS tray per filament; empty for the printer default.
    pub ams_mapping: Vec<i64>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            url: "file:///mnt/sdcard".to_string(),
            timelapse: true,
            bed_leveling: true,
            flow_calibration: true,
            vibration_calibration: true,
            layer_inspect: true,
            use_ams: false,
            ams_mapping: Vec::new(),
        }
    }
}

/// A command the printer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Ask for firmware module versions.
    GetVersion,
    /// Ask for a full status push.
    PushAll,
    /// Confirm a pending firmware upgrade.
    UpgradeConfirm,
    /// Confirm module consistency after an upgrade.
    UpgradeConsistencyConfirm,
    /// Start a firmware upgrade.
    UpgradeStart {
        /// Firmware download location.
        url: String,
        /// Firmware module.
        module: String,
        /// Target version.
        version: String,
    },
    /// Ask for the upgrade history.
    UpgradeHistory,
    /// Stop the current print.
    Stop,
    /// Pause the current print.
    Pause,
    /// Resume a paused print.
    Resume,
    /// Load filament from an AMS tray.
    AmsChangeFilament {
        /// Tray index, 255 to unload.
        target: i64,
        /// Current nozzle temperature.
        current_temp: f64,
        /// Target nozzle temperature.
        target_temp: f64,
    },
    /// AMS read-on-startup settings.
    AmsUserSetting {
        /// AMS unit.
        ams_id: i64,
        /// Read RFID tags on startup.
        startup_read: bool,
        /// Read RFID tags on tray insertion.
        tray_read: bool,
    },
    /// Describe the filament in an AMS tray.
    AmsFilamentSetting {
        /// AMS unit.
        ams_id: i64,
        /// Tray within the unit.
        tray_id: i64,
        /// Filament preset id.
        tray_info_idx: String,
        /// RRGGBBAA colour.
        tray_color: String,
        /// Filament type, e.g. `PLA`.
        tray_type: String,
        /// Minimum nozzle temperature.
        nozzle_temp_min: i64,
        /// Maximum nozzle temperature.
        nozzle_temp_max: i64,
    },
    /// AMS control action (`resume`, `reset`, `pause`).
    AmsControl(String),
    /// Set the print speed.
    PrintSpeed(SpeedLevel),
    /// Print a G-code file stored on the printer.
    GcodeFile(String),
    /// Execute raw G-code.
    GcodeLine(String),
    /// Run the calibration routine.
    Calibration,
    /// Unload the loaded filament.
    UnloadFilament,
    /// Print a sliced project file.
    ProjectFile {
        /// Path of the plate G-code inside the project.
        file: String,
        /// Print options.
        options: ProjectOptions,
    },
    /// Skip objects in the running print.
    SkipObjects {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
        /// Object ids to skip.
        objects: Vec<i64>,
    },
    /// Drive an LED.
    LedControl {
        /// Which LED.
        node: LedNode,
        /// Mode.
        mode: LedMode,
        /// On time when flashing, in ms.
        on_time: i64,
        /// Off time when flashing, in ms.
        off_time: i64,
        /// Flash repetitions.
        loop_times: i64,
        /// Pause between loops, in ms.
        interval_time: i64,
    },
    /// Ask for the LAN access code.
    GetAccessCode,
    /// Enable or disable camera recording.
    CameraRecord(bool),
    /// Enable or disable timelapse capture.
    CameraTimelapse(bool),
    /// Configure an AI camera detector.
    XcamControl {
        /// Detector, e.g. `first_layer_inspector` or `spaghetti_detector`.
        module_name: String,
        /// Enable the detector.
        control: bool,
        /// Halt the print on detection.
        print_halt: bool,
    },
}

impl Request {
    /// Skip `objects`, stamped with the current time.
    pub fn skip_objects(objects: Vec<i64>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self::SkipObjects { timestamp, objects }
    }

    /// Steady LED on or off.
    pub fn light(node: LedNode, on: bool) -> Self {
        Self::LedControl {
            node,
            mode: if on { LedMode::On } else { LedMode::Off },
            on_time: 500,
            off_time: 500,
            loop_times: 0,
            interval_time: 0,
        }
    }

    /// Outer envelope key.
    pub fn category(&self) -> &'static str {
        match self {
            Self::GetVersion => "info",
            Self::PushAll => "pushing",
            Self::UpgradeConfirm
            | Self::UpgradeConsistencyConfirm
            | Self::UpgradeStart { .. }
            | Self::UpgradeHistory => "upgrade",
            Self::LedControl { .. } | Self::GetAccessCode => "system",
            Self::CameraRecord(_) | Self::CameraTimelapse(_) => "camera",
            Self::XcamControl { .. } => "xcam",
            _ => "print",
        }
    }

    /// Command name within the category.
    pub fn command(&self) -> &'static str {
        match self {
            Self::GetVersion => "get_version",
            Self::PushAll => "pushall",
            Self::UpgradeConfirm => "upgrade_confirm",
            Self::UpgradeConsistencyConfirm => "consistency_confirm",
            Self::UpgradeStart { .. } => "start",
            Self::UpgradeHistory => "get_history",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::AmsChangeFilament { .. } => "ams_change_filament",
            Self::AmsUserSetting { .. } => "ams_user_setting",
            Self::AmsFilamentSetting { .. } => "ams_filament_setting",
            Self::AmsControl(_) => "ams_control",
            Self::PrintSpeed(_) => "print_speed",
            Self::GcodeFile(_) => "gcode_file",
            Self::GcodeLine(_) => "gcode_line",
            Self::Calibration => "calibration",
            Self::UnloadFilament => "unload_filament",
            Self::ProjectFile { .. } => "project_file",
            Self::SkipObjects { .. } => "skip_objects",
            Self::LedControl { .. } => "ledctrl",
            Self::GetAccessCode => "get_access_code",
            Self::CameraRecord(_) => "ipcam_record_set",
            Self::CameraTimelapse(_) => "ipcam_timelapse",
            Self::XcamControl { .. } => "xcam_control_set",
        }
    }

    /// Body fields besides `sequence_id` and `command`.
    pub fn params(&self) -> Params {
        match self {
            Self::GetVersion
            | Self::UpgradeHistory
            | Self::Calibration
            | Self::UnloadFilament
            | Self::GetAccessCode => params!(),
            Self::PushAll => params! { "version" => 1, "push_target" => 1 },
            Self::UpgradeConfirm | Self::UpgradeConsistencyConfirm => {
                params! { "src_id" => SRC_ID }
            }
            Self::UpgradeStart {
                url,
                module,
                version,
            } => params! {
                "src_id" => SRC_ID,
                "url" => url.as_str(),
                "module" => module.as_str(),
                "version" => version.as_str(),
            },
            Self::Stop | Self::Pause | Self::Resume => params! { "param" => "" },
            Self::AmsChangeFilament {
                target,
                current_temp,
                target_temp,
            } => params! {
                "target" => *target,
                "curr_temp" => *current_temp,
                "tar_temp" => *target_temp,
            },
            Self::AmsUserSetting {
                ams_id,
                startup_read,
                tray_read,
            } => params! {
                "ams_id" => *ams_id,
                "startup_read_option" => *startup_read,
                "tray_read_option" => *tray_read,
            },
            Self::AmsFilamentSetting {
                ams_id,
                tray_id,
                tray_info_idx,
                tray_color,
                tray_type,
                nozzle_temp_min,
                nozzle_temp_max,
            } => params! {
                "ams_id" => *ams_id,
                "tray_id" => *tray_id,
                "tray_info_idx" => tray_info_idx.as_str(),
                "tray_color" => tray_color.as_str(),
                "nozzle_temp_min" => *nozzle_temp_min,
                "nozzle_temp_max" => *nozzle_temp_max,
                "tray_type" => tray_type.as_str(),
            },
            Self::AmsControl(action) => params! { "param" => action.as_str() },
            Self::PrintSpeed(level) => params! { "param" => (*level as u8).to_string() },
            Self::GcodeFile(file) => params! { "param" => file.as_str() },
            Self::GcodeLine(gcode) => params! { "param" => gcode.as_str() },
            Self::ProjectFile { file, options } => {
                let mut body = params! {
                    "param" => file.as_str(),
                    "project_id" => "0",
                    "profile_id" => "0",
                    "task_id" => "0",
                    "subtask_id" => "0",
                    "subtask_name" => "",
                    "file" => "",
                    "url" => options.url.as_str(),
                    "md5" => "",
                    "timelapse" => options.timelapse,
                    "bed_type" => "auto",
                    "bed_levelling" => options.bed_leveling,
                    "flow_cali" => options.flow_calibration,
                    "vibration_cali" => options.vibration_calibration,
                    "layer_inspect" => options.layer_inspect,
                    "use_ams" => options.use_ams,
                };
                body.insert(
                    "ams_mapping".to_string(),
                    if options.ams_mapping.is_empty() {
                        "".into()
                    } else {
                        options.ams_mapping.clone().into()
                    },
                );
                body
            }
            Self::SkipObjects { timestamp, objects } => params! {
                "timestamp" => *timestamp,
                "obj_list" => objects.clone(),
            },
            Self::LedControl {
                node,
                mode,
                on_time,
                off_time,
                loop_times,
                interval_time,
            } => params! {
                "led_node" => node.as_str(),
                "led_mode" => mode.as_str(),
                "led_on_time" => *on_time,
                "led_off_time" => *off_time,
                "loop_times" => *loop_times,
                "interval_time" => *interval_time,
            },
            Self::CameraRecord(enable) | Self::CameraTimelapse(enable) => {
                params! { "control" => if *enable { "enable" } else { "disable" } }
            }
            Self::XcamControl {
                module_name,
                control,
                print_halt,
            } => params! {
                "module_name" => module_name.as_str(),
                "control" => *control,
                "print_halt" => *print_halt,
            },
        }
    }

    /// Full envelope carrying `sequence_id`.
    pub fn envelope(&self, sequence_id: &str) -> RequestEnvelope {
        RequestEnvelope::new(self.category(), self.command(), sequence_id, self.params())
    }
}
