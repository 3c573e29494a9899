use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of every command written to the control characteristic.
pub const PAYLOAD_LEN: usize = 8;

/// Raw command bytes: `[mode, fwd, rev, left, right, lights, turbo, donut]`
pub type CommandPayload = [u8; PAYLOAD_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Throttle {
    Reverse,
    #[default]
    Stopped,
    Forward,
}

impl Throttle {
    /// Map a signed direction onto the three valid throttle positions.
    pub fn from_direction(value: i8) -> Self {
        match value.signum() {
            1 => Self::Forward,
            -1 => Self::Reverse,
            _ => Self::Stopped,
        }
    }

    pub fn direction(self) -> i8 {
        match self {
            Self::Reverse => -1,
            Self::Stopped => 0,
            Self::Forward => 1,
        }
    }
}

impl fmt::Display for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forward => "Forward",
            Self::Reverse => "Reverse",
            Self::Stopped => "Stopped",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Steering {
    Left,
    #[default]
    Straight,
    Right,
}

impl Steering {
    pub fn from_direction(value: i8) -> Self {
        match value.signum() {
            -1 => Self::Left,
            1 => Self::Right,
            _ => Self::Straight,
        }
    }

    pub fn direction(self) -> i8 {
        match self {
            Self::Left => -1,
            Self::Straight => 0,
            Self::Right => 1,
        }
    }
}

impl fmt::Display for Steering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "Left",
            Self::Right => "Right",
            Self::Straight => "Straight",
        })
    }
}

/// The two drive modes the cars understand.
pub const MODE_PRIMARY: u8 = 1;
pub const MODE_ALTERNATE: u8 = 2;

/// Desired vehicle state plus the latest telemetry seen from the car.
///
/// Only the session task mutates this; everyone else works on a
/// [`SessionSnapshot`] copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub mode: u8,
    pub throttle: Throttle,
    pub steering: Steering,
    pub lights: bool,
    pub turbo: bool,
    pub donut: bool,
    pub battery_pct: Option<u8>,
    /// Last payload that was admitted and actually written.
    pub last_payload: Option<CommandPayload>,
    pub last_status: Option<TelemetryRecord>,
    pub last_status_hex: String,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mode: MODE_PRIMARY,
            throttle: Throttle::Stopped,
            steering: Steering::Straight,
            lights: false,
            turbo: false,
            donut: false,
            battery_pct: None,
            last_payload: None,
            last_status: None,
            last_status_hex: String::new(),
        }
    }
}

impl ControlState {
    /// Apply a partial update. Returns `true` if any desired field changed.
    pub fn apply(&mut self, change: &StateChange) -> bool {
        let before = (
            self.mode,
            self.throttle,
            self.steering,
            self.lights,
            self.turbo,
            self.donut,
        );

        if let Some(mode) = change.mode {
            self.mode = match mode {
                ModeUpdate::Set(value) => value,
                ModeUpdate::Toggle => {
                    if self.mode == MODE_PRIMARY {
                        MODE_ALTERNATE
                    } else {
                        MODE_PRIMARY
                    }
                }
            };
        }
        if let Some(throttle) = change.throttle {
            self.throttle = throttle;
        }
        if let Some(steering) = change.steering {
            self.steering = steering;
        }
        if let Some(lights) = change.lights {
            self.lights = lights.resolve(self.lights);
        }
        if let Some(turbo) = change.turbo {
            self.turbo = turbo.resolve(self.turbo);
        }
        if let Some(donut) = change.donut {
            self.donut = donut.resolve(self.donut);
        }

        before
            != (
                self.mode,
                self.throttle,
                self.steering,
                self.lights,
                self.turbo,
                self.donut,
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeUpdate {
    Set(u8),
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdate {
    Set(bool),
    Toggle,
}

impl FlagUpdate {
    fn resolve(self, current: bool) -> bool {
        match self {
            Self::Set(value) => value,
            Self::Toggle => !current,
        }
    }
}

/// Partial update submitted by the input side. `None` leaves a field alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateChange {
    pub mode: Option<ModeUpdate>,
    pub throttle: Option<Throttle>,
    pub steering: Option<Steering>,
    pub lights: Option<FlagUpdate>,
    pub turbo: Option<FlagUpdate>,
    pub donut: Option<FlagUpdate>,
}

impl StateChange {
    pub fn throttle(throttle: Throttle) -> Self {
        Self {
            throttle: Some(throttle),
            ..Default::default()
        }
    }

    pub fn steering(steering: Steering) -> Self {
        Self {
            steering: Some(steering),
            ..Default::default()
        }
    }

    /// Throttle and steering released, everything else untouched.
    pub fn neutral() -> Self {
        Self {
            throttle: Some(Throttle::Stopped),
            steering: Some(Steering::Straight),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 8-byte status report echoed by the car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub mode: u8,
    pub forward: u8,
    pub reverse: u8,
    pub left: u8,
    pub right: u8,
    pub lights: u8,
    pub turbo: u8,
    pub donut: u8,
}

/// Telemetry decoded from a single notification, classified by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryRecord {
    Battery { battery_pct: u8 },
    Status(StatusReport),
    Raw { length: usize, raw: String },
}

impl TelemetryRecord {
    pub fn length(&self) -> usize {
        match self {
            Self::Battery { .. } => 1,
            Self::Status(_) => PAYLOAD_LEN,
            Self::Raw { length, .. } => *length,
        }
    }

    /// Named integer fields, in wire order. Empty for the raw variant.
    pub fn fields(&self) -> Vec<(&'static str, u8)> {
        match self {
            Self::Battery { battery_pct } => vec![("battery_pct", *battery_pct)],
            Self::Status(s) => vec![
                ("mode", s.mode),
                ("forward", s.forward),
                ("reverse", s.reverse),
                ("left", s.left),
                ("right", s.right),
                ("lights", s.lights),
                ("turbo", s.turbo),
                ("donut", s.donut),
            ],
            Self::Raw { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Self::Raw { raw, .. } = self {
            return f.write_str(raw);
        }
        let parts: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Disconnected => "Disconnected",
        })
    }
}

/// Read-only copy of the session state handed to the presentation side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub state: ControlState,
    pub status_notify: bool,
    pub battery_notify: bool,
}

/// Everything the session reports to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(String),
    Warn(String),
    Error(String),
    Connected,
    Disconnected,
    Battery(u8),
    Status(TelemetryRecord),
    Payload(CommandPayload),
    Shutdown,
}
