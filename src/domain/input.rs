//! Keyboard and gamepad to drive-intent mapping.
//!
//! Nothing here talks to the car. The mappers only turn key transitions and
//! polled gamepad readings into [`Intent`]s for the session handle.

use crate::domain::models::{FlagUpdate, ModeUpdate, StateChange, Steering, Throttle};
use std::collections::HashSet;

/// Keys the dashboard reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    S,
    A,
    D,
    L,
    T,
    O,
    M,
    B,
    Q,
    R,
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Change(StateChange),
    RequestBattery,
    Reconnect,
    NextGamepad,
    PreviousGamepad,
    Quit,
}

/// Tracks held drive keys so that opposing keys resolve to the most
/// recently pressed one.
#[derive(Debug, Default)]
pub struct KeyboardMapper {
    throttle_keys: HashSet<Key>,
    steering_keys: HashSet<Key>,
    toggle_keys: HashSet<Key>,
    last_throttle_key: Option<Key>,
    last_steering_key: Option<Key>,
    throttle: Throttle,
    steering: Steering,
}

impl KeyboardMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, key: Key) -> Option<Intent> {
        match key {
            Key::W | Key::S => {
                self.throttle_keys.insert(key);
                self.last_throttle_key = Some(key);
                self.update_throttle()
            }
            Key::A | Key::D => {
                self.steering_keys.insert(key);
                self.last_steering_key = Some(key);
                self.update_steering()
            }
            _ => {
                // Toggles fire once per physical press.
                if !self.toggle_keys.insert(key) {
                    return None;
                }
                Self::toggle_intent(key)
            }
        }
    }

    pub fn key_up(&mut self, key: Key) -> Option<Intent> {
        if self.throttle_keys.remove(&key) {
            return self.update_throttle();
        }
        if self.steering_keys.remove(&key) {
            return self.update_steering();
        }
        self.toggle_keys.remove(&key);
        None
    }

    /// Forget every held key, e.g. when the window loses focus. Returns
    /// `true` if the car was being driven and needs a neutral update.
    pub fn release_all(&mut self) -> bool {
        self.throttle_keys.clear();
        self.steering_keys.clear();
        self.toggle_keys.clear();
        let was_driving = self.throttle != Throttle::Stopped || self.steering != Steering::Straight;
        self.throttle = Throttle::Stopped;
        self.steering = Steering::Straight;
        was_driving
    }

    fn update_throttle(&mut self) -> Option<Intent> {
        let forward = self.throttle_keys.contains(&Key::W);
        let reverse = self.throttle_keys.contains(&Key::S);
        let next = match (forward, reverse) {
            (true, true) if self.last_throttle_key == Some(Key::W) => Throttle::Forward,
            (true, true) => Throttle::Reverse,
            (true, false) => Throttle::Forward,
            (false, true) => Throttle::Reverse,
            (false, false) => Throttle::Stopped,
        };
        if next == self.throttle {
            return None;
        }
        self.throttle = next;
        Some(Intent::Change(StateChange::throttle(next)))
    }

    fn update_steering(&mut self) -> Option<Intent> {
        let left = self.steering_keys.contains(&Key::A);
        let right = self.steering_keys.contains(&Key::D);
        let next = match (left, right) {
            (true, true) if self.last_steering_key == Some(Key::A) => Steering::Left,
            (true, true) => Steering::Right,
            (true, false) => Steering::Left,
            (false, true) => Steering::Right,
            (false, false) => Steering::Straight,
        };
        if next == self.steering {
            return None;
        }
        self.steering = next;
        Some(Intent::Change(StateChange::steering(next)))
    }

    fn toggle_intent(key: Key) -> Option<Intent> {
        let change = match key {
            Key::L => StateChange {
                lights: Some(FlagUpdate::Toggle),
                ..Default::default()
            },
            Key::T => StateChange {
                turbo: Some(FlagUpdate::Toggle),
                ..Default::default()
            },
            Key::O => StateChange {
                donut: Some(FlagUpdate::Toggle),
                ..Default::default()
            },
            Key::M => StateChange {
                mode: Some(ModeUpdate::Toggle),
                ..Default::default()
            },
            Key::B => return Some(Intent::RequestBattery),
            Key::Q => return Some(Intent::Quit),
            Key::R => return Some(Intent::Reconnect),
            Key::Plus => return Some(Intent::NextGamepad),
            Key::Minus => return Some(Intent::PreviousGamepad),
            Key::W | Key::S | Key::A | Key::D => return None,
        };
        Some(Intent::Change(change))
    }
}

/// Axis/trigger threshold past which an analog input counts as engaged.
pub const AXIS_THRESHOLD: f32 = 0.5;

/// One polled reading of the active gamepad, axes in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GamepadReading {
    pub throttle_axis: f32,
    pub steering_axis: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,
    pub button_a: bool,
    pub button_b: bool,
}

impl Default for GamepadReading {
    fn default() -> Self {
        Self {
            throttle_axis: 0.0,
            steering_axis: 0.0,
            left_trigger: -1.0,
            right_trigger: -1.0,
            button_a: false,
            button_b: false,
        }
    }
}

impl GamepadReading {
    /// Full drive update for this reading. Pushing the stick up (negative Y)
    /// drives forward; A/B override the stick.
    pub fn to_change(&self) -> StateChange {
        let mut throttle = if self.throttle_axis < -AXIS_THRESHOLD {
            Throttle::Forward
        } else if self.throttle_axis > AXIS_THRESHOLD {
            Throttle::Reverse
        } else {
            Throttle::Stopped
        };
        if self.button_b {
            throttle = Throttle::Reverse;
        } else if self.button_a {
            throttle = Throttle::Forward;
        }

        let steering = if self.steering_axis < -AXIS_THRESHOLD {
            Steering::Left
        } else if self.steering_axis > AXIS_THRESHOLD {
            Steering::Right
        } else {
            Steering::Straight
        };

        let turbo = self.left_trigger > -AXIS_THRESHOLD || self.right_trigger > -AXIS_THRESHOLD;

        StateChange {
            throttle: Some(throttle),
            steering: Some(steering),
            turbo: Some(FlagUpdate::Set(turbo)),
            ..Default::default()
        }
    }
}

/// Wrap a requested slot into the range of connected pads.
pub fn wrap_slot(slot: isize, count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    Some(slot.rem_euclid(count as isize) as usize)
}
