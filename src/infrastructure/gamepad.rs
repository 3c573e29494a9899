//! Gamepad polling via gilrs.
//!
//! Only one pad drives at a time. The active pad is picked by slot index
//! into the currently connected pads, so unplugging one shifts the others.

use crate::domain::input::{wrap_slot, GamepadReading, Intent};
use crate::domain::models::{FlagUpdate, StateChange};
use gilrs::{Axis, Button, EventType, GamepadId, Gilrs};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GamepadError {
    #[error("gamepad backend unavailable: {0}")]
    Backend(String),
}

pub struct GamepadInput {
    gilrs: Gilrs,
    slot: usize,
    active: Option<GamepadId>,
    last_reading: Option<GamepadReading>,
}

impl GamepadInput {
    pub fn new(slot: usize) -> Result<Self, GamepadError> {
        let gilrs = Gilrs::new().map_err(|e| GamepadError::Backend(e.to_string()))?;
        let mut input = Self {
            gilrs,
            slot,
            active: None,
            last_reading: None,
        };
        input.resolve_active();
        Ok(input)
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Name of the pad currently driving, if any.
    pub fn active_name(&self) -> Option<String> {
        self.active
            .map(|id| self.gilrs.gamepad(id).name().to_string())
    }

    pub fn next(&mut self) -> usize {
        self.shift(1)
    }

    pub fn previous(&mut self) -> usize {
        self.shift(-1)
    }

    /// Drain pending gamepad events and turn the active pad's state into
    /// intents. Drive updates are only emitted when the reading changes.
    pub fn poll(&mut self) -> Vec<Intent> {
        let mut intents = Vec::new();
        let mut roster_changed = false;

        while let Some(event) = self.gilrs.next_event() {
            match event.event {
                EventType::Connected | EventType::Disconnected => roster_changed = true,
                EventType::ButtonPressed(Button::Select, _) if Some(event.id) == self.active => {
                    intents.push(Intent::Change(StateChange {
                        lights: Some(FlagUpdate::Toggle),
                        ..Default::default()
                    }));
                }
                _ => {}
            }
        }

        if roster_changed {
            self.resolve_active();
        }

        if let Some(reading) = self.reading() {
            if self.last_reading != Some(reading) {
                self.last_reading = Some(reading);
                intents.push(Intent::Change(reading.to_change()));
            }
        }
        intents
    }

    fn shift(&mut self, step: isize) -> usize {
        let count = self.connected().len();
        if let Some(slot) = wrap_slot(self.slot as isize + step, count) {
            self.slot = slot;
        }
        self.resolve_active();
        self.slot
    }

    fn connected(&self) -> Vec<GamepadId> {
        self.gilrs
            .gamepads()
            .filter(|(_, pad)| pad.is_connected())
            .map(|(id, _)| id)
            .collect()
    }

    fn resolve_active(&mut self) {
        let pads = self.connected();
        let active = wrap_slot(self.slot as isize, pads.len()).map(|index| pads[index]);
        if active != self.active {
            match active {
                Some(id) => info!(
                    "Gamepad slot {} -> {}",
                    self.slot,
                    self.gilrs.gamepad(id).name()
                ),
                None => debug!("No gamepad connected"),
            }
            self.active = active;
            self.last_reading = None;
        }
    }

    fn reading(&self) -> Option<GamepadReading> {
        let pad = self.gilrs.gamepad(self.active?);
        // Triggers report 0..1; remap to the -1..1 range the mapper expects.
        let trigger = |button| {
            pad.button_data(button)
                .map_or(-1.0, |data| data.value() * 2.0 - 1.0)
        };
        Some(GamepadReading {
            // gilrs reports stick up as positive.
            throttle_axis: -pad.value(Axis::RightStickY),
            steering_axis: pad.value(Axis::LeftStickX),
            left_trigger: trigger(Button::LeftTrigger2),
            right_trigger: trigger(Button::RightTrigger2),
            button_a: pad.is_pressed(Button::South),
            button_b: pad.is_pressed(Button::East),
        })
    }
}
