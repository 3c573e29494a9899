//! Message-line texts for session events and local input.

use crate::domain::models::{ControlState, SessionEvent, StateChange};

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

/// Text shown for a session event, `None` for events with no message.
pub fn describe_event(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::Message(text) => text.clone(),
        SessionEvent::Warn(text) => format!("WARN: {}", text),
        SessionEvent::Error(text) => format!("ERROR: {}", text),
        SessionEvent::Battery(pct) => format!("Battery: {}%", pct),
        SessionEvent::Status(_) => "Status notification received".to_string(),
        SessionEvent::Payload(payload) => format!("Command sent: {}", hex::encode(payload)),
        SessionEvent::Connected => "Connected".to_string(),
        SessionEvent::Disconnected => "Disconnected".to_string(),
        SessionEvent::Shutdown => return None,
    };
    Some(text)
}

/// Describe the first field `change` would alter on top of `state`.
pub fn describe_change(state: &ControlState, change: &StateChange) -> Option<String> {
    let mut next = state.clone();
    if !next.apply(change) {
        return None;
    }
    let text = if next.throttle != state.throttle {
        next.throttle.to_string()
    } else if next.steering != state.steering {
        next.steering.to_string()
    } else if next.lights != state.lights {
        format!("Lights {}", on_off(next.lights))
    } else if next.turbo != state.turbo {
        format!("Turbo {}", on_off(next.turbo))
    } else if next.donut != state.donut {
        format!("Donut {}", on_off(next.donut))
    } else {
        format!("Mode set to {}", next.mode)
    };
    Some(text)
}

pub fn battery_label(state: &ControlState) -> String {
    state
        .battery_pct
        .map_or_else(|| "--".to_string(), |pct| format!("{}%", pct))
}

/// Decoded fields of the last status notification, or its hex when it could
/// not be decoded.
pub fn status_label(state: &ControlState) -> String {
    match &state.last_status {
        Some(record) => record.to_string(),
        None if !state.last_status_hex.is_empty() => state.last_status_hex.clone(),
        None => "--".to_string(),
    }
}
