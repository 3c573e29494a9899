use crate::domain::input::{Intent, Key, KeyboardMapper};
use crate::domain::models::{SessionEvent, SessionSnapshot, StateChange};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::event_bus::EventReceiver;
use crate::infrastructure::bluetooth::protocol::BleAddress;
use crate::infrastructure::bluetooth::session::SessionHandle;
use crate::infrastructure::bluetooth::BluetoothService;
use crate::infrastructure::gamepad::GamepadInput;
use crate::presentation::messages::{describe_change, describe_event};
use crate::presentation::screens::dashboard::{self, DashboardView};
use crate::presentation::screens::picker::{self, PickerAction, PickerState};
use crate::presentation::theme::configure_racing_theme;
use eframe::egui;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// ~60 Hz
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

fn map_key(key: egui::Key) -> Option<Key> {
    let key = match key {
        egui::Key::W => Key::W,
        egui::Key::S => Key::S,
        egui::Key::A => Key::A,
        egui::Key::D => Key::D,
        egui::Key::L => Key::L,
        egui::Key::T => Key::T,
        egui::Key::O => Key::O,
        egui::Key::M => Key::M,
        egui::Key::B => Key::B,
        egui::Key::Q => Key::Q,
        egui::Key::R => Key::R,
        egui::Key::Plus | egui::Key::Equals => Key::Plus,
        egui::Key::Minus => Key::Minus,
        _ => return None,
    };
    Some(key)
}

fn gamepad_message(pad: &GamepadInput) -> String {
    match pad.active_name() {
        Some(name) => format!("Using gamepad {}: {}", pad.slot() + 1, name),
        None => "No controllers detected".to_string(),
    }
}

/// A car being driven, or the remains of the last session until reconnect.
struct Drive {
    target_name: String,
    address: BleAddress,
    handle: SessionHandle,
    events: EventReceiver,
    snapshot: SessionSnapshot,
    finished: bool,
}

enum Screen {
    Picker(PickerState),
    Driving(Drive),
}

pub struct RacingApp {
    settings: SettingsService,
    service: Option<BluetoothService>,
    screen: Screen,
    keyboard: KeyboardMapper,
    gamepad: Option<GamepadInput>,
    message: String,
    scan_window: Duration,
    quitting: bool,
}

impl RacingApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        settings: SettingsService,
        service: BluetoothService,
        target: Option<BleAddress>,
        scan_window: Duration,
    ) -> Self {
        configure_racing_theme(&cc.egui_ctx);

        let (gamepad, message) = match GamepadInput::new(settings.get().gamepad_slot) {
            Ok(pad) => {
                let message = gamepad_message(&pad);
                (Some(pad), message)
            }
            Err(e) => {
                warn!("{}", e);
                (None, format!("Gamepad init failed: {}", e))
            }
        };

        let last_address = settings
            .get()
            .last_connected_address
            .as_deref()
            .and_then(|address| address.parse().ok());

        let mut app = Self {
            settings,
            service: Some(service),
            screen: Screen::Picker(PickerState::new(last_address)),
            keyboard: KeyboardMapper::new(),
            gamepad,
            message,
            scan_window,
            quitting: false,
        };

        match target {
            Some(address) => app.start_session("Unknown car".to_string(), address),
            None => app.start_scan(),
        }
        app
    }

    fn start_scan(&mut self) {
        let (Some(service), Screen::Picker(picker)) = (&self.service, &mut self.screen) else {
            return;
        };
        picker.cancel_scan();
        let cancel = CancellationToken::new();
        let reply = service.discover(
            self.scan_window,
            self.settings.get().name_filters.clone(),
            cancel.clone(),
        );
        picker.error = None;
        picker.scan = Some((reply, cancel));
    }

    fn start_session(&mut self, target_name: String, address: BleAddress) {
        let Some(service) = &self.service else {
            return;
        };
        if let Screen::Picker(picker) = &mut self.screen {
            picker.cancel_scan();
        }

        info!("Starting session for {} ({})", target_name, address);
        let (handle, events) = service.connect(address, self.settings.get());
        self.keyboard.release_all();
        self.screen = Screen::Driving(Drive {
            target_name,
            address,
            snapshot: handle.snapshot(),
            handle,
            events,
            finished: false,
        });
    }

    /// Fold queued session events into the message line and refresh the
    /// snapshot.
    fn pump_events(&mut self) {
        let Screen::Driving(drive) = &mut self.screen else {
            return;
        };

        for event in drive.events.drain() {
            match &event {
                SessionEvent::Connected => {
                    if let Err(e) = self.settings.remember_address(&drive.address.to_string()) {
                        warn!("Failed to save last address: {}", e);
                    }
                }
                SessionEvent::Shutdown => drive.finished = true,
                SessionEvent::Disconnected if self.quitting => continue,
                _ => {}
            }
            if let Some(text) = describe_event(&event) {
                self.message = text;
            }
        }
        drive.snapshot = drive.handle.snapshot();
    }

    fn collect_intents(&mut self, ctx: &egui::Context) -> Vec<Intent> {
        let mut intents = Vec::new();

        if matches!(self.screen, Screen::Driving(_)) {
            let events = ctx.input(|i| i.events.clone());
            for event in events {
                match event {
                    egui::Event::Key {
                        key,
                        pressed,
                        repeat,
                        ..
                    } => {
                        let Some(key) = map_key(key) else {
                            continue;
                        };
                        let intent = match (pressed, repeat) {
                            (true, false) => self.keyboard.key_down(key),
                            (true, true) => None,
                            (false, _) => self.keyboard.key_up(key),
                        };
                        intents.extend(intent);
                    }
                    egui::Event::WindowFocused(false) => {
                        if self.keyboard.release_all() {
                            intents.push(Intent::Change(StateChange::neutral()));
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(pad) = self.gamepad.as_mut() {
            intents.extend(pad.poll());
        }
        intents
    }

    fn handle_intent(&mut self, intent: Intent, ctx: &egui::Context) {
        match intent {
            Intent::Quit => self.begin_quit(ctx),
            Intent::NextGamepad | Intent::PreviousGamepad => self.switch_gamepad(intent),
            Intent::Reconnect => {
                let Screen::Driving(drive) = &self.screen else {
                    return;
                };
                if !drive.finished || self.quitting {
                    return;
                }
                let (name, address) = (drive.target_name.clone(), drive.address);
                self.start_session(name, address);
            }
            Intent::Change(change) => {
                let Screen::Driving(drive) = &self.screen else {
                    return;
                };
                if self.quitting {
                    return;
                }
                if let Some(text) = describe_change(&drive.snapshot.state, &change) {
                    self.message = text;
                }
                drive.handle.submit_state_change(change);
            }
            Intent::RequestBattery => {
                if let Screen::Driving(drive) = &self.screen {
                    self.message = "Battery refresh requested".to_string();
                    drive.handle.request_battery();
                }
            }
        }
    }

    fn switch_gamepad(&mut self, intent: Intent) {
        let Some(pad) = self.gamepad.as_mut() else {
            self.message = "No controllers detected".to_string();
            return;
        };
        let slot = if intent == Intent::NextGamepad {
            pad.next()
        } else {
            pad.previous()
        };
        self.message = gamepad_message(pad);

        self.settings.get_mut().gamepad_slot = slot;
        if let Err(e) = self.settings.save() {
            warn!("Failed to save gamepad slot: {}", e);
        }
    }

    /// Neutral first, then stop. The window closes once the session has
    /// finished its teardown.
    fn begin_quit(&mut self, ctx: &egui::Context) {
        if self.quitting {
            return;
        }
        self.quitting = true;

        match &self.screen {
            Screen::Driving(drive) if !drive.finished => {
                info!("Quit requested, stopping the car");
                drive.handle.submit_state_change(StateChange::neutral());
                drive.handle.stop();
                self.message = "Stopping...".to_string();
            }
            Screen::Picker(_) | Screen::Driving(_) => {
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
        }
    }

    fn ready_to_close(&self) -> bool {
        match &self.screen {
            Screen::Picker(_) => true,
            Screen::Driving(drive) => drive.finished,
        }
    }

    fn shutdown(&mut self) {
        if let Screen::Driving(drive) = &self.screen {
            drive.handle.stop();
        }
        if let Screen::Picker(picker) = &mut self.screen {
            picker.cancel_scan();
        }
        if let Some(service) = self.service.take() {
            service.shutdown();
        }
    }
}

impl eframe::App for RacingApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.viewport().close_requested()) && !self.ready_to_close() {
            ctx.send_viewport_cmd(egui::ViewportCommand::CancelClose);
            self.begin_quit(ctx);
        }

        if let Screen::Picker(picker) = &mut self.screen {
            picker.poll_scan();
        }
        self.pump_events();

        for intent in self.collect_intents(ctx) {
            self.handle_intent(intent, ctx);
        }

        let mut picker_action = None;
        let mut dashboard_intent = None;
        egui::CentralPanel::default().show(ctx, |ui| match &mut self.screen {
            Screen::Picker(picker) => picker_action = picker::render(picker, ui),
            Screen::Driving(drive) => {
                let view = DashboardView {
                    target_name: &drive.target_name,
                    address: drive.address,
                    snapshot: &drive.snapshot,
                    gamepad_slot: self.gamepad.as_ref().map_or(0, |pad| pad.slot()),
                    gamepad_name: self.gamepad.as_ref().and_then(|pad| pad.active_name()),
                    message: &self.message,
                };
                dashboard_intent = dashboard::render(&view, ui);
            }
        });

        match picker_action {
            Some(PickerAction::Rescan) => self.start_scan(),
            Some(PickerAction::Connect { name, address }) => self.start_session(name, address),
            None => {}
        }
        if let Some(intent) = dashboard_intent {
            self.handle_intent(intent, ctx);
        }

        if self.quitting && self.ready_to_close() {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        ctx.request_repaint_after(FRAME_INTERVAL);
    }
}

impl Drop for RacingApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(map_key(egui::Key::W), Some(Key::W));
        assert_eq!(map_key(egui::Key::Equals), Some(Key::Plus));
        assert_eq!(map_key(egui::Key::Minus), Some(Key::Minus));
        assert_eq!(map_key(egui::Key::Z), None);
    }
}
