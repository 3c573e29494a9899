use crate::domain::input::Intent;
use crate::domain::models::{SessionPhase, SessionSnapshot};
use crate::infrastructure::bluetooth::protocol::BleAddress;
use crate::presentation::components::Components;
use crate::presentation::messages::{battery_label, status_label};
use crate::presentation::theme::RacingPalette;
use eframe::egui;

const KEY_HELP: &[&str] = &[
    "[W]/[S]: throttle, [A]/[D]: steering, [L]: lights, [T]: turbo",
    "[O]: donut, [M]: mode, [B]: battery, [R]: reconnect, [Q]: quit, [+]/[-]: switch controller",
    "Left stick: steering, Right stick/A & B: throttle, BACK: lights, RT/LT: turbo",
];

pub struct DashboardView<'a> {
    pub target_name: &'a str,
    pub address: BleAddress,
    pub snapshot: &'a SessionSnapshot,
    pub gamepad_slot: usize,
    pub gamepad_name: Option<String>,
    pub message: &'a str,
}

fn on_off(value: bool) -> String {
    let text = if value { "ON" } else { "OFF" };
    text.to_string()
}

pub fn render(view: &DashboardView<'_>, ui: &mut egui::Ui) -> Option<Intent> {
    let palette = RacingPalette::default();
    let state = &view.snapshot.state;
    let mut intent = None;

    let (banner, bg, fg) = palette.phase_banner(view.snapshot.phase);
    Components::status_banner(ui, banner, bg, fg);
    ui.add_space(8.0);

    Components::card(ui, "Car", |ui| {
        Components::readouts(
            ui,
            "car_readouts",
            &[
                ("Target", format!("{} ({})", view.target_name, view.address)),
                ("Battery", battery_label(state)),
                ("Throttle", state.throttle.to_string()),
                ("Steering", state.steering.to_string()),
                ("Lights", on_off(state.lights)),
                ("Turbo", on_off(state.turbo)),
                ("Donut", on_off(state.donut)),
                ("Mode", state.mode.to_string()),
                ("Last status", status_label(state)),
            ],
        );
    });

    ui.add_space(8.0);

    Components::card(ui, "Controller", |ui| {
        Components::readouts(
            ui,
            "pad_readouts",
            &[
                ("Using gamepad slot", (view.gamepad_slot + 1).to_string()),
                (
                    "Gamepad",
                    view.gamepad_name.clone().unwrap_or_else(|| "None".to_string()),
                ),
            ],
        );
    });

    ui.add_space(8.0);
    let message = if view.message.is_empty() { "--" } else { view.message };
    ui.label(
        egui::RichText::new(format!("Message: {}", message))
            .color(palette.shell_yellow)
            .strong(),
    );

    ui.add_space(8.0);
    ui.horizontal(|ui| {
        let disconnected = view.snapshot.phase == SessionPhase::Disconnected;
        if ui
            .add_enabled(disconnected, egui::Button::new("Reconnect"))
            .clicked()
        {
            intent = Some(Intent::Reconnect);
        }
        if ui.button("Quit").clicked() {
            intent = Some(Intent::Quit);
        }
    });

    ui.with_layout(egui::Layout::bottom_up(egui::Align::LEFT), |ui| {
        for line in KEY_HELP.iter().rev() {
            ui.label(egui::RichText::new(*line).small().color(palette.muted));
        }
    });

    intent
}
