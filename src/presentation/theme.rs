use crate::domain::models::SessionPhase;
use eframe::egui;

pub struct RacingPalette {
    pub asphalt: egui::Color32,
    pub panel: egui::Color32,
    pub text: egui::Color32,
    pub muted: egui::Color32,
    pub shell_yellow: egui::Color32,
    pub shell_red: egui::Color32,
    pub go_green: egui::Color32,
}

impl Default for RacingPalette {
    fn default() -> Self {
        Self {
            asphalt: egui::Color32::from_rgb(18, 18, 22),
            panel: egui::Color32::from_rgb(32, 32, 38),
            text: egui::Color32::from_rgb(235, 235, 235),
            muted: egui::Color32::from_gray(180),
            shell_yellow: egui::Color32::from_rgb(255, 213, 0),
            shell_red: egui::Color32::from_rgb(221, 29, 33),
            go_green: egui::Color32::from_rgb(0, 200, 90),
        }
    }
}

impl RacingPalette {
    /// Banner text plus background/foreground colors for a session phase.
    pub fn phase_banner(&self, phase: SessionPhase) -> (&'static str, egui::Color32, egui::Color32) {
        match phase {
            SessionPhase::Connected => ("CONNECTED", self.go_green, egui::Color32::BLACK),
            SessionPhase::Connecting => ("CONNECTING...", self.shell_yellow, egui::Color32::BLACK),
            SessionPhase::Disconnecting => ("DISCONNECTING...", self.shell_yellow, egui::Color32::BLACK),
            SessionPhase::Idle | SessionPhase::Disconnected => {
                ("DISCONNECTED", self.shell_red, egui::Color32::WHITE)
            }
        }
    }
}

pub fn configure_racing_theme(ctx: &egui::Context) {
    let mut style = (*ctx.style()).clone();
    let palette = RacingPalette::default();

    style
        .text_styles
        .iter_mut()
        .for_each(|(text_style, font_id)| {
            font_id.size = match text_style {
                egui::TextStyle::Heading => 24.0,
                egui::TextStyle::Body | egui::TextStyle::Button => 16.0,
                _ => font_id.size,
            };
        });

    style.spacing.item_spacing = egui::vec2(10.0, 8.0);
    style.spacing.button_padding = egui::vec2(14.0, 8.0);

    style.visuals = egui::Visuals::dark();
    style.visuals.panel_fill = palette.asphalt;
    style.visuals.window_fill = palette.asphalt;
    style.visuals.override_text_color = Some(palette.text);

    style.visuals.widgets.noninteractive.bg_fill = palette.panel;
    style.visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, palette.muted);
    style.visuals.widgets.hovered.bg_fill = palette.shell_yellow;
    style.visuals.widgets.hovered.fg_stroke = egui::Stroke::new(1.0, egui::Color32::BLACK);
    style.visuals.widgets.active.bg_fill = palette.shell_red;
    style.visuals.selection.bg_fill = palette.shell_red;
    style.visuals.selection.stroke = egui::Stroke::new(1.0, palette.shell_yellow);

    ctx.set_style(style);
}
