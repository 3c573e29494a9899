use eframe::egui;

pub struct Components;

impl Components {
    pub fn card<R>(
        ui: &mut egui::Ui,
        title: &str,
        add_contents: impl FnOnce(&mut egui::Ui) -> R,
    ) -> R {
        let stroke = ui.style().visuals.widgets.noninteractive.bg_stroke;
        let bg = ui.style().visuals.widgets.noninteractive.bg_fill;

        egui::Frame::none()
            .inner_margin(egui::Margin::same(12.0))
            .rounding(egui::Rounding::same(4.0))
            .stroke(stroke)
            .fill(bg)
            .show(ui, |ui| {
                ui.set_width(ui.available_width());
                ui.label(egui::RichText::new(title).strong().size(17.0));
                ui.add_space(6.0);
                add_contents(ui)
            })
            .inner
    }

    pub fn status_banner(
        ui: &mut egui::Ui,
        text: &str,
        bg_color: egui::Color32,
        text_color: egui::Color32,
    ) {
        ui.add_sized(
            [ui.available_width(), 32.0],
            egui::Label::new(
                egui::RichText::new(text)
                    .color(text_color)
                    .background_color(bg_color)
                    .size(16.0)
                    .strong(),
            )
            .wrap_mode(egui::TextWrapMode::Extend),
        );
    }

    /// Two-column "Label: value" rows.
    pub fn readouts(ui: &mut egui::Ui, id: &str, rows: &[(&str, String)]) {
        egui::Grid::new(id)
            .num_columns(2)
            .spacing([24.0, 6.0])
            .show(ui, |ui| {
                for (label, value) in rows {
                    ui.label(format!("{}:", label));
                    ui.label(egui::RichText::new(value).strong());
                    ui.end_row();
                }
            });
    }
}
