use crate::infrastructure::bluetooth::protocol::BleAddress;
use crate::infrastructure::bluetooth::scanner::DiscoveredDevice;
use crate::infrastructure::bluetooth::service::DiscoveryResult;
use crate::presentation::components::Components;
use eframe::egui;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

pub enum PickerAction {
    Rescan,
    Connect { name: String, address: BleAddress },
}

/// Device picker shown when no address was given up front.
pub struct PickerState {
    pub scan: Option<(oneshot::Receiver<DiscoveryResult>, CancellationToken)>,
    pub devices: Vec<DiscoveredDevice>,
    pub selected: Option<usize>,
    pub manual_address: String,
    pub last_address: Option<BleAddress>,
    pub error: Option<String>,
}

impl PickerState {
    pub fn new(last_address: Option<BleAddress>) -> Self {
        Self {
            scan: None,
            devices: Vec::new(),
            selected: None,
            manual_address: String::new(),
            last_address,
            error: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// Pick up a finished scan, if any.
    pub fn poll_scan(&mut self) {
        let Some((receiver, _)) = self.scan.as_mut() else {
            return;
        };
        let outcome = match receiver.try_recv() {
            Err(TryRecvError::Empty) => return,
            Ok(outcome) => outcome,
            Err(TryRecvError::Closed) => {
                self.scan = None;
                self.error = Some("Bluetooth scan failed: scanner stopped".to_string());
                return;
            }
        };
        self.scan = None;
        match outcome {
            Ok(devices) if devices.is_empty() => {
                self.devices.clear();
                self.selected = None;
                self.error = Some("No compatible cars found".to_string());
            }
            Ok(devices) => {
                self.devices = devices;
                self.selected = Some(0);
                self.error = None;
            }
            Err(e) => self.error = Some(format!("Bluetooth scan failed: {}", e)),
        }
    }

    pub fn cancel_scan(&mut self) {
        if let Some((_, cancel)) = self.scan.take() {
            cancel.cancel();
        }
    }
}

pub fn render(state: &mut PickerState, ui: &mut egui::Ui) -> Option<PickerAction> {
    let mut action = None;

    ui.heading("Select a car");
    ui.add_space(10.0);

    Components::card(ui, "Nearby cars", |ui| {
        if state.is_scanning() {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label("Scanning for Bluetooth devices...");
            });
        } else if state.devices.is_empty() {
            ui.label("No devices listed.");
        }

        for (index, device) in state.devices.iter().enumerate() {
            let text = format!(
                "{}  ({})  {} dBm",
                device.name, device.address, device.signal_strength
            );
            if ui
                .selectable_label(state.selected == Some(index), text)
                .clicked()
            {
                state.selected = Some(index);
            }
        }

        if let Some(error) = &state.error {
            ui.colored_label(egui::Color32::from_rgb(255, 90, 90), error);
        }

        ui.add_space(6.0);
        ui.horizontal(|ui| {
            let chosen = state.selected.and_then(|index| state.devices.get(index));
            if ui
                .add_enabled(chosen.is_some(), egui::Button::new("Connect"))
                .clicked()
            {
                if let Some(device) = chosen {
                    action = Some(PickerAction::Connect {
                        name: device.name.clone(),
                        address: device.address,
                    });
                }
            }
            if ui
                .add_enabled(!state.is_scanning(), egui::Button::new("Rescan"))
                .clicked()
            {
                action = Some(PickerAction::Rescan);
            }
        });
    });

    ui.add_space(10.0);

    Components::card(ui, "By address", |ui| {
        ui.horizontal(|ui| {
            ui.label("Address:");
            ui.text_edit_singleline(&mut state.manual_address);
            if ui.button("Connect").clicked() {
                match state.manual_address.parse::<BleAddress>() {
                    Ok(address) => {
                        action = Some(PickerAction::Connect {
                            name: "Unknown car".to_string(),
                            address,
                        })
                    }
                    Err(e) => state.error = Some(format!("Invalid address: {}", e)),
                }
            }
        });
        if let Some(address) = state.last_address {
            if ui.button(format!("Reconnect to last car ({})", address)).clicked() {
                action = Some(PickerAction::Connect {
                    name: "Last car".to_string(),
                    address,
                });
            }
        }
    });

    action
}
