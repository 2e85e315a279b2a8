//! Output registry: a passive table mirroring the compositor's wl_outputs.

use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};

use crate::state::State;

#[derive(Debug)]
pub struct OutputEntry {
    /// Registry global name, used for removal matching.
    pub global_name: u32,
    pub output: WlOutput,
    pub name: String,
    /// Refresh rate in Hz.
    pub refresh: u32,
    pub transform: wl_output::Transform,
}

#[derive(Debug, Default)]
pub struct OutputRegistry {
    pub outputs: Vec<OutputEntry>,
}

impl OutputRegistry {
    pub fn add(&mut self, global_name: u32, output: WlOutput) {
        self.outputs.push(OutputEntry {
            global_name,
            output,
            name: String::new(),
            refresh: 60,
            transform: wl_output::Transform::Normal,
        });
    }

    pub fn remove_global(&mut self, global_name: u32) {
        self.outputs.retain(|entry| {
            if entry.global_name == global_name {
                entry.output.release();
                false
            } else {
                true
            }
        });
    }

    pub fn by_name(&self, name: &str) -> Option<&OutputEntry> {
        self.outputs.iter().find(|entry| entry.name == name)
    }

    fn entry_mut(&mut self, output: &WlOutput) -> Option<&mut OutputEntry> {
        self.outputs.iter_mut().find(|entry| entry.output.id() == output.id())
    }
}

impl Dispatch<WlOutput, u32> for State {
    fn event(
        state: &mut Self,
        output: &WlOutput,
        event: wl_output::Event,
        _global_name: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.wayland.outputs.entry_mut(output) else {
            return;
        };

        match event {
            wl_output::Event::Name { name } => {
                tracing::debug!(output = %name, "found output");
                entry.name = name;
            }
            wl_output::Event::Mode { refresh, .. } => {
                // wl_output reports mHz.
                entry.refresh = ((refresh as u32) + 500) / 1000;
            }
            wl_output::Event::Geometry { transform, .. } => {
                if let WEnum::Value(transform) = transform {
                    entry.transform = transform;
                }
            }
            _ => {}
        }
    }
}
