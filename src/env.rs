//! Well-known host input resources.
//!
//! Hosts feed the viewport size, clock and pointer state into the engine by
//! writing resources with conventional names. Programs that declare them
//! get the values; programs that don't are unaffected. Every write is
//! followed by a front-to-back sync so the values are identical on both
//! buffer sides.

use crate::engine::{Engine, ResourceFlags};

/// A snapshot of host state for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Inputs {
    pub time: f32,
    pub width: i32,
    pub height: i32,
    pub mouse_x: f32,
    pub mouse_y: f32,
    pub mouse_lmb: bool,
    pub mouse_rmb: bool,
}

/// Applies [`Inputs`] to an engine, tracking viewport changes across frames.
#[derive(Default)]
pub struct HostEnv {
    last: Option<Inputs>,
}

impl HostEnv {
    pub fn new() -> Self {
        HostEnv::default()
    }

    /// Write the input snapshot into the engine's well-known resources and
    /// resize screen-sized resources when the viewport changed.
    pub fn apply(&mut self, engine: &mut Engine, inputs: Inputs) {
        let resized = match self.last {
            Some(last) => last.width != inputs.width || last.height != inputs.height,
            None => true,
        };

        if resized {
            self.resize_screen_resources(engine, inputs.width, inputs.height);
            write_values(engine, "u_Resolution", &[inputs.width as f32, inputs.height as f32]);
            write_values(engine, "u_ResX", &[inputs.width as f32]);
            write_values(engine, "u_ResY", &[inputs.height as f32]);
            let aspect = if inputs.height != 0 {
                inputs.width as f32 / inputs.height as f32
            } else {
                1.0
            };
            write_values(engine, "u_Aspect", &[aspect]);
        }

        write_values(engine, "u_Time", &[inputs.time]);
        write_values(
            engine,
            "u_Mouse",
            &[
                inputs.mouse_x,
                inputs.mouse_y,
                if inputs.mouse_lmb { 1.0 } else { 0.0 },
                if inputs.mouse_rmb { 1.0 } else { 0.0 },
            ],
        );

        self.last = Some(inputs);
    }

    /// Screen-sized resources follow the viewport as `[height, width, c]`,
    /// keeping whatever channel count their descriptor already has.
    fn resize_screen_resources(&self, engine: &mut Engine, width: i32, height: i32) {
        let targets: Vec<(String, i32)> = engine
            .resource_descs()
            .filter(|(_, flags, _)| flags.contains(ResourceFlags::SCREEN_SIZE))
            .map(|(name, _, desc)| {
                let channels = if desc.ndim >= 1 {
                    desc.shape[desc.ndim as usize - 1].max(1)
                } else {
                    4
                };
                (name.to_owned(), channels)
            })
            .collect();

        for (name, channels) in targets {
            if !engine.resize_resource(&name, &[height, width, channels]) {
                log::warn!("failed to resize screen resource `{}`", name);
            }
        }
    }
}

/// Write `values` to the start of a resource, when it exists and is F32,
/// then sync both buffer sides.
fn write_values(engine: &mut Engine, name: &str, values: &[f32]) {
    let written = match engine.map_resource(name) {
        Some(mut view) => match view.f32_slice_mut() {
            Some(slice) => {
                let len = slice.len().min(values.len());
                slice[..len].copy_from_slice(&values[..len]);
                len > 0
            }
            None => false,
        },
        None => false,
    };
    if written {
        engine.sync_resource(name);
    }
}
