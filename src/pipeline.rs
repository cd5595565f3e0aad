//! Explicit pipeline descriptions.
//!
//! A pipeline names the blackboard resources up front and lists the kernels
//! to schedule, optionally overriding the symbol auto-match with per-port
//! bindings. Hosts usually build this from the cartridge's pipeline section;
//! the engine only cares about the structs below.

use crate::buffer::DType;
use crate::engine::ResourceFlags;

/// Declares one blackboard resource.
#[derive(Clone, Debug)]
pub struct PipelineResource {
    pub name: String,
    /// Optional external source feeding the resource (an asset name).
    pub provider: Option<String>,
    pub dtype: DType,
    pub shape: Vec<i32>,
    pub flags: ResourceFlags,
}

impl PipelineResource {
    pub fn new(name: &str, dtype: DType, shape: &[i32], flags: ResourceFlags) -> Self {
        PipelineResource {
            name: name.to_owned(),
            provider: None,
            dtype,
            shape: shape.to_vec(),
            flags,
        }
    }
}

/// Maps a kernel's symbol (port) onto a named resource, overriding the
/// match-by-name rule.
#[derive(Clone, Debug)]
pub struct PortBinding {
    pub port: String,
    pub resource: String,
}

/// One scheduled execution unit.
#[derive(Clone, Debug)]
pub struct PipelineKernel {
    pub id: String,
    /// Dispatches per frame; 0 is treated as 1.
    pub frequency: u32,
    pub bindings: Vec<PortBinding>,
}

impl PipelineKernel {
    pub fn new(id: &str) -> Self {
        PipelineKernel {
            id: id.to_owned(),
            frequency: 1,
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, port: &str, resource: &str) -> Self {
        self.bindings.push(PortBinding {
            port: port.to_owned(),
            resource: resource.to_owned(),
        });
        self
    }
}

/// The complete pipeline configuration handed to [`crate::Engine::bind_pipeline`].
#[derive(Clone, Debug, Default)]
pub struct PipelineDesc {
    pub resources: Vec<PipelineResource>,
    pub kernels: Vec<PipelineKernel>,
}
