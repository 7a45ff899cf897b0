//! Runtime shape lookup.

use crate::error::{LoweredError, Result};
use crate::ids::BufferId;
use crate::program::{LoopInfo, WorkAmount};
use std::collections::BTreeMap;

/// Concrete dimensions of buffers for one inference call.
pub trait ShapeContext {
    fn dims(&self, buffer: BufferId) -> Option<&[usize]>;

    fn element_count(&self, buffer: BufferId) -> Option<usize> {
        self.dims(buffer).map(|dims| dims.iter().product())
    }
}

pub type ShapeMap = BTreeMap<BufferId, Vec<usize>>;

impl ShapeContext for ShapeMap {
    fn dims(&self, buffer: BufferId) -> Option<&[usize]> {
        self.get(&buffer).map(Vec::as_slice)
    }
}

/// Number of iterations a loop runs for the given shapes.
pub fn trip_count(info: &LoopInfo, shapes: &dyn ShapeContext) -> Result<usize> {
    let work = match info.work_amount {
        WorkAmount::Static(n) => n,
        WorkAmount::Elements(buffer) => shapes.element_count(buffer).ok_or(LoweredError::MissingBuffer(buffer))?,
    };
    if info.increment == 0 {
        return Ok(0);
    }
    Ok(work / info.increment)
}
