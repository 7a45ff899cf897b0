//! Merging of adjacent small accesses into one wider access.
//!
//! Groups are formed greedily in program order. Members share op kind,
//! buffer and loop membership, touch contiguous elements, and are not
//! separated by any other access to their buffer. Merged loads take the
//! position of the first member and expose one output port per original
//! lane slice; merged stores take the position of the last member and
//! concatenate their inputs.

use std::collections::BTreeMap;

use super::MemoryAccessConfig;
use crate::error::{LoweredError, Result};
use crate::expression::{AccessDescriptor, Expression, LoopPort, PortConnector};
use crate::ids::{BufferId, ExprId};
use crate::op::{AccessKind, MemoryAccess};
use crate::program::LoweredProgram;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGroup {
    pub kind: AccessKind,
    pub buffer: BufferId,
    pub members: Vec<ExprId>,
}

struct OpenGroup {
    kind: AccessKind,
    loops: Vec<LoopPort>,
    next_offset: usize,
    width: usize,
    members: Vec<ExprId>,
}

/// Expressions eligible for coalescing: single-port loads narrower than the
/// coalescing size with unit stride (or a single element), and single-element
/// stores. Hinted accesses are left to their emitter.
pub fn find_small_accesses(program: &LoweredProgram, config: &MemoryAccessConfig) -> Vec<ExprId> {
    program
        .iter()
        .filter(|expr| small_access(expr, config).is_some())
        .map(|expr| expr.id)
        .collect()
}

fn small_access(expr: &Expression, config: &MemoryAccessConfig) -> Option<(AccessKind, BufferId, AccessDescriptor)> {
    let kind = expr.op.access_kind()?;
    let port = expr.primary_access()?;
    if expr.memory.len() != 1 || port.hint.is_some() {
        return None;
    }
    let access = port.access;
    if access.count == 0 || access.count >= config.min_coalesce_size {
        return None;
    }
    let eligible = match kind {
        AccessKind::Load => access.stride == 1 || access.count == 1,
        AccessKind::Store => access.count == 1,
        AccessKind::BroadcastLoad => false,
    };
    eligible.then_some((kind, port.buffer, access))
}

/// Greedy adjacency grouping; only groups of two or more members are returned.
pub fn group_adjacent_accesses(program: &LoweredProgram, config: &MemoryAccessConfig) -> Vec<AccessGroup> {
    let mut open: BTreeMap<BufferId, OpenGroup> = BTreeMap::new();
    let mut groups = Vec::new();

    for expr in program {
        if let Some((kind, buffer, access)) = small_access(expr, config) {
            let extends = open.get(&buffer).is_some_and(|group| {
                group.kind == kind
                    && group.loops == expr.loops
                    && group.next_offset == access.offset
                    && group.width + access.count <= config.min_coalesce_size
            });
            if extends {
                if let Some(group) = open.get_mut(&buffer) {
                    group.members.push(expr.id);
                    group.width += access.count;
                    group.next_offset += access.count;
                }
                continue;
            }
            if let Some(previous) = open.remove(&buffer) {
                close_group(buffer, previous, &mut groups);
            }
            open.insert(
                buffer,
                OpenGroup {
                    kind,
                    loops: expr.loops.clone(),
                    next_offset: access.offset + access.count,
                    width: access.count,
                    members: vec![expr.id],
                },
            );
            continue;
        }

        let touched: Vec<BufferId> = open
            .keys()
            .copied()
            .filter(|buffer| expr.touches_buffer(*buffer))
            .collect();
        for buffer in touched {
            if let Some(group) = open.remove(&buffer) {
                close_group(buffer, group, &mut groups);
            }
        }
    }

    for (buffer, group) in open {
        close_group(buffer, group, &mut groups);
    }
    groups
}

fn close_group(buffer: BufferId, group: OpenGroup, groups: &mut Vec<AccessGroup>) {
    if group.members.len() >= 2 {
        groups.push(AccessGroup {
            kind: group.kind,
            buffer,
            members: group.members,
        });
    }
}

/// Replace the members of `group` with one merged access.
pub fn coalesce_group(program: &mut LoweredProgram, group: &AccessGroup) -> Result<()> {
    let members: Vec<Expression> = group
        .members
        .iter()
        .map(|id| program.get(*id).cloned().ok_or(LoweredError::UnknownExpression(*id)))
        .collect::<Result<_>>()?;
    let (Some(first), Some(last)) = (members.first(), members.last()) else {
        return Ok(());
    };
    let offset = first.memory[0].access.offset;
    let width: usize = members.iter().map(|m| m.memory[0].access.count).sum();

    match group.kind {
        AccessKind::Load => {
            let mut merged = first.clone();
            merged.memory[0].access = AccessDescriptor::contiguous(width, offset);
            merged.outputs.clear();

            let mut remap = Vec::new();
            let mut lane_base = 0;
            for member in &members {
                let count = member.memory[0].access.count;
                for (port, out) in member.outputs.iter().enumerate() {
                    let lanes = out.lanes.clone().unwrap_or(0..count);
                    let mut shifted = out.clone();
                    shifted.lanes = Some(lane_base + lanes.start..lane_base + lanes.end);
                    remap.push((member.id, port, merged.outputs.len(), out.tensor));
                    merged.outputs.push(shifted);
                }
                lane_base += count;
            }

            let merged_id = merged.id;
            *program.get_mut(merged_id).ok_or(LoweredError::UnknownExpression(merged_id))? = merged;
            for (member, port, new_port, tensor) in remap {
                if member == merged_id {
                    continue;
                }
                program.replace_uses(
                    member,
                    port,
                    PortConnector {
                        producer: merged_id,
                        port: new_port,
                        tensor,
                    },
                );
            }
            for member in members.iter().skip(1) {
                program.remove(member.id)?;
            }
        }
        AccessKind::Store => {
            let mut merged = last.clone();
            merged.memory[0].access = AccessDescriptor::contiguous(width, offset);
            merged.inputs = members.iter().flat_map(|m| m.inputs.iter().copied()).collect();
            let merged_id = merged.id;
            *program.get_mut(merged_id).ok_or(LoweredError::UnknownExpression(merged_id))? = merged;
            for member in &members[..members.len() - 1] {
                program.remove(member.id)?;
            }
        }
        AccessKind::BroadcastLoad => {
            return Err(LoweredError::unsupported(first.id, "coalescing of broadcast loads"));
        }
    }
    Ok(())
}
