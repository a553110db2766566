//! The command token workers execute.
//!
//! The coordinator publishes exactly one [`Command`] per dispatch; workers
//! read it and never modify it.

use std::fmt;

use fields::BufferKey;

/// Operation requested from every device worker.
///
/// This is a closed set: external code can only ask for one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Dummy cycle.
    Idle,
    /// Compute particle hashes.
    CalcHash,
    /// Sort particles by hash.
    Sort,
    /// Drop particles that left the device's cells.
    Crop,
    /// Reorder particle data after sorting and find cell starts.
    Reorder,
    /// Build neighbor lists.
    BuildNeibs,
    /// Compute forces.
    Forces,
    /// Integrate one step.
    Euler,
    /// Download pos, vel and info to shared host arrays.
    Dump,
    /// Download cell starts and ends to shared host arrays.
    DumpCells,
    /// Download segments and update the number of internal particles.
    UpdateSegments,
    /// Append a copy of the external cells to the device arrays.
    AppendExternal,
    /// Refresh the read-only copy of the external cells.
    UpdateExternal,
    /// MLS density correction.
    Mls,
    /// Shepard density correction.
    Shepard,
    /// Vorticity computation.
    Vorticity,
    /// Free-surface detection, storing normals.
    SurfaceParticles,
    /// Update probe values.
    CalcProbes,
    /// Update test point values.
    CalcTestpoints,
    /// Initialize gamma and its gradient.
    MfInitGamma,
    /// Update gamma and its gradient.
    MfUpdateGamma,
    /// Update semi-analytical boundary particle positions.
    MfUpdatePos,
    /// Compute boundary conditions.
    MfCalcBoundConditions,
    /// Update boundary values.
    MfUpdateBoundValues,
    /// SPS stress tensor.
    Sps,
    /// Mean strain for k-epsilon viscosity.
    MeanStrain,
    /// Sum rigid-body forces per body.
    ReduceBodiesForces,
    /// Upload moving-boundary data.
    UploadMbData,
    /// Upload a new gravity value.
    UploadGravity,
    /// Upload planes.
    UploadPlanes,
    /// Upload object centers of gravity.
    UploadObjectsCg,
    /// Upload object translations and rotation matrices.
    UploadObjectsMatrices,
    /// Leave the simulation cycle.
    Quit,
}

impl CommandType {
    /// Whether the command rewrites per-device particle counts.
    pub fn updates_counts(self) -> bool {
        matches!(
            self,
            CommandType::Crop | CommandType::Reorder | CommandType::UpdateSegments
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags::bitflags! {
    /// Modifiers of a command: integrator step and buffer generation.
    ///
    /// Step flags grow from the bottom bit, generation selectors sit on the
    /// two highest bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u32 {
        /// Initialization step.
        const INITIALIZATION_STEP = 1 << 0;
        /// First integrator step (predictor).
        const INTEGRATOR_STEP_1 = 1 << 1;
        /// Second integrator step (corrector).
        const INTEGRATOR_STEP_2 = 1 << 2;
        /// Operate on the read generation.
        const DBLBUFFER_READ = 1 << 30;
        /// Operate on the write generation.
        const DBLBUFFER_WRITE = 1 << 31;
    }
}

impl CommandFlags {
    /// No flags.
    pub const NO_FLAGS: CommandFlags = CommandFlags::empty();

    /// The integrator step encoded in the flags, if any.
    pub fn step(self) -> Option<u8> {
        if self.contains(CommandFlags::INTEGRATOR_STEP_2) {
            Some(2)
        } else if self.contains(CommandFlags::INTEGRATOR_STEP_1) {
            Some(1)
        } else if self.contains(CommandFlags::INITIALIZATION_STEP) {
            Some(0)
        } else {
            None
        }
    }
}

/// Command token: operation, modifiers, buffers and scalar argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    /// Operation.
    pub kind: CommandType,
    /// Step and generation modifiers.
    pub flags: CommandFlags,
    /// Buffers the command applies to (dumps, uploads, swaps).
    pub buffers: BufferKey,
    /// Optional scalar argument (e.g. the timestep for `Euler`).
    pub extra_arg: Option<f32>,
    /// Restrict the command to internal particles.
    pub only_internal: bool,
}

impl Command {
    /// A command without flags, buffers or argument.
    pub fn new(kind: CommandType) -> Self {
        Self {
            kind,
            flags: CommandFlags::NO_FLAGS,
            buffers: BufferKey::empty(),
            extra_arg: None,
            only_internal: false,
        }
    }

    /// Set the flags.
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the buffers.
    pub fn with_buffers(mut self, buffers: BufferKey) -> Self {
        self.buffers = buffers;
        self
    }

    /// Set the scalar argument.
    pub fn with_arg(mut self, arg: f32) -> Self {
        self.extra_arg = Some(arg);
        self
    }

    /// Restrict to internal particles.
    pub fn internal_only(mut self) -> Self {
        self.only_internal = true;
        self
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::new(CommandType::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let cmd = Command::new(CommandType::Euler)
            .with_flags(CommandFlags::INTEGRATOR_STEP_1)
            .with_buffers(BufferKey::POS_VEL_INFO)
            .with_arg(1e-4)
            .internal_only();
        assert_eq!(cmd.kind, CommandType::Euler);
        assert_eq!(cmd.flags.step(), Some(1));
        assert_eq!(cmd.buffers, BufferKey::POS_VEL_INFO);
        assert_eq!(cmd.extra_arg, Some(1e-4));
        assert!(cmd.only_internal);
    }

    #[test]
    fn default_is_idle() {
        let cmd = Command::default();
        assert_eq!(cmd.kind, CommandType::Idle);
        assert_eq!(cmd.flags, CommandFlags::NO_FLAGS);
        assert_eq!(cmd.flags.step(), None);
        assert!(cmd.extra_arg.is_none());
    }

    #[test]
    fn step_prefers_latest() {
        let flags = CommandFlags::INTEGRATOR_STEP_1 | CommandFlags::INTEGRATOR_STEP_2;
        assert_eq!(flags.step(), Some(2));
        assert_eq!(CommandFlags::INITIALIZATION_STEP.step(), Some(0));
    }

    #[test]
    fn count_updating_commands() {
        assert!(CommandType::Reorder.updates_counts());
        assert!(!CommandType::Forces.updates_counts());
        assert_eq!(CommandType::DumpCells.to_string(), "DumpCells");
    }
}
