//! x86-64 site encodings: 5-byte no-op vs `jmp rel32`
//!
//! Both forms occupy exactly [`JMP32_SIZE`] bytes. The jump displacement is
//! signed 32-bit, measured from the end of the instruction.

use crate::arch::{InstrSet, SiteCode, SiteState};
use crate::error::{PatchError, PatchResult};

/// Width of a patch site: `jmp rel32` and the matching no-op filler
pub const JMP32_SIZE: usize = 5;

/// `nopl 0x0(%rax,%rax,1)` - the canonical 5-byte filler
const BYTES_NOP5: [u8; JMP32_SIZE] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

/// Opcode of the 32-bit-displacement unconditional jump
const JMP32_OPCODE: u8 = 0xe9;

/// x86-64 patching strategy
///
/// `fetch_atomic` reflects whether the hardware guarantees that another core
/// concurrently fetching the site observes either the old or the new
/// instruction, never a mix. Without that guarantee the engine quiesces all
/// other execution units around the write.
pub struct X86_64 {
    fetch_atomic: bool,
}

/// x86-64 with fast-patching hardware support: plain overwrite, no quiesce
pub static X86_64_FETCH_ATOMIC: X86_64 = X86_64 { fetch_atomic: true };

/// x86-64 without fetch atomicity: every patch pays a stop-the-world pass
pub static X86_64_STOP_MACHINE: X86_64 = X86_64 {
    fetch_atomic: false,
};

impl InstrSet for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn site_width(&self) -> usize {
        JMP32_SIZE
    }

    fn encode(&self, state: SiteState, site: usize, target: usize) -> PatchResult<SiteCode> {
        match state {
            SiteState::Unpatched => Ok(SiteCode::new(&BYTES_NOP5)),
            SiteState::Patched => {
                // Displacement is relative to the next instruction
                let next = site.wrapping_add(JMP32_SIZE);
                let disp = (target as i64).wrapping_sub(next as i64);
                let disp = i32::try_from(disp).map_err(|_| PatchError::EncodingRange {
                    site,
                    target,
                    width: 32,
                })?;

                let mut code = [JMP32_OPCODE, 0, 0, 0, 0];
                code[1..].copy_from_slice(&disp.to_le_bytes());
                Ok(SiteCode::new(&code))
            }
        }
    }

    fn requires_quiesce(&self) -> bool {
        !self.fetch_atomic
    }
}
