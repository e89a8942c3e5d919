//! Arm64 site encodings: `nop` vs `b <imm26>`
//!
//! Every Arm64 instruction is one aligned 32-bit word, and a single aligned
//! word store is fetch-atomic, so rewriting needs no stop-the-world pass -
//! only instruction-cache maintenance afterwards. The branch displacement is
//! a signed 26-bit word count (+/- 128 MiB), measured from the instruction
//! itself.

use crate::arch::{InstrSet, SiteCode, SiteState};
use crate::error::{PatchError, PatchResult};

/// Width of a patch site: one instruction word
pub const INSN_SIZE: usize = 4;

const NOP: u32 = 0xd503_201f;
const B_OPCODE: u32 = 0x1400_0000;

/// Reachable byte displacement: imm26 is a signed word count
const B_MAX_FWD: i64 = (1 << 27) - 4;
const B_MAX_BWD: i64 = -(1 << 27);

/// Arm64 patching strategy
pub struct Aarch64;

pub static AARCH64: Aarch64 = Aarch64;

impl InstrSet for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn site_width(&self) -> usize {
        INSN_SIZE
    }

    fn encode(&self, state: SiteState, site: usize, target: usize) -> PatchResult<SiteCode> {
        if site % INSN_SIZE != 0 {
            return Err(PatchError::Misaligned {
                what: "patch site",
                addr: site,
                align: INSN_SIZE,
            });
        }
        match state {
            SiteState::Unpatched => Ok(SiteCode::new(&NOP.to_le_bytes())),
            SiteState::Patched => {
                if target % INSN_SIZE != 0 {
                    return Err(PatchError::Misaligned {
                        what: "branch target",
                        addr: target,
                        align: INSN_SIZE,
                    });
                }
                let disp = (target as i64).wrapping_sub(site as i64);
                if !(B_MAX_BWD..=B_MAX_FWD).contains(&disp) {
                    return Err(PatchError::EncodingRange {
                        site,
                        target,
                        width: 26,
                    });
                }
                let imm26 = ((disp >> 2) as u32) & 0x03ff_ffff;
                Ok(SiteCode::new(&(B_OPCODE | imm26).to_le_bytes()))
            }
        }
    }

    fn requires_quiesce(&self) -> bool {
        false
    }
}
