//! x86 (i386) instruction classification for trampolines
//!
//! Two questions are answered here about the probed instruction:
//! - which fixup its single-stepped copy needs to look as if it had run at
//!   the original address ([`Fixup`])
//! - whether its copy may be executed directly, with a jump back planted
//!   after it, instead of single-stepping ([`can_boost`])

/// Longest x86 instruction, and the number of bytes copied into a slot
pub const MAX_INSN_SIZE: usize = 16;

/// `int3`
pub const BREAKPOINT_INSN: u8 = 0xcc;

pub const RELATIVE_CALL_OPCODE: u8 = 0xe8;
pub const RELATIVE_JUMP_OPCODE: u8 = 0xe9;
pub const RELATIVE_JUMP_SIZE: usize = 5;

/// Trap flag in EFLAGS
pub const TF_MASK: u64 = 0x100;

/// Bitmap of boostable two-byte (0x0f xx) opcodes, one row of 16 per high nibble
const TWOBYTE_IS_BOOSTABLE: [u16; 16] = [
    0x034c, // 00: 02 03 06 08 09
    0x0000, // 10
    0x0000, // 20
    0x0000, // 30
    0xffff, // 40: cmovcc
    0x0000, // 50
    0xcfff, // 60
    0xc000, // 70
    0x0000, // 80: jcc rel32
    0xffff, // 90: setcc
    0xbb3b, // a0
    0xf8ff, // b0
    0xff03, // c0
    0xeeee, // d0
    0xbb26, // e0
    0x6eee, // f0
];

fn twobyte_is_boostable(opcode: u8) -> bool {
    let row = TWOBYTE_IS_BOOSTABLE[usize::from(opcode >> 4)];
    row & (1 << (opcode & 0x0f)) != 0
}

/// Legacy prefixes: segment overrides, operand/address size, lock, rep
fn is_prefix(byte: u8) -> bool {
    matches!(byte, 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3)
}

/// Opcode bytes after any legacy prefixes
#[must_use]
pub fn skip_prefixes(insn: &[u8]) -> &[u8] {
    let start = insn.iter().take_while(|b| is_prefix(**b)).count();
    &insn[start..]
}

/// The trampoline return address cannot be derived for a copied `call rel32`
#[must_use]
pub fn is_relative_call(insn: &[u8]) -> bool {
    insn.first() == Some(&RELATIVE_CALL_OPCODE)
}

/// Whether the copy of `insn` can run without single-stepping
#[must_use]
pub fn can_boost(insn: &[u8]) -> bool {
    let mut idx = 0;
    loop {
        if idx > MAX_INSN_SIZE - 1 {
            return false;
        }
        let Some(&opcode) = insn.get(idx) else {
            return false;
        };
        idx += 1;

        if opcode == 0x0f {
            if idx > MAX_INSN_SIZE - 1 {
                return false;
            }
            return insn.get(idx).is_some_and(|b| twobyte_is_boostable(*b));
        }

        match opcode & 0xf0 {
            0x60 => {
                if (0x64..0x67).contains(&opcode) {
                    continue; // fs/gs override, operand size
                }
                // address-size override and bound are not
                return opcode != 0x62 && opcode != 0x67;
            }
            // conditional jumps
            0x70 => return false,
            // software interrupts are not; ret imm16 .. int3 and iret are
            0xc0 => return (0xc2..0xcc).contains(&opcode) || opcode == 0xcf,
            // AAM, AAD, XLAT
            0xd0 => return matches!(opcode, 0xd4 | 0xd5 | 0xd7),
            // in/out and far jmp
            0xe0 => return opcode & 0x04 != 0 || opcode == 0xea,
            0xf0 => {
                if opcode & 0x0c == 0 && opcode != 0xf1 {
                    continue; // lock, repne, rep
                }
                // cmc and flag set/clear
                return opcode == 0xf5 || (0xf8..0xfe).contains(&opcode);
            }
            _ => {
                if matches!(opcode, 0x26 | 0x36 | 0x3e) {
                    continue; // segment overrides
                }
                // cs override and far call
                return opcode != 0x2e && opcode != 0x9a;
            }
        }
    }
}

/// Correction applied after the copy at the slot has been single-stepped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// `pushfl`: the pushed flags carry our TF and must be cleaned
    PushFlags,
    /// `ret`, `lret`, `iret`, `jmp far`: IP is already the real target
    IpAbsolute,
    /// `call rel32`: return address and IP both relative to the copy
    CallRelative,
    /// `call far`: return address relative to the copy, IP absolute
    CallAbsolute,
    /// `call *r/m`: return address relative to the copy, IP absolute
    CallIndirect,
    /// `jmp *r/m` (near or far): IP absolute
    JmpIndirect,
    /// Fall-through or relative branch: IP relative to the copy
    Default,
}

impl Fixup {
    #[must_use]
    pub fn classify(insn: &[u8]) -> Self {
        let opcodes = skip_prefixes(insn);
        match opcodes {
            [0x9c, ..] => Fixup::PushFlags,
            [0xc2 | 0xc3 | 0xca | 0xcb | 0xcf | 0xea, ..] => Fixup::IpAbsolute,
            [RELATIVE_CALL_OPCODE, ..] => Fixup::CallRelative,
            [0x9a, ..] => Fixup::CallAbsolute,
            [0xff, modrm, ..] if modrm & 0x30 == 0x10 => Fixup::CallIndirect,
            [0xff, modrm, ..] if modrm & 0x31 == 0x20 || modrm & 0x31 == 0x21 => {
                Fixup::JmpIndirect
            }
            _ => Fixup::Default,
        }
    }

    /// The instruction itself transfers control to the right place
    #[must_use]
    pub fn ip_is_absolute(self) -> bool {
        !matches!(self, Fixup::PushFlags | Fixup::CallRelative | Fixup::Default)
    }
}

/// Encode `jmp rel32` placed at `from` landing on `to`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn jmp_op(from: u64, to: u64) -> [u8; RELATIVE_JUMP_SIZE] {
    let rel = to.wrapping_sub(from.wrapping_add(RELATIVE_JUMP_SIZE as u64)) as u32;
    let mut op = [0u8; RELATIVE_JUMP_SIZE];
    op[0] = RELATIVE_JUMP_OPCODE;
    op[1..].copy_from_slice(&rel.to_le_bytes());
    op
}
