//! The x64 emitter. Instructions are encoded with [iced_x86] and written *backwards*: each
//! instruction is placed immediately before the previously emitted one, so the last instruction
//! of a trace is emitted first. Branches are encoded by hand, since their targets are always
//! known (or patched) by the time they are emitted.

use byteorder::{ByteOrder, LittleEndian};
use iced_x86::{Code, Encoder, Formatter, IcedError, Instruction, MemoryOperand, NasmFormatter};
use strum::FromRepr;

use super::regalloc::Reg;
use crate::compile::{CompilationError, ResourceError};

/// Condition codes, numbered as in the low nibble of the `Jcc` opcodes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
pub(crate) enum Cond {
    O = 0,
    NO,
    B,
    AE,
    E,
    NE,
    BE,
    A,
    S,
    NS,
    P,
    NP,
    L,
    GE,
    LE,
    G,
}

impl Cond {
    /// The condition which holds exactly when `self` doesn't.
    pub(crate) fn negate(self) -> Cond {
        Cond::from_repr(self as u8 ^ 1).unwrap()
    }

    fn name(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::NO => "no",
            Cond::B => "b",
            Cond::AE => "ae",
            Cond::E => "e",
            Cond::NE => "ne",
            Cond::BE => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::NS => "ns",
            Cond::P => "p",
            Cond::NP => "np",
            Cond::L => "l",
            Cond::GE => "ge",
            Cond::LE => "le",
            Cond::G => "g",
        }
    }
}

/// `[base + disp]`.
pub(crate) fn mem(base: Reg, disp: i32) -> MemoryOperand {
    MemoryOperand::with_base_displ(base.to_reg64(), i64::from(disp))
}

/// Write the 32 bit displacement at `at` so that the branch it ends jumps to `target`.
///
/// The memory must be writable.
pub(crate) fn set_rel32(at: usize, target: usize) -> Result<(), CompilationError> {
    let rel = i32::try_from(target as i64 - (at as i64 + 4))
        .map_err(|_| CompilationError::from(ResourceError::McodeLimit))?;
    let buf = unsafe { std::slice::from_raw_parts_mut(at as *mut u8, 4) };
    LittleEndian::write_i32(buf, rel);
    Ok(())
}

/// Can a branch at `from` reach `to`?
pub(crate) fn in_rel32_range(from: usize, to: usize) -> bool {
    i32::try_from(to as i64 - from as i64).is_ok()
}

pub(crate) struct X64 {
    /// The lowest address code may be written to.
    limit: usize,
    /// The address of the most recently emitted instruction.
    pos: usize,
    /// A scratch encoding buffer used solely by [Self::push_inst] to avoid reallocations.
    enc: Encoder,
    /// Set to `None` if logging is not enabled.
    fmtr: Option<NasmFormatter>,
    /// If `Some(...)`, log instructions. Entries are in emission order, i.e. reversed.
    log: Option<Vec<String>>,
}

impl X64 {
    /// Emit code downwards from `top`, never going below `limit`. The memory must be writable.
    pub(crate) fn new(limit: usize, top: usize, log: bool) -> Self {
        let fmtr = if log {
            let mut fmtr = NasmFormatter::new();
            fmtr.options_mut().set_branch_leading_zeros(false);
            fmtr.options_mut().set_hex_prefix("0x");
            fmtr.options_mut().set_hex_suffix("");
            fmtr.options_mut().set_show_branch_size(false);
            fmtr.options_mut().set_space_after_operand_separator(true);
            Some(fmtr)
        } else {
            None
        };
        X64 {
            limit,
            pos: top,
            enc: Encoder::new(64),
            fmtr,
            log: if log { Some(Vec::new()) } else { None },
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, CompilationError> {
        if self.pos - self.limit < bytes.len() {
            return Err(ResourceError::McodeOverflow.into());
        }
        self.pos -= bytes.len();
        unsafe { (self.pos as *mut u8).copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        Ok(self.pos)
    }

    /// Push an icedx64 instruction. `op` must not be IP-relative.
    pub(crate) fn push_inst(
        &mut self,
        op: Result<Instruction, IcedError>,
    ) -> Result<(), CompilationError> {
        let inst = op.unwrap_or_else(|e| panic!("invalid instruction: {e}"));
        self.enc
            .encode(&inst, 0)
            .unwrap_or_else(|e| panic!("failed to encode {inst}: {e}"));
        let mut enc_buf = self.enc.take_buffer();
        let r = self.write(&enc_buf);
        enc_buf.clear();
        self.enc.set_buffer(enc_buf);
        r?;
        if let (Some(log), Some(fmtr)) = (&mut self.log, &mut self.fmtr) {
            let mut s = String::new();
            fmtr.format(&inst, &mut s);
            log.push(format!("  {s}"));
        }
        Ok(())
    }

    /// Add a comment to the log, placed before the next instruction emitted (in program order,
    /// after it).
    pub(crate) fn comment(&mut self, s: &str) {
        if let Some(log) = &mut self.log {
            log.push(format!("; {s}"));
        }
    }

    fn log_branch(&mut self, s: String) {
        if let Some(log) = &mut self.log {
            log.push(format!("  {s}"));
        }
    }

    /// Emit `jcc target`, returning the address of its displacement.
    pub(crate) fn jcc(&mut self, cc: Cond, target: usize) -> Result<usize, CompilationError> {
        let p = self.write(&[0x0F, 0x80 | cc as u8, 0, 0, 0, 0])?;
        set_rel32(p + 2, target)?;
        self.log_branch(format!("j{} {target:#x}", cc.name()));
        Ok(p + 2)
    }

    /// Emit `jmp target`, returning the address of its displacement.
    pub(crate) fn jmp(&mut self, target: usize) -> Result<usize, CompilationError> {
        let p = self.write(&[0xE9, 0, 0, 0, 0])?;
        set_rel32(p + 1, target)?;
        self.log_branch(format!("jmp {target:#x}"));
        Ok(p + 1)
    }

    /// Emit a `jmp` whose target is not yet known, returning the address of its displacement
    /// for [set_rel32].
    pub(crate) fn jmp_fixup(&mut self, what: &str) -> Result<usize, CompilationError> {
        let p = self.write(&[0xE9, 0, 0, 0, 0])?;
        self.log_branch(format!("jmp {what}"));
        Ok(p + 1)
    }

    /// Emit a short `jcc` to `target`, which must be within a few bytes.
    pub(crate) fn jcc_short(&mut self, cc: Cond, target: usize) -> Result<(), CompilationError> {
        let p = self.write(&[0x70 | cc as u8, 0])?;
        let rel = i8::try_from(target as i64 - (p as i64 + 2))
            .unwrap_or_else(|_| panic!("short branch out of range"));
        unsafe { *((p + 1) as *mut i8) = rel };
        self.log_branch(format!("j{} short {target:#x}", cc.name()));
        Ok(())
    }

    /// The log, in program order.
    pub(crate) fn take_log(&mut self) -> Option<String> {
        self.log.take().map(|mut log| {
            log.reverse();
            log.join("\n")
        })
    }

    // Common instruction forms.

    /// `mov d, s` for registers of the same class. Nothing is emitted if `d == s`.
    pub(crate) fn mov_rr(&mut self, d: Reg, s: Reg) -> Result<(), CompilationError> {
        if d == s {
            return Ok(());
        }
        match (d.is_fp(), s.is_fp()) {
            (false, false) => self.push_inst(Instruction::with2(
                Code::Mov_r64_rm64,
                d.to_reg64(),
                s.to_reg64(),
            )),
            (true, true) => self.push_inst(Instruction::with2(
                Code::Movaps_xmm_xmmm128,
                d.to_xmm(),
                s.to_xmm(),
            )),
            (true, false) => {
                self.push_inst(Instruction::with2(Code::Movq_xmm_rm64, d.to_xmm(), s.to_reg64()))
            }
            (false, true) => {
                self.push_inst(Instruction::with2(Code::Movq_rm64_xmm, d.to_reg64(), s.to_xmm()))
            }
        }
    }

    /// Load the 64 bits at `m` into `d`.
    pub(crate) fn load(&mut self, d: Reg, m: MemoryOperand) -> Result<(), CompilationError> {
        if d.is_fp() {
            self.push_inst(Instruction::with2(Code::Movsd_xmm_xmmm64, d.to_xmm(), m))
        } else {
            self.push_inst(Instruction::with2(Code::Mov_r64_rm64, d.to_reg64(), m))
        }
    }

    /// Store the low 64 bits of `s` to `m`.
    pub(crate) fn store(&mut self, m: MemoryOperand, s: Reg) -> Result<(), CompilationError> {
        if s.is_fp() {
            self.push_inst(Instruction::with2(Code::Movsd_xmmm64_xmm, m, s.to_xmm()))
        } else {
            self.push_inst(Instruction::with2(Code::Mov_rm64_r64, m, s.to_reg64()))
        }
    }

    /// `mov d, imm` for a general purpose register, using the shortest encoding. Never touches
    /// the flags.
    pub(crate) fn mov_ri(&mut self, d: Reg, imm: u64) -> Result<(), CompilationError> {
        debug_assert!(d.is_gp());
        if let Ok(x) = u32::try_from(imm) {
            self.push_inst(Instruction::with2(Code::Mov_r32_imm32, d.to_reg32(), x))
        } else if let Ok(x) = i32::try_from(imm as i64) {
            self.push_inst(Instruction::with2(Code::Mov_rm64_imm32, d.to_reg64(), x))
        } else {
            self.push_inst(Instruction::with2(Code::Mov_r64_imm64, d.to_reg64(), imm))
        }
    }

    /// Store the sign extended `imm` to the 64 bits at `m`.
    pub(crate) fn store_i32(&mut self, m: MemoryOperand, imm: i32) -> Result<(), CompilationError> {
        self.push_inst(Instruction::with2(Code::Mov_rm64_imm32, m, imm))
    }

    /// Store the 32 bits `imm` at `m`.
    pub(crate) fn store_u32(&mut self, m: MemoryOperand, imm: u32) -> Result<(), CompilationError> {
        self.push_inst(Instruction::with2(Code::Mov_rm32_imm32, m, imm))
    }

    /// A binary integer operation `code d, s` where `code` takes `r64, r/m64`.
    pub(crate) fn op_rr(&mut self, code: Code, d: Reg, s: Reg) -> Result<(), CompilationError> {
        self.push_inst(Instruction::with2(code, d.to_reg64(), s.to_reg64()))
    }

    /// A binary integer operation `code d, imm` where `code` takes `r/m64, imm32`.
    pub(crate) fn op_ri(&mut self, code: Code, d: Reg, imm: i32) -> Result<(), CompilationError> {
        self.push_inst(Instruction::with2(code, d.to_reg64(), imm))
    }

    /// A binary SSE operation `code d, s` where `code` takes `xmm, xmm/m64` (or `m128`).
    pub(crate) fn op_xx(&mut self, code: Code, d: Reg, s: Reg) -> Result<(), CompilationError> {
        self.push_inst(Instruction::with2(code, d.to_xmm(), s.to_xmm()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A heap buffer to emit into: tests only look at the bytes, never execute them.
    fn buf() -> Vec<u8> {
        vec![0xCC; 256]
    }

    fn emitted(b: &[u8], x: &X64) -> Vec<u8> {
        let start = x.pos() - b.as_ptr() as usize;
        b[start..].to_vec()
    }

    #[test]
    fn backwards() {
        let mut b = buf();
        let (lo, top) = (b.as_mut_ptr() as usize, b.as_mut_ptr() as usize + b.len());
        let mut x = X64::new(lo, top, false);
        // Emitted in reverse: the program is `mov eax, 1; ret`.
        x.push_inst(Ok(Instruction::with(Code::Retnq))).unwrap();
        x.mov_ri(Reg::RAX, 1).unwrap();
        assert_eq!(emitted(&b, &x), vec![0xB8, 1, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn branches() {
        let mut b = buf();
        let (lo, top) = (b.as_mut_ptr() as usize, b.as_mut_ptr() as usize + b.len());
        let mut x = X64::new(lo, top, false);
        // A jump to the end of the buffer from just below it.
        let d = x.jcc(Cond::NE, top).unwrap();
        assert_eq!(d, top - 4);
        assert_eq!(emitted(&b, &x), vec![0x0F, 0x85, 0, 0, 0, 0]);
        x.jmp(top).unwrap();
        assert_eq!(&emitted(&b, &x)[..5], &[0xE9, 6, 0, 0, 0]);
        x.jcc_short(Cond::P, top).unwrap();
        assert_eq!(&emitted(&b, &x)[..2], &[0x7A, 11]);
        assert_eq!(Cond::E.negate(), Cond::NE);
        assert_eq!(Cond::BE.negate(), Cond::A);
    }

    #[test]
    fn overflow() {
        let mut b = vec![0u8; 4];
        let (lo, top) = (b.as_mut_ptr() as usize, b.as_mut_ptr() as usize + b.len());
        let mut x = X64::new(lo, top, false);
        assert!(matches!(
            x.jmp(top),
            Err(CompilationError::ResourceExhausted(ResourceError::McodeOverflow))
        ));
    }

    #[test]
    fn immediates() {
        let mut b = buf();
        let (lo, top) = (b.as_mut_ptr() as usize, b.as_mut_ptr() as usize + b.len());
        let mut x = X64::new(lo, top, true);
        x.mov_ri(Reg::RCX, u64::MAX).unwrap();
        x.mov_ri(Reg::R9, 0x1234_5678_9abc).unwrap();
        x.store(mem(Reg::R14, -16), Reg::XMM1).unwrap();
        let log = x.take_log().unwrap();
        assert_eq!(
            log,
            "  movsd [r14-0x10], xmm1\n  mov r9, 0x123456789ABC\n  mov rcx, 0xFFFFFFFFFFFFFFFF"
        );
    }
}
