//! Entering and leaving compiled code.
//!
//! Every machine code area starts with two pieces of glue code:
//!
//!   * the *trampoline*, called from Rust with the [JitContext], the trace's base pointer and the
//!     address to jump to. It saves the callee-saved registers, sets up the trace's fixed
//!     registers ([CTX] and [BASE]) and jumps into the trace.
//!   * the *exit handler*, jumped to by every exit stub. It dumps all registers into the
//!     [JitContext], restores the callee-saved registers and returns to the trampoline's caller
//!     with the exit number in `eax`.
//!
//! An exit stub stores the exit number (trace number in the upper 16 bits, snapshot number in
//! the lower 16 bits) into [JitContext::exit] and jumps to the exit handler.

use iced_x86::{Code, Instruction};
use static_assertions::const_assert;
use std::mem::{self, offset_of};

use super::{
    asm::{
        regalloc::{Reg, BASE, CTX},
        x64::{mem, X64},
    },
    CompilationError,
};
use crate::vm::{heap::Heap, value::TValue};

/// The number of 64 bit spill slots available to a tree of traces.
pub(crate) const MAX_SPILL: usize = 256;

/// The state shared between Rust and running traces. Traces address it relative to [CTX].
#[repr(C)]
pub(crate) struct JitContext {
    /// General purpose registers at the last exit, in hardware order.
    pub(crate) gpr: [u64; 16],
    /// The low 64 bits of each XMM register at the last exit.
    pub(crate) fpr: [u64; 16],
    /// The exit number of the last exit.
    pub(crate) exit: u32,
    _pad: u32,
    /// The heap, passed to runtime calls which allocate.
    pub(crate) heap: *mut Heap,
    /// The address traces must not grow the stack beyond.
    pub(crate) stack_limit: usize,
    pub(crate) spill: [u64; MAX_SPILL],
}

pub(crate) const CTX_GPR: i32 = offset_of!(JitContext, gpr) as i32;
pub(crate) const CTX_FPR: i32 = offset_of!(JitContext, fpr) as i32;
pub(crate) const CTX_EXIT: i32 = offset_of!(JitContext, exit) as i32;
pub(crate) const CTX_HEAP: i32 = offset_of!(JitContext, heap) as i32;
pub(crate) const CTX_STACK_LIMIT: i32 = offset_of!(JitContext, stack_limit) as i32;
pub(crate) const CTX_SPILL: i32 = offset_of!(JitContext, spill) as i32;

const_assert!(mem::size_of::<TValue>() == 16);
const_assert!(offset_of!(JitContext, spill) + MAX_SPILL * 8 < i32::MAX as usize);

/// The displacement of spill slot `s` from [CTX].
pub(crate) fn spill_disp(s: u16) -> i32 {
    CTX_SPILL + i32::from(s) * 8
}

impl JitContext {
    pub(crate) fn new() -> Box<Self> {
        Box::new(JitContext {
            gpr: [0; 16],
            fpr: [0; 16],
            exit: 0,
            _pad: 0,
            heap: std::ptr::null_mut(),
            stack_limit: 0,
            spill: [0; MAX_SPILL],
        })
    }

    /// The value register `r` held at the last exit.
    pub(crate) fn reg(&self, r: Reg) -> u64 {
        if r.is_fp() {
            self.fpr[r.hw()]
        } else {
            self.gpr[r.hw()]
        }
    }
}

/// The entry points of an area's glue code.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Glue {
    pub(crate) trampoline: usize,
    pub(crate) handler: usize,
}

/// The callee-saved registers the trampoline preserves, in push order.
const SAVED: [Reg; 6] = [Reg::RBX, Reg::RBP, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Emit the trampoline and the exit handler.
pub(crate) fn emit_glue(x: &mut X64) -> Result<Glue, CompilationError> {
    // The handler. Everything is emitted backwards.
    x.push_inst(Ok(Instruction::with(Code::Retnq)))?;
    for r in SAVED {
        x.push_inst(Instruction::with1(Code::Pop_r64, r.to_reg64()))?;
    }
    x.op_ri(Code::Add_rm64_imm32, Reg::RSP, 8)?;
    x.push_inst(Instruction::with2(
        Code::Mov_r32_rm32,
        Reg::RAX.to_reg32(),
        mem(CTX, CTX_EXIT),
    ))?;
    for n in (0..16).rev() {
        x.store(mem(CTX, CTX_FPR + 8 * n as i32), Reg::fp(n))?;
    }
    for n in (0..16).rev() {
        let r = Reg::gp(n);
        if r != Reg::RSP {
            x.store(mem(CTX, CTX_GPR + 8 * n as i32), r)?;
        }
    }
    let handler = x.pos();

    // The trampoline: `extern "sysv64" fn(ctx, base, code) -> u64`.
    x.push_inst(Instruction::with1(Code::Jmp_rm64, Reg::RDX.to_reg64()))?;
    x.mov_rr(BASE, Reg::RSI)?;
    x.mov_rr(CTX, Reg::RDI)?;
    // Six pushes plus the return address leave the stack misaligned by 8.
    x.op_ri(Code::Sub_rm64_imm32, Reg::RSP, 8)?;
    for r in SAVED.iter().rev() {
        x.push_inst(Instruction::with1(Code::Push_r64, r.to_reg64()))?;
    }
    Ok(Glue {
        trampoline: x.pos(),
        handler,
    })
}

/// Emit the exit stub for `exitno`, returning its address.
pub(crate) fn emit_stub(x: &mut X64, exitno: u32, handler: usize) -> Result<usize, CompilationError> {
    x.jmp(handler)?;
    x.store_u32(mem(CTX, CTX_EXIT), exitno)?;
    Ok(x.pos())
}

/// The exit number of snapshot `snapno` of trace `traceno`.
pub(crate) fn exit_number(traceno: u16, snapno: usize) -> u32 {
    (u32::from(traceno) << 16) | snapno as u32
}

/// Split an exit number into trace and snapshot numbers.
pub(crate) fn split_exit(exitno: u64) -> (u16, usize) {
    ((exitno >> 16) as u16, (exitno & 0xffff) as usize)
}

type Trampoline = unsafe extern "sysv64" fn(*mut JitContext, *mut TValue, usize) -> u64;

/// Run the code at `code` with `base` as the trace's base pointer until it exits, returning the
/// exit number.
///
/// # Safety
///
/// `trampoline` must be the trampoline of a live code area and `code` the start of a trace which
/// expects `base`'s frame layout.
pub(crate) unsafe fn enter(
    trampoline: usize,
    ctx: &mut JitContext,
    base: *mut TValue,
    code: usize,
) -> u64 {
    let f = unsafe { mem::transmute::<usize, Trampoline>(trampoline) };
    unsafe { f(ctx as *mut JitContext, base, code) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(CTX_GPR, 0);
        assert_eq!(CTX_FPR, 128);
        assert_eq!(CTX_EXIT, 256);
        assert_eq!(CTX_HEAP, 264);
        assert_eq!(CTX_STACK_LIMIT, 272);
        assert_eq!(spill_disp(1), 288);
    }

    #[test]
    fn exit_numbers() {
        let e = exit_number(3, 17);
        assert_eq!(e, 0x30011);
        assert_eq!(split_exit(u64::from(e)), (3, 17));
    }

    #[test]
    fn context_registers() {
        let mut ctx = JitContext::new();
        ctx.gpr[Reg::R14.hw()] = 0x1000;
        ctx.fpr[Reg::XMM2.hw()] = 2.5f64.to_bits();
        assert_eq!(ctx.reg(Reg::R14), 0x1000);
        assert_eq!(f64::from_bits(ctx.reg(Reg::XMM2)), 2.5);
    }

    #[test]
    fn glue_is_logged_in_program_order() {
        let mut buf = vec![0u8; 512];
        let top = buf.as_mut_ptr() as usize + buf.len();
        let mut x = X64::new(buf.as_mut_ptr() as usize, top, true);
        let glue = emit_glue(&mut x).unwrap();
        assert!(glue.trampoline < glue.handler);
        let log = x.take_log().unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "  push rbx");
        assert_eq!(lines[6], "  sub rsp, 8");
        assert_eq!(lines[9], "  jmp rdx");
        assert_eq!(lines[lines.len() - 1], "  ret");
    }
}
