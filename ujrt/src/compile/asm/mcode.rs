//! Machine code memory.
//!
//! Code lives in areas of `sizemcode` bytes obtained with `mmap`. Each area starts with the glue
//! code of [crate::compile::exit]; traces are placed downwards from the area's top, so that the
//! most recent trace is always at the lowest address. When an area fills up a new one is
//! allocated, as near as possible to the previous one, until `maxmcode` bytes are in use.
//!
//! Areas are readable and executable, but never writable and executable at the same time: code
//! is only written while a [PatchGuard] is alive.

use libc::{
    mmap, mprotect, munmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
};
use std::ffi::c_void;

use super::x64::{in_rel32_range, X64};
use crate::compile::{
    exit::{emit_glue, Glue},
    CompilationError, ResourceError,
};

/// The space reserved for glue code at the bottom of each area.
const GLUE_SIZE: usize = 512;

pub(crate) struct McodeArea {
    base: usize,
    size: usize,
    /// The lowest address used by a trace.
    top: usize,
    pub(crate) glue: Glue,
}

impl McodeArea {
    /// The range `[limit, top)` code can still be written to.
    pub(crate) fn free(&self) -> (usize, usize) {
        (self.base + GLUE_SIZE, self.top)
    }

    /// Mark everything from `pos` upwards as in use.
    pub(crate) fn commit(&mut self, pos: usize) {
        debug_assert!(pos >= self.base + GLUE_SIZE && pos <= self.top);
        self.top = pos;
    }

    /// Make the whole area writable for as long as the returned guard lives.
    pub(crate) fn unprotect(&self) -> PatchGuard {
        PatchGuard::new(self.base, self.size)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

pub(crate) struct Mcode {
    areas: Vec<McodeArea>,
    sizemcode: usize,
    maxmcode: usize,
}

impl Mcode {
    pub(crate) fn new(sizemcode: usize, maxmcode: usize) -> Self {
        Mcode {
            areas: Vec::new(),
            sizemcode,
            maxmcode,
        }
    }

    /// Change the sizes used for areas allocated from now on.
    pub(crate) fn set_limits(&mut self, sizemcode: usize, maxmcode: usize) {
        self.sizemcode = sizemcode;
        self.maxmcode = maxmcode;
    }

    /// The number of bytes of machine code memory mapped.
    pub(crate) fn total(&self) -> usize {
        self.areas.iter().map(|a| a.size).sum()
    }

    /// The area new traces are placed in, allocating the first area if necessary.
    pub(crate) fn current(&mut self) -> Result<&mut McodeArea, CompilationError> {
        if self.areas.is_empty() {
            return self.new_area();
        }
        Ok(self.areas.last_mut().unwrap())
    }

    /// The glue code of the area containing `addr`.
    pub(crate) fn glue_for(&self, addr: usize) -> Option<Glue> {
        self.areas.iter().find(|a| a.contains(addr)).map(|a| a.glue)
    }

    /// Allocate a fresh area and make it the current one.
    pub(crate) fn new_area(&mut self) -> Result<&mut McodeArea, CompilationError> {
        let size = self.sizemcode.next_multiple_of(page_size::get());
        if self.total() + size > self.maxmcode {
            return Err(ResourceError::McodeLimit.into());
        }
        // Ask for memory just below the previous area: traces jump between areas with 32 bit
        // displacements.
        let hint = match self.areas.last() {
            Some(a) => a.base.saturating_sub(size),
            None => 0,
        };
        let buf = unsafe {
            mmap(
                hint as *mut c_void,
                size,
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(ResourceError::McodeLimit.into());
        }
        let base = buf as usize;
        if let Some(first) = self.areas.first() {
            if !in_rel32_range(base, first.base + first.size)
                || !in_rel32_range(first.base, base + size)
            {
                unsafe { munmap(buf, size) };
                return Err(ResourceError::McodeLimit.into());
            }
        }
        let mut x = X64::new(base, base + GLUE_SIZE, false);
        let glue = emit_glue(&mut x)?;
        protect(base, size, PROT_READ | PROT_EXEC);
        self.areas.push(McodeArea {
            base,
            size,
            top: base + size,
            glue,
        });
        Ok(self.areas.last_mut().unwrap())
    }

    /// Unmap every area. No trace may be running.
    pub(crate) fn flush(&mut self) {
        for a in self.areas.drain(..) {
            if unsafe { munmap(a.base as *mut c_void, a.size) } != 0 {
                panic!("munmap failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

impl Drop for Mcode {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Change the protection of the pages covering `[addr, addr + len)`. Failure leaves code
/// memory in an unknown state and is fatal.
fn protect(addr: usize, len: usize, prot: i32) {
    let ps = page_size::get();
    let start = addr - addr % ps;
    let end = (addr + len).next_multiple_of(ps);
    if unsafe { mprotect(start as *mut c_void, end - start, prot) } != 0 {
        panic!(
            "mprotect({start:#x}, {}) failed: {}",
            end - start,
            std::io::Error::last_os_error()
        );
    }
}

/// Makes a range of machine code writable (and not executable) until dropped.
pub(crate) struct PatchGuard {
    addr: usize,
    len: usize,
}

impl PatchGuard {
    pub(crate) fn new(addr: usize, len: usize) -> Self {
        protect(addr, len, PROT_READ | PROT_WRITE);
        PatchGuard { addr, len }
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        protect(self.addr, self.len, PROT_READ | PROT_EXEC);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn areas() {
        let ps = page_size::get();
        let mut mc = Mcode::new(ps * 2, ps * 4);
        let a = mc.current().unwrap();
        let (limit, top) = a.free();
        assert_eq!(top - limit, ps * 2 - GLUE_SIZE);
        assert!(a.glue.trampoline < a.glue.handler);
        {
            let _g = a.unprotect();
            unsafe { *((top - 1) as *mut u8) = 0xC3 };
        }
        a.commit(top - 1);
        assert_eq!(a.free().1, top - 1);
        let glue = a.glue;
        assert_eq!(mc.glue_for(top - 1).map(|g| g.handler), Some(glue.handler));
        mc.new_area().unwrap();
        assert_eq!(mc.total(), ps * 4);
        assert!(matches!(
            mc.new_area(),
            Err(CompilationError::ResourceExhausted(ResourceError::McodeLimit))
        ));
        mc.flush();
        assert_eq!(mc.total(), 0);
    }
}
