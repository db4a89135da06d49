//! JIT tuning parameters and optimisation flags.
//!
//! Both are flat tables which can be set programmatically or parsed from strings of the form
//! `name=value,name=value` (parameters) and `+flag,-flag` (optimisations), as read from the
//! `UJ_JIT_PARAMS` and `UJ_JIT_OPT` environment variables.

use std::{env, fmt};
use strum::{Display, EnumCount, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown JIT parameter '{0}'")]
    UnknownParam(String),
    #[error("invalid value '{1}' for JIT parameter '{0}'")]
    BadValue(String, String),
    #[error("JIT parameter '{0}' must be in the range {1}..={2}")]
    OutOfRange(String, u32, u32),
    #[error("unknown optimisation flag '{0}'")]
    UnknownFlag(String),
    #[error("parameters can only be changed while the JIT is idle")]
    NotIdle,
}

/// The name of each parameter.
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Param {
    /// Maximum number of traces.
    MaxTrace,
    /// Maximum number of recorded IR instructions.
    MaxRecord,
    /// Maximum number of IR constants.
    MaxIrConst,
    /// Maximum number of side traces of a root trace.
    MaxSide,
    /// Maximum number of snapshots of a trace.
    MaxSnap,
    /// Number of iterations before a loop is considered hot.
    HotLoop,
    /// Number of taken exits before a side trace is started.
    HotExit,
    /// Number of attempts to compile a side trace.
    TrySide,
    /// Maximum unroll factor for instable loops. Reserved: accepted and range-checked, but no
    /// loop this VM records is unrolled for instability, so nothing reads it.
    InstUnroll,
    /// Maximum unroll factor for loop ops in side traces.
    LoopUnroll,
    /// Maximum unroll factor for pseudo-recursive calls.
    CallUnroll,
    /// Minimum unroll factor for true recursion.
    RecUnroll,
    /// Size of each machine code area in KBytes.
    SizeMcode,
    /// Maximum total size of all machine code areas in KBytes.
    MaxMcode,
}

impl Param {
    fn default_value(self) -> u32 {
        match self {
            Param::MaxTrace => 1000,
            Param::MaxRecord => 4000,
            Param::MaxIrConst => 500,
            Param::MaxSide => 100,
            Param::MaxSnap => 500,
            Param::HotLoop => 56,
            Param::HotExit => 10,
            Param::TrySide => 4,
            Param::InstUnroll => 4,
            Param::LoopUnroll => 15,
            Param::CallUnroll => 3,
            Param::RecUnroll => 2,
            Param::SizeMcode => 64,
            Param::MaxMcode => 8192,
        }
    }

    fn range(self) -> (u32, u32) {
        match self {
            Param::MaxTrace => (1, 65535),
            Param::HotLoop => (1, 32767),
            Param::HotExit | Param::TrySide => (0, 32767),
            Param::SizeMcode => (4, 2048),
            Param::MaxMcode => (64, 8192),
            _ => (0, 1 << 20),
        }
    }
}

/// The JIT's tunable parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct JitParams {
    vals: [u32; Param::COUNT],
}

impl Default for JitParams {
    fn default() -> Self {
        let mut vals = [0; Param::COUNT];
        for p in Param::iter() {
            vals[p as usize] = p.default_value();
        }
        JitParams { vals }
    }
}

impl JitParams {
    /// Read `UJ_JIT_PARAMS`, falling back to the defaults if it is not set.
    pub fn from_env() -> Result<Self, ParamError> {
        let mut ps = JitParams::default();
        if let Ok(s) = env::var("UJ_JIT_PARAMS") {
            ps.parse(&s)?;
        }
        Ok(ps)
    }

    pub fn get(&self, p: Param) -> u32 {
        self.vals[p as usize]
    }

    /// Set the parameter named `name` to `val`.
    pub fn set(&mut self, name: &str, val: u32) -> Result<(), ParamError> {
        let p = name
            .parse::<Param>()
            .map_err(|_| ParamError::UnknownParam(name.to_owned()))?;
        let (lo, hi) = p.range();
        if val < lo || val > hi {
            return Err(ParamError::OutOfRange(name.to_owned(), lo, hi));
        }
        // The code area limit must be able to hold at least one area.
        if p == Param::SizeMcode && val > self.get(Param::MaxMcode)
            || p == Param::MaxMcode && val < self.get(Param::SizeMcode)
        {
            return Err(ParamError::OutOfRange(name.to_owned(), lo, hi));
        }
        self.vals[p as usize] = val;
        Ok(())
    }

    /// Parse a comma separated list of `name=value` pairs.
    pub fn parse(&mut self, s: &str) -> Result<(), ParamError> {
        for kv in s.split(',').filter(|x| !x.is_empty()) {
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| ParamError::BadValue(kv.to_owned(), String::new()))?;
            let v = v
                .parse::<u32>()
                .map_err(|_| ParamError::BadValue(k.to_owned(), v.to_owned()))?;
            self.set(k, v)?;
        }
        Ok(())
    }

    pub fn maxtrace(&self) -> u32 {
        self.get(Param::MaxTrace)
    }
    pub fn maxrecord(&self) -> u32 {
        self.get(Param::MaxRecord)
    }
    pub fn maxirconst(&self) -> u32 {
        self.get(Param::MaxIrConst)
    }
    pub fn maxside(&self) -> u32 {
        self.get(Param::MaxSide)
    }
    pub fn maxsnap(&self) -> u32 {
        self.get(Param::MaxSnap)
    }
    pub fn hotloop(&self) -> u32 {
        self.get(Param::HotLoop)
    }
    pub fn hotexit(&self) -> u32 {
        self.get(Param::HotExit)
    }
    pub fn tryside(&self) -> u32 {
        self.get(Param::TrySide)
    }
    pub fn instunroll(&self) -> u32 {
        self.get(Param::InstUnroll)
    }
    pub fn loopunroll(&self) -> u32 {
        self.get(Param::LoopUnroll)
    }
    pub fn callunroll(&self) -> u32 {
        self.get(Param::CallUnroll)
    }
    pub fn recunroll(&self) -> u32 {
        self.get(Param::RecUnroll)
    }
    /// The size of one machine code area in bytes.
    pub fn sizemcode(&self) -> usize {
        self.get(Param::SizeMcode) as usize * 1024
    }
    /// The total machine code budget in bytes.
    pub fn maxmcode(&self) -> usize {
        self.get(Param::MaxMcode) as usize * 1024
    }
}

impl fmt::Display for JitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = Param::iter()
            .map(|p| format!("{p}={}", self.get(p)))
            .collect::<Vec<_>>();
        write!(f, "{}", s.join(","))
    }
}

/// Optimisations which can be individually switched off.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Opt {
    /// Constant folding and algebraic simplification.
    Fold,
    /// Common-subexpression elimination.
    Cse,
    /// Dead-code elimination.
    Dce,
    /// Loop optimisation (invariant hoisting).
    Loop,
    /// Array bounds check elimination.
    Abc,
    /// Allocation sinking.
    Sink,
    /// Untyped load/store forwarding.
    Movtv,
}

/// The set of enabled optimisations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptFlags(u8);

impl Default for OptFlags {
    fn default() -> Self {
        OptFlags(Opt::iter().fold(0, |acc, o| acc | 1 << o as u8))
    }
}

impl OptFlags {
    /// No optimisations at all.
    pub fn none() -> Self {
        OptFlags(0)
    }

    /// Read `UJ_JIT_OPT`, falling back to all optimisations being enabled.
    pub fn from_env() -> Result<Self, ParamError> {
        let mut fs = OptFlags::default();
        if let Ok(s) = env::var("UJ_JIT_OPT") {
            fs.parse(&s)?;
        }
        Ok(fs)
    }

    pub fn has(self, o: Opt) -> bool {
        self.0 & (1 << o as u8) != 0
    }

    pub fn set(&mut self, o: Opt, on: bool) {
        if on {
            self.0 |= 1 << o as u8;
        } else {
            self.0 &= !(1 << o as u8);
        }
    }

    /// Parse a comma separated list of flags, each optionally prefixed with `+` (enable, the
    /// default) or `-` (disable). The level names `0` (nothing) and `3` (everything) are also
    /// accepted.
    pub fn parse(&mut self, s: &str) -> Result<(), ParamError> {
        for x in s.split(',').filter(|x| !x.is_empty()) {
            match x {
                "0" => *self = OptFlags::none(),
                "3" => *self = OptFlags::default(),
                _ => {
                    let (on, name) = match x.as_bytes()[0] {
                        b'-' => (false, &x[1..]),
                        b'+' => (true, &x[1..]),
                        _ => (true, x),
                    };
                    let o = name
                        .parse::<Opt>()
                        .map_err(|_| ParamError::UnknownFlag(name.to_owned()))?;
                    self.set(o, on);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let ps = JitParams::default();
        assert_eq!(ps.hotloop(), 56);
        assert_eq!(ps.maxmcode(), 8192 * 1024);
        assert_eq!(ps.recunroll(), 2);
    }

    #[test]
    fn parse_params() {
        let mut ps = JitParams::default();
        ps.parse("hotloop=3,maxside=7").unwrap();
        assert_eq!(ps.hotloop(), 3);
        assert_eq!(ps.maxside(), 7);
        assert_eq!(
            ps.parse("nope=1"),
            Err(ParamError::UnknownParam("nope".to_owned()))
        );
        assert!(matches!(ps.parse("hotloop=x"), Err(ParamError::BadValue(..))));
        assert!(matches!(
            ps.set("hotloop", 0),
            Err(ParamError::OutOfRange(..))
        ));
        assert!(ps.to_string().contains("hotloop=3"));
    }

    #[test]
    fn reserved_params_are_still_checked() {
        let mut ps = JitParams::default();
        assert_eq!(ps.get(Param::InstUnroll), 4);
        ps.set("instunroll", 8).unwrap();
        assert_eq!(ps.get(Param::InstUnroll), 8);
        assert!(matches!(
            ps.set("instunroll", 1 << 21),
            Err(ParamError::OutOfRange(..))
        ));
    }

    #[test]
    fn opt_flags() {
        let mut fs = OptFlags::default();
        assert!(fs.has(Opt::Sink));
        fs.parse("-sink,-loop").unwrap();
        assert!(!fs.has(Opt::Sink));
        assert!(!fs.has(Opt::Loop));
        assert!(fs.has(Opt::Fold));
        fs.parse("0,+dce").unwrap();
        assert!(fs.has(Opt::Dce));
        assert!(!fs.has(Opt::Fold));
        assert!(fs.parse("+bogus").is_err());
    }
}
