//! The implementation of the `UJD_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should the JIT's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log JIT events (e.g. start/stop/abort of a trace, flushes, blacklisting).
    JITEvent,
    /// Log every transition of the trace compiler's state machine.
    JITStateChange,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("UJD_LOG") {
            Ok(s) => {
                let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (None, level)
                        } else {
                            let path = PathBuf::from(path);
                            // Truncate any previous log so later appends start afresh.
                            File::create(&path).ok();
                            (Some(path), level)
                        }
                    }
                    [level] => (None, level),
                    [..] => return Err("UJD_LOG must be of the format `[<path|->:]<level>".into()),
                };
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid UJD_LOG level '{s}': {e}"))?;
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level)
                    .ok_or_else(|| format!("UJD_LOG level {level} exceeds maximum {max_level}"))?;
                Ok(Self { path, level })
            }
            Err(_) => Ok(Self::with_level(Verbosity::Error)),
        }
    }

    /// A logger writing to stderr at `level`, ignoring the environment.
    pub(crate) fn with_level(level: Verbosity) -> Self {
        Self { path: None, level }
    }

    /// Will a message at `level` be written?
    #[cfg(test)]
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "uj-error",
                Verbosity::Warning => "uj-warning",
                Verbosity::JITEvent => "uj-jit-event",
                Verbosity::JITStateChange => "uj-jit-state",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Debug, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The trace IR as recorded.
    PreOpt,
    /// The trace IR after the whole-trace passes have run.
    PostOpt,
    /// The machine code of the compiled trace.
    Asm,
    /// The snapshots of the compiled trace.
    Snapshots,
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("UJD_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!(
                    "UJD_LOG_IR must be of the format '[<path>:]<irstage_1>[,...,<irstage_n>]'"
                ),
            };
            for x in phases.split(',') {
                log_phases.insert(IRPhase::from_str(x).unwrap());
            }
            if path != "-" {
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        pub(super) fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "jit-pre-opt" => Ok(Self::PreOpt),
                "jit-post-opt" => Ok(Self::PostOpt),
                "jit-asm" => Ok(Self::Asm),
                "jit-snapshots" => Ok(Self::Snapshots),
                _ => Err(format!("Invalid UJD_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        if let Some(true) = LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)) {
            return true;
        }
        false
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn levels() {
        let l = Log::with_level(Verbosity::Warning);
        assert!(l.enabled(Verbosity::Error));
        assert!(l.enabled(Verbosity::Warning));
        assert!(!l.enabled(Verbosity::JITEvent));
        assert!(!l.enabled(Verbosity::Disabled));
    }

    #[test]
    fn ir_phases() {
        assert_eq!(IRPhase::from_str("jit-asm").unwrap(), IRPhase::Asm);
        assert_eq!(
            IRPhase::from_str("jit-snapshots").unwrap(),
            IRPhase::Snapshots
        );
        assert!(IRPhase::from_str("aot").is_err());
    }
}
