//! Statistics about the JIT. Counters are always kept (tests and embedders read them through
//! [crate::MT::stats]); timings and the JSON dump are only produced if `UJD_LOG_STATS` is set.

use std::{
    cell::{Cell, RefCell},
    env, fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// A copy of the JIT's counters at a point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    /// How many traces were started (root and side traces)?
    pub traces_started: u64,
    /// How many traces were compiled and linked successfully?
    pub traces_compiled: u64,
    /// How many trace attempts were aborted?
    pub traces_aborted: u64,
    /// How many traces were flushed (individually or by a full flush)?
    pub traces_flushed: u64,
    /// How many full flushes happened?
    pub flushes: u64,
    /// How many times was a trace entered from the interpreter?
    pub trace_executions: u64,
    /// How many exits were taken back to the interpreter?
    pub exits: u64,
    /// How many sites were blacklisted?
    pub blacklisted: u64,
}

pub(crate) struct Stats {
    counts: Cell<JitStats>,
    /// Only `Some` if `UJD_LOG_STATS` was set.
    timings: Option<RefCell<Timings>>,
}

struct Timings {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    state: (TimingState, Instant),
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    pub(crate) fn new() -> Self {
        let timings = env::var("UJD_LOG_STATS").ok().map(|p| {
            RefCell::new(Timings {
                output_path: p,
                state: (TimingState::Interpreting, Instant::now()),
                durations: [Duration::new(0, 0); TimingState::COUNT],
            })
        });
        Self {
            counts: Cell::new(JitStats::default()),
            timings,
        }
    }

    pub(crate) fn get(&self) -> JitStats {
        self.counts.get()
    }

    fn update_with<F: FnOnce(&mut JitStats)>(&self, f: F) {
        let mut c = self.counts.get();
        f(&mut c);
        self.counts.set(c);
    }

    pub(crate) fn trace_started(&self) {
        self.update_with(|c| c.traces_started += 1);
    }

    pub(crate) fn trace_compiled(&self) {
        self.update_with(|c| c.traces_compiled += 1);
    }

    pub(crate) fn trace_aborted(&self) {
        self.update_with(|c| c.traces_aborted += 1);
    }

    pub(crate) fn traces_flushed(&self, n: u64) {
        self.update_with(|c| c.traces_flushed += n);
    }

    pub(crate) fn flushed_all(&self) {
        self.update_with(|c| c.flushes += 1);
    }

    pub(crate) fn trace_executed(&self) {
        self.update_with(|c| c.trace_executions += 1);
    }

    pub(crate) fn exit_taken(&self) {
        self.update_with(|c| c.exits += 1);
    }

    pub(crate) fn blacklisted(&self) {
        self.update_with(|c| c.blacklisted += 1);
    }

    /// Change the [TimingState] the JIT is in.
    pub(crate) fn timing_state(&self, new_state: TimingState) {
        if let Some(t) = &self.timings {
            let mut t = t.borrow_mut();
            let now = Instant::now();
            let (prev, then) = std::mem::replace(&mut t.state, (new_state, now));
            let d = now.saturating_duration_since(then);
            t.durations[prev as usize] = t.durations[prev as usize].saturating_add(d);
        }
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        if let Some(t) = &self.timings {
            let t = t.borrow();
            let json = self.to_json(&t);
            if t.output_path == "-" {
                eprintln!("{json}");
            } else {
                fs::write(&t.output_path, json).ok();
            }
        }
    }

    /// Turn these statistics into JSON, sorted by field name so that the output can be matched
    /// textually.
    fn to_json(&self, t: &Timings) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let c = self.counts.get();
        let mut fields = vec![
            ("traces_started".to_owned(), c.traces_started.to_string()),
            ("traces_compiled".to_owned(), c.traces_compiled.to_string()),
            ("traces_aborted".to_owned(), c.traces_aborted.to_string()),
            ("traces_flushed".to_owned(), c.traces_flushed.to_string()),
            ("flushes".to_owned(), c.flushes.to_string()),
            ("trace_executions".to_owned(), c.trace_executions.to_string()),
            ("exits".to_owned(), c.exits.to_string()),
            ("blacklisted".to_owned(), c.blacklisted.to_string()),
        ];
        for v in TimingState::iter() {
            fields.push((v.to_string(), fmt_duration(t.durations[v as usize])));
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states the JIT can be in.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
pub(crate) enum TimingState {
    #[strum(to_string = "duration_interpreting")]
    Interpreting,
    #[strum(to_string = "duration_recording")]
    Recording,
    #[strum(to_string = "duration_compiling")]
    Compiling,
    #[strum(to_string = "duration_jit_executing")]
    JitExecuting,
    #[strum(to_string = "duration_deopting")]
    Deopting,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters() {
        let s = Stats::new();
        s.trace_started();
        s.trace_started();
        s.trace_aborted();
        s.traces_flushed(3);
        let c = s.get();
        assert_eq!(c.traces_started, 2);
        assert_eq!(c.traces_aborted, 1);
        assert_eq!(c.traces_flushed, 3);
        assert_eq!(c.traces_compiled, 0);
    }

    #[test]
    fn json_is_sorted() {
        let s = Stats::new();
        s.exit_taken();
        let t = Timings {
            output_path: "-".to_owned(),
            state: (TimingState::Interpreting, Instant::now()),
            durations: [Duration::new(0, 0); TimingState::COUNT],
        };
        let json = s.to_json(&t);
        let keys = json
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .map(|l| l.split('"').next().unwrap().to_owned())
            .collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(json.contains(r#""exits": 1"#));
    }
}
