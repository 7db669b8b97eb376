//! Records statistics about the runtime's stubs and deoptimization activity. Durations are
//! wall-clock time and so are only a rough guide.

use crate::deopt::DeoptReason;
use std::{
    cell::Cell,
    env,
    fs,
    ops::DerefMut,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled by `DRT_LOG_STATS`.
pub(crate) struct Stats {
    // The outer `Option` makes the common "stats are off" check a null test: only if stats are
    // wanted do we pay for locking a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many i2c/c2i adapter pairs were generated?
    adapters_created: u64,
    /// How many native wrappers were generated?
    native_wrappers_created: u64,
    /// How many compiled frames were marked for deoptimization?
    frames_deoptimized: u64,
    /// How many interpreter frames were materialized by unpacking?
    frames_unpacked: u64,
    /// How many times did a native wrapper take the safepoint/suspend slow path on return?
    safepoint_slow_paths: u64,
    /// How many times were the yellow guard pages re-enabled after a native call?
    reguards: u64,
    /// Deoptimizations (lazy and uncommon traps) by reason.
    deopts: [u64; DeoptReason::COUNT],
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    pub(crate) fn new(output_path: Option<String>) -> Self {
        Self {
            inner: output_path.map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    /// Enable statistics if `DRT_LOG_STATS` names an output path.
    #[cfg(not(test))]
    pub(crate) fn from_env() -> Self {
        Self::new(env::var("DRT_LOG_STATS").ok())
    }

    #[cfg(test)]
    pub(crate) fn from_env() -> Self {
        Self::new(Some("-".to_owned()))
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// If stats are enabled, update `inner` by running the function `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            let mut lk = mtx.lock().unwrap();
            f(lk.deref_mut());
        }
    }

    pub(crate) fn adapter_created(&self) {
        self.update_with(|inner| inner.adapters_created += 1);
    }

    pub(crate) fn native_wrapper_created(&self) {
        self.update_with(|inner| inner.native_wrappers_created += 1);
    }

    pub(crate) fn frame_deoptimized(&self, reason: DeoptReason) {
        self.update_with(|inner| {
            inner.frames_deoptimized += 1;
            inner.deopts[reason as usize] += 1;
        });
    }

    pub(crate) fn frames_unpacked(&self, n: usize) {
        self.update_with(|inner| inner.frames_unpacked += n as u64);
    }

    pub(crate) fn safepoint_slow_path(&self) {
        self.update_with(|inner| inner.safepoint_slow_paths += 1);
    }

    pub(crate) fn reguarded(&self) {
        self.update_with(|inner| inner.reguards += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub(crate) fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = RT_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> Option<String> {
        self.inner.as_ref().map(|x| x.lock().unwrap().to_json())
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            adapters_created: 0,
            native_wrappers_created: 0,
            frames_deoptimized: 0,
            frames_unpacked: 0,
            safepoint_slow_paths: 0,
            reguards: 0,
            deopts: [0; DeoptReason::COUNT],
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that textual
    /// matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "adapters_created".to_owned(),
                self.adapters_created.to_string(),
            ),
            (
                "native_wrappers_created".to_owned(),
                self.native_wrappers_created.to_string(),
            ),
            (
                "frames_deoptimized".to_owned(),
                self.frames_deoptimized.to_string(),
            ),
            (
                "frames_unpacked".to_owned(),
                self.frames_unpacked.to_string(),
            ),
            (
                "safepoint_slow_paths".to_owned(),
                self.safepoint_slow_paths.to_string(),
            ),
            ("reguards".to_owned(), self.reguards.to_string()),
        ];
        for r in DeoptReason::iter() {
            let n = self.deopts[r as usize];
            if n > 0 {
                fields.push((format!("deopt_{r}"), n.to_string()));
            }
        }
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
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

/// The different timing states a runtime thread can go through.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New states must not assign explicit discriminants: they index `StatsInner::durations`. A state
// whose `to_string` is empty is not output.
pub(crate) enum TimingState {
    /// Time not attributed to anything.
    #[strum(to_string = "")]
    None,
    /// Generating adapters and native wrappers.
    #[strum(to_string = "duration_generating_stubs")]
    GeneratingStubs,
    /// Building the vframe array and unroll block.
    #[strum(to_string = "duration_fetching_unroll_info")]
    FetchingUnrollInfo,
    /// Filling skeletal interpreter frames.
    #[strum(to_string = "duration_unpacking_frames")]
    UnpackingFrames,
    /// Executing generated code.
    #[strum(to_string = "duration_executing")]
    Executing,
}

thread_local! {
    static RT_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let s = Stats::new(Some("-".to_owned()));
        s.adapter_created();
        s.frame_deoptimized(DeoptReason::NullCheck);
        s.frame_deoptimized(DeoptReason::NullCheck);
        s.frames_unpacked(3);
        let json = s.to_json().unwrap();
        let ptn = r#"{
    "adapters_created": 1,
    "deopt_null_check": 2,
    "duration_executing": ...
    "duration_fetching_unroll_info": ...
    "duration_generating_stubs": ...
    "duration_unpacking_frames": ...
    "frames_deoptimized": 2,
    "frames_unpacked": 3,
    "native_wrappers_created": 0,
    "reguards": 0,
    "safepoint_slow_paths": 0
}"#;
        let fmm = fm::FMBuilder::new(ptn).unwrap().build().unwrap();
        if let Err(e) = fmm.matches(&json) {
            panic!("{e}");
        }
    }

    #[test]
    fn disabled_stats_record_nothing() {
        let s = Stats::new(None);
        s.adapter_created();
        assert!(!s.is_enabled());
        assert!(s.to_json().is_none());
    }
}
