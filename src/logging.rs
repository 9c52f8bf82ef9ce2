use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use ulink::context::{Milestone, ProgressSink};

// log macros to check if log and log channel is enabled before performing potentially expensive string formatting
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;

/// Route library `tracing` events to stderr. `RUST_LOG` overrides the
/// default `warn` level; `-v` raises it to `debug` for this crate.
pub(crate) fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,ulink=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_level(true)
        .with_target(verbose)
        .without_time();
    tracing_subscriber::registry().with(filter).with(layer).init();
}

pub(crate) struct Log {
    verbose: bool,
    debug: bool,
    progress: Arc<Mutex<Option<ProgressBar>>>,
}
impl Log {
    pub(crate) fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            progress: Default::default(),
        }
    }
    pub(crate) fn set_progress(&self, progress: Option<&ProgressBar>) {
        *self.progress.lock().unwrap() = progress.cloned();
    }
    /// A bar over the linker creation milestones, installed as the log's
    /// progress so messages print above it.
    pub(crate) fn linker_progress(&self) -> (ProgressBar, ProgressSink) {
        let bar = ProgressBar::new(Milestone::COUNT);
        if let Ok(style) = ProgressStyle::with_template("{bar:30} {pos}/{len} {prefix:>20} {wide_msg}") {
            bar.set_style(style);
        }
        self.set_progress(Some(&bar));
        let sink_bar = bar.clone();
        let sink: ProgressSink = Box::new(move |filename: &str, milestone: Milestone| {
            sink_bar.set_position(milestone as u64);
            sink_bar.set_prefix(milestone.as_ref().to_string());
            sink_bar.set_message(filename.to_string());
        });
        (bar, sink)
    }
    pub(crate) fn finish_progress(&self) {
        if let Some(progress) = self.progress.lock().unwrap().take() {
            progress.finish_and_clear();
        }
    }
    pub(crate) fn log(&self, msg: &str) {
        if let Some(progress) = self.progress.lock().unwrap().as_ref() {
            progress.println(msg);
        } else {
            println!("{msg}");
        }
    }
    pub(crate) fn verbose_enabled(&self) -> bool {
        self.verbose
    }
    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug
    }
}
