//! Logging and progress output for a conversion run.
//!
//! [`Notifier`] puts `env_logger` text logs and `indicatif` spinners/bars
//! behind one verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs; a spinner shows the current
//!   step and each layer copy gets a byte progress bar.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`]
//!   → plain log lines, no bars.
//!
//! Warnings are always logged, whatever the level.
//!
//! [`Notifier::install_global_logger`] routes the `log` macros of the rest
//! of the crate through the same bars, so a warning never lands on top of a
//! spinner.

use anyhow::{Context, Result};
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner and bars, no text logs
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

fn build_logger(verbosity: VerbosityLevel) -> env_logger::Logger {
    env_logger::Builder::from_env(Env::default())
        .filter_level(verbosity.to_log_level())
        .build()
}

/// `log` backend that hides the progress bars while a record is printed.
struct BarAwareLogger {
    inner: env_logger::Logger,
    multi_progress: Option<MultiProgress>,
}

impl Log for BarAwareLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        match &self.multi_progress {
            Some(multi_progress) => multi_progress.suspend(|| self.inner.log(record)),
            None => self.inner.log(record),
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    multi_progress: Option<MultiProgress>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let logger = build_logger(verbosity);

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            logger,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    fn bar_aware_logger(&self) -> BarAwareLogger {
        BarAwareLogger {
            inner: build_logger(self.verbosity),
            multi_progress: self.multi_progress.clone(),
        }
    }

    /// Installs the process-wide `log` backend at this notifier's verbosity.
    ///
    /// Can only succeed once per process.
    pub fn install_global_logger(&self) -> Result<()> {
        let logger = self.bar_aware_logger();
        let max_level = logger.inner.filter();
        log::set_boxed_logger(Box::new(logger)).context("Failed to install logger")?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn log(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }

    pub fn info(&self, message: &str) {
        let Some(multi_progress) = &self.multi_progress else {
            self.log(Level::Info, message);
            return;
        };

        if self.active_spinner.borrow().is_none() {
            let spinner_style = ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());

            let spinner = multi_progress.add(ProgressBar::new_spinner());
            spinner.set_style(spinner_style);
            spinner.enable_steady_tick(Duration::from_millis(100));

            *self.active_spinner.borrow_mut() = Some(spinner);
        }

        if let Some(spinner) = self.active_spinner.borrow().as_ref() {
            spinner.set_message(message.to_string());
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Debug, message);
        }
    }

    pub fn warn(&self, message: &str) {
        match self.multi_progress.as_ref() {
            // Printed above the bars so the spinner does not overwrite it.
            Some(multi_progress) => {
                let _ = multi_progress.println(format!("warning: {message}"));
            }
            None => self.log(Level::Warn, message),
        }
    }

    pub fn trace(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Trace, message);
        }
    }

    /// Byte progress bar for copying `length` bytes, in Quiet mode only.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;

        let progress_style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {bytes:>9}/{total_bytes:9} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let progress_bar = multi_progress.add(ProgressBar::new(length));
        progress_bar.set_style(progress_style);
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Step counter for the text modes; bars cover this in Quiet mode.
    pub fn progress(&self, current: usize, total: usize, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Info, &format!("{}: {}/{}", message, current, total));
        }
    }

    /// Clears the spinner, if one was started.
    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn spinner_active(&self) -> bool {
        self.active_spinner.borrow().is_some()
    }
}
