#[cfg(feature = "tui")]
use core::time::Duration;

use colored::{
    ColoredString,
    Colorize,
};
use indicatif::{
    ProgressBar,
    ProgressStyle,
};

#[cfg(feature = "tui")]
const ANIMATION: &[&str; 9] = &[".  ", ".. ", "...", " ..", "  .", " ..", "...", "..", ""];

#[cfg(not(feature = "tui"))]
const ANIMATION: &[&str; 2] = &["...", ""];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn tag(self) -> ColoredString {
        match self {
            Level::Debug => "[elf::DEBUG]".black().on_white(),
            Level::Info => "[elf::INFO]".blue().bold(),
            Level::Warning => "[elf::WARN]".yellow().bold(),
            Level::Error => "[elf::ERROR]".red().bold(),
        }
    }
}

/// Status output of a single load or dump.
///
/// A spinner shows what is being worked on and every message names the program it concerns.
pub struct Logger {
    bar: ProgressBar,
    ticking: bool,
    subject: Option<String>,
}

impl Logger {
    /// A logger whose messages are not attributed to any program
    pub(crate) fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{prefix:.magenta/red} {msg} {spinner}").unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style.tick_strings(ANIMATION));
        bar.set_prefix("[elf]");

        Self {
            bar,
            ticking: false,
            subject: None,
        }
    }

    /// A logger for `task` on the program `subject`. Empty subjects are left out of the messages.
    pub(crate) fn for_task(task: &'static str, subject: impl Into<String>) -> Self {
        let mut logger = Self::spinner();
        let subject = subject.into();

        if !subject.is_empty() {
            logger.subject = Some(subject);
        }

        #[cfg(feature = "tui")]
        {
            logger.bar.enable_steady_tick(Duration::from_millis(100));
            logger.ticking = true;
        }
        logger.bar.set_message(task);
        logger
    }

    fn emit(&self, level: Level, msg: &str) {
        match &self.subject {
            Some(subject) => self.bar.println(format!("{} {} {}", level.tag(), format!("({})", subject).bold(), msg)),
            None => self.bar.println(format!("{} {}", level.tag(), msg)),
        }
    }

    pub fn info<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Info, msg.as_ref());
    }

    pub fn warning<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Warning, msg.as_ref());
    }

    /// Only shown in debug builds
    pub fn debug<S: AsRef<str>>(&self, _msg: S) {
        #[cfg(debug_assertions)]
        {
            self.emit(Level::Debug, _msg.as_ref());
        }
    }

    pub fn error<S: AsRef<str>>(&self, msg: S) {
        self.emit(Level::Error, msg.as_ref());
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if self.ticking {
            self.ticking = false;
            self.bar.finish_and_clear();
        }
    }
}
