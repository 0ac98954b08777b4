//! Human progress output.
//!
//! Core components never format terminal strings themselves; they hand
//! progress to a [`Presenter`]. The console implementation honors quiet
//! mode, the silent one backs tests and the non-clone subcommands.

use std::io::Write;
use std::sync::Mutex;

/// Sink for run progress.
pub trait Presenter: Send + Sync {
    /// A pipeline step is starting (`worker(node1).firstProcess`).
    fn step(&self, label: &str);

    /// An indented detail line under the current step.
    fn detail(&self, text: &str);

    /// One progress mark in a dense stream (`C`reate, `U`pdate, `D`elete,
    /// `.` unchanged, `X` failed).
    fn tick(&self, mark: char);

    /// Terminate a tick stream.
    fn end_ticks(&self);

    /// A cosmetic warning; never aborts anything.
    fn warn(&self, text: &str);
}

/// Writes progress to stdout unless quiet.
pub struct ConsolePresenter {
    quiet: bool,
    ticking: Mutex<bool>,
}

impl ConsolePresenter {
    pub fn new(quiet: bool) -> Self {
        ConsolePresenter {
            quiet,
            ticking: Mutex::new(false),
        }
    }

    fn finish_tick_line(&self) {
        let mut ticking = self.ticking.lock().unwrap_or_else(|e| e.into_inner());
        if *ticking {
            println!();
            *ticking = false;
        }
    }
}

impl Presenter for ConsolePresenter {
    fn step(&self, label: &str) {
        if self.quiet {
            return;
        }
        self.finish_tick_line();
        println!("    {label}:");
    }

    fn detail(&self, text: &str) {
        if self.quiet {
            return;
        }
        self.finish_tick_line();
        println!("        {text}");
    }

    fn tick(&self, mark: char) {
        if self.quiet {
            return;
        }
        {
            let mut ticking = self.ticking.lock().unwrap_or_else(|e| e.into_inner());
            if !*ticking {
                print!("        ");
                *ticking = true;
            }
        }
        print!("{mark}");
        let _ = std::io::stdout().flush();
    }

    fn end_ticks(&self) {
        if self.quiet {
            return;
        }
        self.finish_tick_line();
    }

    fn warn(&self, text: &str) {
        if self.quiet {
            return;
        }
        self.finish_tick_line();
        println!("        warning: {text}");
    }
}

/// Swallows everything.
pub struct SilentPresenter;

impl Presenter for SilentPresenter {
    fn step(&self, _label: &str) {}
    fn detail(&self, _text: &str) {}
    fn tick(&self, _mark: char) {}
    fn end_ticks(&self) {}
    fn warn(&self, _text: &str) {}
}
