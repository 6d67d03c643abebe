use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners that turn into checkmarks.
    Normal,
    /// No ANSI, plain println output (piped output, or logs on stderr).
    Plain,
    /// Nothing at all, for machine-readable output.
    Quiet,
}

/// Orchestrates numbered steps of one command with spinners and checkmarks.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

/// Handle passed into the step closure.
///
/// `run()` keeps its own clone of the state, so the closure may drop the
/// handle before its future completes.
pub struct Step {
    done_label: Arc<Mutex<Option<String>>>,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .expect("invalid spinner template")
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .expect("invalid done template")
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .expect("invalid failed template")
}

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if mode == OutputMode::Normal {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    /// Run one fallible async task as a numbered step.
    ///
    /// Shows a spinner while running, a checkmark on `Ok` and a cross on
    /// `Err`. The error itself is left to the caller to report.
    pub async fn run<F, Fut, T, E>(&mut self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.current_step += 1;
        let prefix = format!("{}/{}", self.current_step, self.total_steps);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));

        let done_label = Arc::new(Mutex::new(None));
        let step = Step {
            done_label: done_label.clone(),
        };

        let result = f(step).await;

        let done_label = done_label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| label.to_string());

        match &result {
            Ok(_) => {
                if self.mode == OutputMode::Plain {
                    println!("[{prefix}] \u{2713} {done_label}");
                }
                bar.set_style(done_style());
                bar.finish_with_message(done_label);
            }
            Err(_) => {
                if self.mode == OutputMode::Plain {
                    println!("[{prefix}] \u{2717} {label}");
                }
                bar.set_style(failed_style());
                bar.finish_with_message(label.to_string());
            }
        }
        result
    }

    /// Instant completion, for steps with nothing to do.
    pub fn skip(&mut self, label: &str) {
        self.current_step += 1;
        let prefix = format!("{}/{}", self.current_step, self.total_steps);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] \u{2713} {label}");
            return;
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(done_style());
        bar.set_prefix(prefix);
        bar.set_message(label.to_string());
        bar.finish();
    }

    /// Print an info line under the steps.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Plain => println!("      \u{2192} {text}"),
            OutputMode::Normal => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
            OutputMode::Quiet => {}
        }
    }
}

impl Step {
    /// Override the completion label shown with the checkmark.
    pub fn set_done_label(&self, label: impl Into<String>) {
        *self.done_label.lock().unwrap_or_else(PoisonError::into_inner) = Some(label.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_passes_the_result_through() {
        let mut progress = StepProgress::new(2, OutputMode::Quiet);
        let ok: Result<u32, String> = progress
            .run("first", |step| async move {
                step.set_done_label("first done");
                Ok(7)
            })
            .await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, String> = progress
            .run("second", |_| async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
        assert_eq!(progress.current_step, 2);
    }

    #[test]
    fn skip_counts_as_a_step() {
        let mut progress = StepProgress::new(1, OutputMode::Quiet);
        progress.skip("nothing to do");
        assert_eq!(progress.current_step, 1);
    }
}
