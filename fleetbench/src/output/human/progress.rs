use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// One spinner per run; the message shows the most recently finished stage.
pub(crate) struct HumanProgress {
    inner: Mutex<Inner>,
}

impl HumanProgress {
    pub(crate) fn new() -> Self {
        let multi = MultiProgress::new();
        multi.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        Self {
            inner: Mutex::new(Inner {
                multi,
                spinners: HashMap::new(),
            }),
        }
    }

    pub(crate) fn update(&self, run: &str, message: String) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let pb = inner.get_or_create_spinner(run);
        pb.inc(1);
        pb.set_message(message);
    }

    pub(crate) fn finish(&self, run: &str) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(pb) = inner.spinners.remove(run) {
            pb.finish_and_clear();
        }
        if inner.spinners.is_empty() {
            let _ = inner.multi.clear();
        }
    }
}

struct Inner {
    multi: MultiProgress,
    spinners: HashMap<String, ProgressBar>,
}

impl Inner {
    fn get_or_create_spinner(&mut self, run: &str) -> &ProgressBar {
        self.spinners.entry(run.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(spinner_style());
            pb.set_prefix(run.to_string());
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        })
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix} {spinner} stages={pos} elapsed={elapsed} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
