use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tajrobe_sync::{BatchReport, ItemOutcome, ProgressReporter, RunState, SyncRunSummary};

const FAILED_MESSAGE: &str = "data.json left at last committed batch";

const TEMPLATE: &str = "{bar:40.cyan/blue} {percent:>3}% | {pos}/{len} reviews | batch {prefix} | {msg}";

/// Two stacked bars: the current batch and the whole run.
pub struct BarReporter {
    _bars: MultiProgress,
    batch: ProgressBar,
    total: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█░ ");
        let bars = MultiProgress::new();
        let batch = bars.add(ProgressBar::new(0).with_style(style.clone()));
        let total = bars.add(ProgressBar::new(0).with_style(style));
        batch.set_prefix("-");
        total.set_prefix("total");
        Self {
            _bars: bars,
            batch,
            total,
        }
    }
}

impl ProgressReporter for BarReporter {
    fn state_changed(&self, state: RunState) {
        match state {
            RunState::Failed => {
                self.batch.abandon_with_message("failed");
                self.total.abandon_with_message(FAILED_MESSAGE);
            }
            RunState::UpToDate => self.total.finish_with_message("already up to date"),
            _ => self.total.set_message(state.as_str()),
        }
    }

    fn run_planned(&self, candidates: usize, _batches: usize) {
        self.total.set_length(candidates as u64);
        self.total.set_message("in progress");
    }

    fn batch_started(&self, batch_index: usize, total_batches: usize, size: usize) {
        self.batch.reset();
        self.batch.set_length(size as u64);
        self.batch.set_prefix(format!("{}/{}", batch_index + 1, total_batches));
        self.batch.set_message("fetching");
    }

    fn item_finished(&self, _review_id: u64, _outcome: ItemOutcome) {
        self.batch.inc(1);
        self.total.inc(1);
    }

    fn batch_finished(&self, report: &BatchReport) {
        let message = if report.persisted {
            format!("saved {} new reviews", report.merged)
        } else {
            "nothing new".to_string()
        };
        self.batch.set_message(message);
    }

    fn run_finished(&self, summary: &SyncRunSummary) {
        self.batch.finish();
        self.total
            .finish_with_message(format!("{} reviews merged", summary.merged));
    }
}
