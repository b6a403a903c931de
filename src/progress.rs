//! Download progress display

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// File counter shared by all download workers. Cloning is cheap; every
/// clone drives the same bar. Hidden unless enabled.
#[derive(Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(total_files: u64, enabled: bool) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new(total_files);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("  {spinner} [{elapsed_precise}] {bar:30} {pos}/{len} files {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            ProgressBar::with_draw_target(Some(total_files), ProgressDrawTarget::hidden())
        };
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self::new(0, false)
    }

    pub fn file_done(&self, bytes: u64) {
        self.bar.inc(1);
        if bytes > 0 {
            self.bar
                .set_message(format!("(+{:.1} MB)", bytes as f64 / 1_048_576.0));
        }
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_counter() {
        let p = TransferProgress::new(3, false);
        let q = p.clone();
        p.file_done(10);
        q.file_done(0);
        assert_eq!(p.position(), 2);
        q.finish("done");
    }
}
