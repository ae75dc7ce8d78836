//! Application UI: progress bars, and a stderr writer that plays nicely with
//! them.
//!
//! The progress code is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::{
    error::CapabilityError,
    payload::ImagePayload,
    prelude::*,
    services::{ComposedPaper, CompositionRequest, ExtractedText, PaperComposer, TextExtractor},
};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars, shared by every clone of this `Ui`.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI with visible progress bars.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Create a new UI for unit tests.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a new progress bar with default settings.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        let pb = ProgressBar::new(len).with_style(default_progress_style());
        let pb = self.multi_progress.add(pb);
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(config.emoji.to_owned());
        pb.set_message(config.msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }

    /// Create a new spinner with default settings.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(default_spinner_style());
        let sp = self.multi_progress.add(sp);
        #[cfg(test)]
        sp.set_draw_target(ProgressDrawTarget::hidden());
        sp.set_prefix(config.emoji.to_owned());
        sp.set_message(config.msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// A [`TextExtractor`] which advances a progress bar as pages finish.
pub struct ExtractionProgress {
    inner: Arc<dyn TextExtractor>,
    progress_bar: ProgressBar,
}

impl ExtractionProgress {
    /// Wrap `inner`, expecting `page_count` pages.
    pub fn new(ui: &Ui, inner: Arc<dyn TextExtractor>, page_count: usize) -> Self {
        let progress_bar = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📖",
                msg: "Reading pages",
                done_msg: "Read pages",
            },
            u64::try_from(page_count).unwrap_or(u64::MAX),
        );
        Self {
            inner,
            progress_bar,
        }
    }
}

#[async_trait]
impl TextExtractor for ExtractionProgress {
    async fn extract(&self, image: &ImagePayload) -> Result<ExtractedText, CapabilityError> {
        let result = self.inner.extract(image).await;
        self.progress_bar.inc(1);
        result
    }
}

/// A [`PaperComposer`] which shows a spinner while the paper is written.
pub struct CompositionProgress {
    inner: Arc<dyn PaperComposer>,
    ui: Ui,
}

impl CompositionProgress {
    pub fn new(ui: &Ui, inner: Arc<dyn PaperComposer>) -> Self {
        Self {
            inner,
            ui: ui.clone(),
        }
    }
}

#[async_trait]
impl PaperComposer for CompositionProgress {
    async fn compose(
        &self,
        request: &CompositionRequest,
    ) -> Result<ComposedPaper, CapabilityError> {
        let spinner = self.ui.new_spinner(&ProgressConfig {
            emoji: "✍️",
            msg: "Writing test paper",
            done_msg: "Wrote test paper",
        });
        let result = self.inner.compose(request).await;
        if result.is_err() {
            spinner.abandon_with_message("Could not write test paper");
        }
        result
    }
}

/// Configuration for a progress bar.
pub struct ProgressConfig<'a> {
    /// Emoji to display in the progress bar.
    pub emoji: &'a str,
    /// Message to display in a running progress bar.
    pub msg: &'a str,
    /// Message to display in a progress bar when it is done.
    pub done_msg: &'a str,
}

fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn default_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// The `tracing-indicatif` crate suggests that we should implement the following
// methods.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
