use super::loss::RestraintReport;

/// Per-iteration observability events. The progress line is a callback
/// concern, not a logging concern; the library never prints it.
#[derive(Debug, Clone)]
pub enum Progress {
    StageStart {
        stage: &'static str,
        total_iterations: u64,
    },
    Iteration {
        iteration: u64,
        loss: f64,
        image_score: f64,
        report: RestraintReport,
    },
    StageFinish {
        stage: &'static str,
    },
    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}
