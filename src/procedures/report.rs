//! Procedure reports
//!
//! Every host procedure returns a [`ProcedureReport`] listing the steps it
//! ran, how long each took, and any advisory warnings raised on the way.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

// =============================================================================
// ProcedureReport
// =============================================================================

/// Outcome of a procedure that ran to completion
#[derive(Debug, Clone)]
pub struct ProcedureReport {
    /// Procedure name
    pub procedure: String,
    /// Steps in the order they ran
    pub steps: Vec<StepRecord>,
    /// Advisory conditions that did not stop the procedure
    pub warnings: Vec<String>,
    /// Wall time of the whole procedure
    pub elapsed: Duration,
    started: Instant,
}

impl ProcedureReport {
    /// Empty report for `procedure`.
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            steps: Vec::new(),
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Run and time one step.
    ///
    /// A failing step gets the procedure and step names attached as context
    /// and is not recorded.
    pub fn step<T>(&mut self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let value = f().with_context(|| format!("{}: {} failed", self.procedure, name))?;
        let duration = start.elapsed();

        debug!(procedure = %self.procedure, step = name, ?duration, "Step done");
        self.steps.push(StepRecord {
            name: name.to_string(),
            index: self.steps.len(),
            duration,
            detail: None,
        });
        Ok(value)
    }

    /// Attach a detail line to the last recorded step.
    pub fn detail(&mut self, detail: impl Into<String>) {
        if let Some(step) = self.steps.last_mut() {
            step.detail = Some(detail.into());
        }
    }

    /// Record a warning and log it.
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        warn!(procedure = %self.procedure, "{}", warning);
        self.warnings.push(warning);
    }

    /// Stop the clock.
    pub fn finish(mut self) -> Self {
        self.elapsed = self.started.elapsed();
        self
    }

    /// Names of the recorded steps.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

impl fmt::Display for ProcedureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} steps in {:.1?}",
            self.procedure,
            self.steps.len(),
            self.elapsed
        )?;
        for step in &self.steps {
            write!(f, "  [{}] {} ({:.1?})", step.index, step.name, step.duration)?;
            if let Some(detail) = &step.detail {
                write!(f, " - {}", detail)?;
            }
            writeln!(f)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        Ok(())
    }
}

// =============================================================================
// Step Record
// =============================================================================

/// One completed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Step name
    pub name: String,
    /// Position in the procedure (0-based)
    pub index: usize,
    /// How long it took
    pub duration: Duration,
    /// Free-form result, if any
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_recorded_in_order() {
        let mut report = ProcedureReport::new("demo");
        let n = report.step("first", || Ok(1)).unwrap();
        report.detail("one thing");
        report.step("second", || Ok(n + 1)).unwrap();
        let report = report.finish();

        assert_eq!(report.step_names(), vec!["first", "second"]);
        assert_eq!(report.steps[1].index, 1);
        assert_eq!(report.steps[0].detail.as_deref(), Some("one thing"));
        assert!(report.to_string().contains("demo: 2 steps"));
    }

    #[test]
    fn test_failed_step_carries_context() {
        let mut report = ProcedureReport::new("demo");
        let err = report
            .step::<()>("broken", || Err(anyhow::anyhow!("device said no")))
            .unwrap_err();

        let chain = format!("{:#}", err);
        assert!(chain.contains("demo: broken failed"));
        assert!(chain.contains("device said no"));
        assert!(report.steps.is_empty());
    }

    #[test]
    fn test_warnings_show_in_summary() {
        let mut report = ProcedureReport::new("demo");
        report.warn("short read");
        let text = report.finish().to_string();
        assert!(text.contains("warning: short read"));
    }
}
