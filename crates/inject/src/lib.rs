//! Spill injector: renders one formula row per item below a job's anchor,
//! behind the host's safety gate.

#![forbid(unsafe_code)]

use metrics::{counter, histogram};
use spill_core::Job;
use spill_host::SheetHost;
use tracing::{debug, warn};

/// Default formula rendered at each target cell.
pub const DEFAULT_TEMPLATE: &str = "=URTD(\"{item}\")";

const PLACEHOLDER: &str = "{item}";

/// An injected-formula template. Must contain the `{item}` placeholder; the
/// first occurrence is replaced with the item text at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaTemplate(String);

#[derive(Debug, thiserror::Error)]
#[error("formula template missing the {{item}} placeholder: {0:?}")]
pub struct TemplateError(String);

impl FormulaTemplate {
    pub fn new(template: &str) -> Result<Self, TemplateError> {
        if !template.contains(PLACEHOLDER) {
            return Err(TemplateError(template.to_string()));
        }
        Ok(Self(template.to_string()))
    }

    pub fn render(&self, item: &str) -> String {
        self.0.replacen(PLACEHOLDER, item, 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FormulaTemplate {
    fn default() -> Self {
        Self(DEFAULT_TEMPLATE.to_string())
    }
}

/// Consumes jobs on the drain side. Fire-and-forget: nothing is reported
/// back to the requesting cell.
pub struct Injector {
    template: FormulaTemplate,
}

impl Injector {
    pub fn new(template: FormulaTemplate) -> Self {
        Self { template }
    }

    /// Inject one job, or drop it when the host is not safe to mutate.
    ///
    /// The item at position `i` lands `i + 1` rows below the anchor's
    /// top-left cell, same column. A row whose target fails to resolve is
    /// skipped on its own; sibling rows still run. The job (and its anchor)
    /// is consumed either way.
    pub fn inject(&self, host: &dyn SheetHost, job: Job) {
        counter!("inject_jobs_total", 1u64);
        if !host.is_safe_to_mutate() {
            counter!("inject_unsafe_dropped_total", 1u64);
            debug!(origin = job.origin_key(), items = job.items.len(), "document busy; job dropped");
            return;
        }
        let t0 = std::time::Instant::now();
        for (i, item) in job.items.iter().enumerate() {
            let target = match host.resolve_offset(&job.anchor, i as u32 + 1, 0) {
                Ok(t) => t,
                Err(e) => {
                    counter!("inject_rows_skipped_total", 1u64);
                    warn!(error = %e, row_offset = i + 1, "target resolution failed; row skipped");
                    continue;
                }
            };
            let formula = self.template.render(item);
            match host.set_formula(&target, &formula) {
                Ok(()) => {
                    counter!("inject_rows_ok_total", 1u64);
                }
                Err(e) => {
                    counter!("inject_rows_failed_total", 1u64);
                    warn!(error = %e, row = target.row, col = target.col, "formula set failed");
                }
            }
        }
        histogram!("inject_job_ms", t0.elapsed().as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spill_core::{CellAddr, OwnedRange, RangeRef};
    use spill_host::MemHost;

    fn job_at(sheet: u32, row: u32, col: u32, items: &[&str]) -> Job {
        let anchor = OwnedRange::try_copy(&RangeRef::single(sheet, row, col)).unwrap();
        Job::new(anchor, items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn injects_one_row_per_item_below_anchor() {
        let host = MemHost::new();
        let inj = Injector::new(FormulaTemplate::default());
        inj.inject(&host, job_at(1, 5, 2, &["EUR", "GBP", "JPY"]));

        let log = host.set_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].0, CellAddr { sheet: 1, row: 6, col: 2 });
        assert_eq!(log[1].0, CellAddr { sheet: 1, row: 7, col: 2 });
        assert_eq!(log[2].0, CellAddr { sheet: 1, row: 8, col: 2 });
        assert_eq!(log[0].1, "=URTD(\"EUR\")");
        assert_eq!(log[1].1, "=URTD(\"GBP\")");
        assert_eq!(log[2].1, "=URTD(\"JPY\")");
    }

    #[test]
    fn closed_gate_means_zero_mutations() {
        let host = MemHost::new();
        host.set_safe(false);
        let inj = Injector::new(FormulaTemplate::default());
        inj.inject(&host, job_at(1, 5, 2, &["EUR", "GBP"]));
        assert_eq!(host.set_count(), 0);
    }

    #[test]
    fn resolution_failure_skips_only_that_row() {
        // Rows 0..8: anchor at row 5 leaves room for two derived rows only.
        let host = MemHost::with_bounds(8, 10);
        let inj = Injector::new(FormulaTemplate::default());
        inj.inject(&host, job_at(1, 5, 2, &["EUR", "GBP", "JPY"]));

        let log = host.set_log();
        assert_eq!(log.len(), 2);
        assert_eq!(host.formula_at(1, 6, 2).as_deref(), Some("=URTD(\"EUR\")"));
        assert_eq!(host.formula_at(1, 7, 2).as_deref(), Some("=URTD(\"GBP\")"));
        assert_eq!(host.formula_at(1, 8, 2), None);
    }

    #[test]
    fn template_requires_placeholder() {
        assert!(FormulaTemplate::new("=URTD()").is_err());
        let t = FormulaTemplate::new("=FETCH(\"{item}\", TRUE)").unwrap();
        assert_eq!(t.render("GBP"), "=FETCH(\"GBP\", TRUE)");
    }
}
