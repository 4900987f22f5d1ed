use std::thread;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::{RegionTarget, Settings};
use crate::models::{FailureKind, ListingRef, RunFailure, RunResult};
use crate::scrapers::browser::PageSession;
use crate::scrapers::detail::{DetailExtractor, DetailOutcome};
use crate::scrapers::guard::{AntiBotGuard, OperatorSignal};
use crate::scrapers::search::{jitter, DiscoveryEngine};

/// Sequences the whole run: discovery over each region in order, then the
/// detail pass over everything discovered. Owns the guard; borrows the one
/// browser session for the run's duration.
pub struct Pipeline<P: PageSession, S: OperatorSignal> {
    page: P,
    guard: AntiBotGuard<S>,
    settings: Settings,
}

impl<P: PageSession, S: OperatorSignal> Pipeline<P, S> {
    pub fn new(page: P, signal: S, settings: Settings) -> Self {
        Self {
            page,
            guard: AntiBotGuard::new(signal),
            settings,
        }
    }

    /// Run to completion. A dead browser session aborts the run, but
    /// whatever was extracted before the abort is still returned.
    pub fn run(&self, regions: &[RegionTarget]) -> RunResult {
        let mut result = RunResult::new();
        if let Err(err) = self.run_inner(regions, &mut result) {
            error!(error = %err, "Run aborted; surfacing partial results");
        }
        result.finish();
        info!(
            records = result.records.len(),
            failures = result.failures.len(),
            "Run finished"
        );
        result
    }

    fn run_inner(&self, regions: &[RegionTarget], result: &mut RunResult) -> Result<()> {
        let mut targets: Vec<ListingRef> = Vec::new();
        for region in regions {
            let discovery = DiscoveryEngine::new(&self.page, &self.guard, &self.settings);
            let refs = discovery.discover(region)?;
            if refs.is_empty() {
                result.failures.push(RunFailure {
                    target: region.name.clone(),
                    kind: FailureKind::RegionEmpty,
                });
            }
            targets.extend(refs);
            thread::sleep(self.settings.navigation_delay);
        }

        let cap = self.settings.max_detail_targets;
        let pending = if cap > 0 && targets.len() > cap {
            &targets[..cap]
        } else {
            &targets[..]
        };
        if pending.is_empty() {
            info!("No detail targets discovered");
            return Ok(());
        }
        info!(pending = pending.len(), "Processing detail targets");

        let extractor = DetailExtractor::new(&self.page, &self.guard, &self.settings);
        for target in pending {
            match extractor.extract(target) {
                Ok(DetailOutcome::Extracted(record)) => {
                    info!(url = %target.url, "Detail captured");
                    result.records.push(*record);
                }
                Ok(DetailOutcome::Failed(failure)) => {
                    warn!(url = %target.url, failure = %failure, "Detail target skipped");
                    result.failures.push(RunFailure {
                        target: target.url.clone(),
                        kind: failure.kind(),
                    });
                }
                Err(err) => {
                    warn!(url = %target.url, error = %err, "Detail navigation failed; skipping target");
                    result.failures.push(RunFailure {
                        target: target.url.clone(),
                        kind: FailureKind::Navigation,
                    });
                    // Only a dead session aborts the pass; a single sour
                    // navigation does not.
                    self.page
                        .scroll_height()
                        .context("Browser session unresponsive after navigation failure")?;
                }
            }
            thread::sleep(self.settings.navigation_delay + jitter());
        }
        Ok(())
    }
}
