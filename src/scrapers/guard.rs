use std::io::BufRead;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::scrapers::browser::PageSession;

/// Phrases the site serves on its captcha / denial interstitials.
const BLOCK_MARKERS: &[&str] = &["show us your human side", "access denied"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCheck {
    Clear,
    Blocked,
}

/// Fires once the operator has dealt with a block (solved the captcha,
/// swapped cookies). The pipeline stays suspended until then.
pub trait OperatorSignal {
    fn wait_for_resume(&self) -> Result<()>;
}

/// Interactive signal: the operator presses Enter in the terminal.
pub struct StdinSignal;

impl OperatorSignal for StdinSignal {
    fn wait_for_resume(&self) -> Result<()> {
        info!("Resolve the captcha in the browser window, then press Enter to continue");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}

/// Detects site-imposed automation blocks and mediates suspension. There is
/// no automatic retry against a block; escalation is always to the operator.
pub struct AntiBotGuard<S: OperatorSignal> {
    pub(crate) signal: S,
    pub(crate) settle_delay: Duration,
}

impl<S: OperatorSignal> AntiBotGuard<S> {
    pub fn new(signal: S) -> Self {
        Self {
            signal,
            settle_delay: Duration::from_secs(2),
        }
    }

    pub fn check(page_source: &str) -> BotCheck {
        let lowered = page_source.to_lowercase();
        if BLOCK_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            BotCheck::Blocked
        } else {
            BotCheck::Clear
        }
    }

    /// Suspend until the current page is no longer blocked. If the block
    /// persists after the operator signal, re-enter suspension rather than
    /// assuming the resume worked.
    pub fn ensure_clear(&self, page: &dyn PageSession) -> Result<()> {
        loop {
            let html = page.page_source()?;
            if Self::check(&html) == BotCheck::Clear {
                return Ok(());
            }
            warn!("Anti-bot block detected; pipeline suspended pending operator action");
            self.signal.wait_for_resume()?;
            thread::sleep(self.settle_delay);
        }
    }
}
