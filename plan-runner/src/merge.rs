//! Serialized, ordered integration of finished change sets.
//!
//! One mutex guards the integration tip and the admission order of the
//! current batch. A unit may only integrate when every unit ahead of it in
//! selection order has merged or dropped out, so history is linear and the
//! same for every run of the same plan.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::cancel::CancelToken;
use crate::io::vcs::{ApplyOutcome, ChangeSet, VersionControl};

const ADMISSION_POLL: Duration = Duration::from_millis(50);

/// How an integration request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integration {
    Merged { tip: String },
    /// The replay was aborted and the tip is unchanged.
    Conflict { paths: Vec<String> },
    /// Cancellation was observed while waiting for admission.
    Cancelled,
}

#[derive(Debug, Default)]
struct Admission {
    tip: String,
    order: Vec<String>,
    next: usize,
    dropped: HashSet<String>,
}

impl Admission {
    fn skip_dropped(&mut self) {
        while self
            .order
            .get(self.next)
            .is_some_and(|id| self.dropped.contains(id))
        {
            self.next += 1;
        }
    }
}

pub struct MergeResolver<'a> {
    vcs: &'a dyn VersionControl,
    state: Mutex<Admission>,
    turn: Condvar,
}

impl<'a> MergeResolver<'a> {
    pub fn new(vcs: &'a dyn VersionControl) -> Result<Self> {
        let tip = vcs.tip()?;
        Ok(Self {
            vcs,
            state: Mutex::new(Admission {
                tip,
                ..Admission::default()
            }),
            turn: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Admission>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("merge resolver lock poisoned"))
    }

    /// Integration tip as of the last merge.
    pub fn tip(&self) -> Result<String> {
        Ok(self.lock()?.tip.clone())
    }

    /// Start admitting the units of a new batch, in selection order.
    pub fn begin_batch(&self, order: Vec<String>) -> Result<()> {
        let mut state = self.lock()?;
        state.order = order;
        state.next = 0;
        state.dropped.clear();
        Ok(())
    }

    /// Give up `unit_id`'s turn so later units are not held back.
    pub fn release(&self, unit_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.dropped.insert(unit_id.to_string());
        state.skip_dropped();
        self.turn.notify_all();
        Ok(())
    }

    /// Wait for `change_set`'s turn, then replay it on the tip.
    ///
    /// The unit's turn is consumed whatever the result, including errors.
    #[instrument(skip_all, fields(unit = %change_set.unit_id))]
    pub fn integrate(&self, change_set: &ChangeSet, cancel: &CancelToken) -> Result<Integration> {
        let unit_id = change_set.unit_id.as_str();
        let mut state = self.lock()?;
        if !state.order.iter().any(|id| id == unit_id) {
            return Err(anyhow!("unit '{unit_id}' is not part of the current batch"));
        }
        while state.order.get(state.next).map(String::as_str) != Some(unit_id) {
            if cancel.is_cancelled() {
                drop(state);
                self.release(unit_id)?;
                info!("cancelled while waiting to merge");
                return Ok(Integration::Cancelled);
            }
            state = self
                .turn
                .wait_timeout(state, ADMISSION_POLL)
                .map_err(|_| anyhow!("merge resolver lock poisoned"))?
                .0;
        }

        let onto = state.tip.clone();
        let applied = self.vcs.apply(change_set, &onto);
        state.next += 1;
        state.skip_dropped();
        self.turn.notify_all();

        match applied? {
            ApplyOutcome::Applied { tip } => {
                debug!(tip = %tip, "merged");
                state.tip = tip.clone();
                Ok(Integration::Merged { tip })
            }
            ApplyOutcome::Conflict { paths } => Ok(Integration::Conflict { paths }),
        }
    }
}
