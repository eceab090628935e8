//! Admission control: a rate pool, a concurrency cap and a bounded FIFO wait
//! queue in front of them.
//!
//! Every state change happens inside one critical section. Wakes are
//! broadcast; each woken waiter re-checks the limits and only the head of the
//! queue may proceed, so queued callers are admitted in arrival order. A new
//! caller waits only while a limit is in force.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::debug;

use crate::error::{Error, Limit, Result};

/// At most `quota` admissions per `window`. A zero quota disables the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub window: Duration,
    pub quota: usize,
}

/// Limits enforced by an [`AdmissionController`]. `None` disables a limit;
/// an unset `max_awaiting` leaves the wait queue unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub rate: Option<RateLimit>,
    pub max_active: Option<usize>,
    pub max_awaiting: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub waiting: usize,
    pub window_count: usize,
}

#[derive(Default)]
struct State {
    active: usize,
    window_count: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    disposed: bool,
    window_timer: Option<JoinHandle<()>>,
}

impl State {
    fn limit_in_force(&self, limits: &AdmissionLimits) -> Option<Limit> {
        if let Some(rate) = limits.rate
            && self.window_count >= rate.quota
        {
            return Some(Limit::RatePool { quota: rate.quota });
        }
        if let Some(max_active) = limits.max_active
            && self.active >= max_active
        {
            return Some(Limit::MaxActive { max_active });
        }
        None
    }
}

enum Step {
    Admitted,
    Wait(u64),
    Reject(Error),
}

struct Shared {
    limits: AdmissionLimits,
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn try_admit(self: &Arc<Self>, ticket: Option<u64>) -> Step {
        let mut state = self.state.lock();
        if state.disposed {
            return Step::Reject(Error::Disposed);
        }

        match (state.limit_in_force(&self.limits), ticket) {
            (None, None) => self.admit(&mut state),
            // Queued callers keep arrival order among themselves.
            (None, Some(id)) if state.waiters.front() == Some(&id) => {
                state.waiters.pop_front();
                self.admit(&mut state)
            }
            (_, Some(id)) => Step::Wait(id),
            (Some(limit), None) => {
                if let Some(max_awaiting) = self.limits.max_awaiting
                    && state.waiters.len() >= max_awaiting
                {
                    return Step::Reject(Error::AdmissionLimit {
                        limit,
                        max_awaiting,
                    });
                }
                let id = state.next_ticket;
                state.next_ticket += 1;
                state.waiters.push_back(id);
                debug!(%limit, waiting = state.waiters.len(), "request queued for admission");
                Step::Wait(id)
            }
        }
    }

    fn admit(self: &Arc<Self>, state: &mut State) -> Step {
        state.active += 1;
        if let Some(rate) = self.limits.rate {
            state.window_count += 1;
            if state.window_timer.is_none() {
                state.window_timer = Some(self.arm_window(rate.window));
            }
        }
        Step::Admitted
    }

    fn arm_window(self: &Arc<Self>, window: Duration) -> JoinHandle<()> {
        let shared: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(shared) = shared.upgrade() {
                shared.reset_window();
            }
        })
    }

    fn reset_window(&self) {
        {
            let mut state = self.state.lock();
            state.window_count = 0;
            state.window_timer = None;
        }
        self.notify.notify_waiters();
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    fn leave_queue(&self, id: u64) {
        {
            let mut state = self.state.lock();
            state.waiters.retain(|&w| w != id);
        }
        self.notify.notify_waiters();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().window_timer.take() {
            timer.abort();
        }
    }
}

/// Removes a waiter from the queue (if still queued) and wakes the others when
/// its `acquire` future settles or is dropped.
struct Ticket<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.shared.leave_queue(self.id);
    }
}

/// Admission slot. Dropping it releases the slot and wakes waiters.
#[must_use = "dropping a permit releases its admission slot"]
pub struct Permit {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Permit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limits", &self.shared.limits)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(limits: AdmissionLimits) -> Self {
        let limits = AdmissionLimits {
            rate: limits.rate.filter(|rate| rate.quota > 0),
            ..limits
        };
        Self {
            shared: Arc::new(Shared {
                limits,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn limits(&self) -> AdmissionLimits {
        self.shared.limits
    }

    /// Wait for an admission slot.
    ///
    /// # Errors
    /// Fails without waiting with [`Error::AdmissionLimit`] when a limit is in
    /// force and the wait queue is full, and with [`Error::Disposed`] once
    /// the controller is disposed, including while waiting.
    pub async fn acquire(&self) -> Result<Permit> {
        let shared = &self.shared;
        let mut ticket: Option<Ticket<'_>> = None;
        loop {
            // Register interest before inspecting state so a broadcast sent
            // in between is not lost.
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match shared.try_admit(ticket.as_ref().map(|t| t.id)) {
                // Dropping the ticket wakes the remaining waiters so the next
                // head re-checks.
                Step::Admitted => {
                    return Ok(Permit {
                        shared: Arc::clone(shared),
                    });
                }
                Step::Reject(err) => return Err(err),
                Step::Wait(id) => {
                    if ticket.is_none() {
                        ticket = Some(Ticket {
                            shared: shared.as_ref(),
                            id,
                        });
                    }
                }
            }

            notified.await;
        }
    }

    /// Reject every waiter and every later `acquire`. Idempotent.
    pub fn dispose(&self) {
        let timer = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.window_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.shared.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    #[must_use]
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.shared.state.lock();
        AdmissionSnapshot {
            active: state.active,
            waiting: state.waiters.len(),
            window_count: state.window_count,
        }
    }
}
