//! Fan-out / fan-in over activities.
//!
//! One activity is scheduled per input, optionally bounded by
//! `max_in_flight`. Completions are consumed in history order so replay
//! reproduces the same launch sequence; results are reported in input order.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;

use crate::{DurableFuture, DurableOutput, OrchestrationContext, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Wait for every item, then report.
    #[default]
    WaitAll,
    /// Stop at the first failure observed in history order; results of
    /// items still in flight are discarded.
    FailFast,
}

#[derive(Debug, Clone, Default)]
pub struct FanOutOptions {
    /// Upper bound on concurrently scheduled items; `None` launches all at once.
    pub max_in_flight: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub retry: Option<RetryPolicy>,
}

impl FanOutOptions {
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.failure_policy = FailurePolicy::FailFast;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Aggregated outcome. `results[i]` belongs to input `i`; `None` means the
/// item was never resolved because a fail-fast fan-out stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanIn {
    pub results: Vec<Option<Result<String, String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fan-out of {total} item(s) failed: {} failed, {} abandoned", .failed.len(), .abandoned.len())]
pub struct FanInError {
    pub total: usize,
    /// `(index, error)` for each failed item.
    pub failed: Vec<(usize, String)>,
    pub abandoned: Vec<usize>,
    /// Successful results by input index, for diagnostics.
    pub partial: Vec<Option<String>>,
}

impl FanIn {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| matches!(r, Some(Ok(_))))
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (usize, &str)> {
        self.results.iter().enumerate().filter_map(|(i, r)| match r {
            Some(Ok(v)) => Some((i, v.as_str())),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &str)> {
        self.results.iter().enumerate().filter_map(|(i, r)| match r {
            Some(Err(e)) => Some((i, e.as_str())),
            _ => None,
        })
    }

    /// All results in input order, or an error that still carries every
    /// successful sibling.
    pub fn into_result(self) -> Result<Vec<String>, FanInError> {
        if self.is_success() {
            return Ok(self.results.into_iter().flatten().flatten().collect());
        }
        let total = self.results.len();
        let mut failed = Vec::new();
        let mut abandoned = Vec::new();
        let mut partial = Vec::with_capacity(total);
        for (i, r) in self.results.into_iter().enumerate() {
            match r {
                Some(Ok(v)) => partial.push(Some(v)),
                Some(Err(e)) => {
                    failed.push((i, e));
                    partial.push(None);
                }
                None => {
                    abandoned.push(i);
                    partial.push(None);
                }
            }
        }
        Err(FanInError {
            total,
            failed,
            abandoned,
            partial,
        })
    }
}

pub struct FanOutFuture {
    ctx: OrchestrationContext,
    name: String,
    inputs: Vec<String>,
    options: FanOutOptions,
    in_flight: Vec<(usize, DurableFuture)>,
    next: usize,
    results: Vec<Option<Result<String, String>>>,
}

impl FanOutFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, inputs: Vec<String>, options: FanOutOptions) -> Self {
        let results = vec![None; inputs.len()];
        Self {
            ctx,
            name,
            inputs,
            options,
            in_flight: Vec::new(),
            next: 0,
            results,
        }
    }

    fn finish(&mut self) -> FanIn {
        self.in_flight.clear();
        FanIn {
            results: std::mem::take(&mut self.results),
        }
    }
}

impl Future for FanOutFuture {
    type Output = FanIn;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<FanIn> {
        let this = self.get_mut();
        let limit = this.options.max_in_flight.unwrap_or(usize::MAX).max(1);
        loop {
            while this.in_flight.len() < limit && this.next < this.inputs.len() {
                let fut = this.ctx.schedule_activity_with(
                    this.name.clone(),
                    this.inputs[this.next].clone(),
                    this.options.retry.clone(),
                );
                this.in_flight.push((this.next, fut));
                this.next += 1;
            }
            let ready = this
                .in_flight
                .iter()
                .enumerate()
                .filter_map(|(slot, (_, f))| f.poll_inner().map(|(h, o)| (slot, h, o)))
                .min_by_key(|(_, h, _)| *h);
            let Some((slot, hist_idx, out)) = ready else {
                if this.in_flight.is_empty() {
                    return Poll::Ready(this.finish());
                }
                return Poll::Pending;
            };
            let (item, fut) = this.in_flight.remove(slot);
            fut.consume(hist_idx);
            let result = match out {
                DurableOutput::Activity(r) => r,
                other => Err(format!("fan-out item resolved with {other:?}")),
            };
            let failed = result.is_err();
            this.results[item] = Some(result);
            if failed && this.options.failure_policy == FailurePolicy::FailFast {
                return Poll::Ready(this.finish());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, run_turn};

    fn history() -> Vec<Event> {
        let mut h: Vec<Event> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, input)| Event::ActivityScheduled {
                id: i as u64 + 1,
                name: "W".into(),
                input: input.to_string(),
                retry: None,
            })
            .collect();
        h.push(Event::ActivityFailed {
            id: 2,
            error: "bad".into(),
            attempts: 1,
        });
        h.push(Event::ActivityCompleted {
            id: 1,
            result: "A".into(),
        });
        h
    }

    fn inputs() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn fail_fast_stops_at_first_failure_in_history_order() {
        let (_h, _a, _l, out) = run_turn(history(), |ctx| async move {
            ctx.fan_out("W", inputs(), FanOutOptions::default().fail_fast()).await
        });
        let fan = out.unwrap();
        assert_eq!(fan.failures().collect::<Vec<_>>(), vec![(1, "bad")]);
        assert_eq!(fan.succeeded().count(), 0);
        let err = fan.into_result().unwrap_err();
        assert_eq!(err.abandoned, vec![0, 2]);
        assert_eq!(err.to_string(), "fan-out of 3 item(s) failed: 1 failed, 2 abandoned");
    }

    #[test]
    fn wait_all_keeps_waiting_for_open_items() {
        let (_h, actions, _l, out) = run_turn(history(), |ctx| async move {
            ctx.fan_out("W", inputs(), FanOutOptions::default()).await
        });
        assert!(out.is_none());
        assert!(actions.is_empty());

        let mut h = history();
        h.push(Event::ActivityCompleted {
            id: 3,
            result: "C".into(),
        });
        let (_h, _a, _l, out) = run_turn(h, |ctx| async move {
            ctx.fan_out("W", inputs(), FanOutOptions::default()).await
        });
        let err = out.unwrap().into_result().unwrap_err();
        assert_eq!(err.partial, vec![Some("A".to_string()), None, Some("C".to_string())]);
        assert!(err.abandoned.is_empty());
    }
}
