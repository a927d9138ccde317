//! Unref'd timer table for sandboxed code
//!
//! Timers never keep a runner alive on their own: the event loop only fires
//! them while something it awaits is still pending. Scheduling uses a
//! min-heap of deadlines; callbacks live in a GC-traced map so a cleared
//! timer simply disappears from the map and its heap entry is skipped.

use boa_engine::{Context, JsArgs, JsNativeError, JsObject, JsResult, JsValue, object::builtins::JsFunction};
use boa_gc::{Finalize, Trace};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use super::{RunnerHandle, bind_native};

/// Heap entry ordering timers by deadline, then by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scheduled {
    deadline: Instant,
    id: u32,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other.deadline.cmp(&self.deadline).then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Trace, Finalize)]
pub(crate) struct TimerEntry {
    pub(crate) callback: JsObject,
    pub(crate) args: Vec<JsValue>,
    #[unsafe_ignore_trace]
    deadline: Instant,
    #[unsafe_ignore_trace]
    interval: Option<Duration>,
}

/// A timer that came due, removed from (or rescheduled in) the table
pub(crate) struct DueTimer {
    pub(crate) callback: JsObject,
    pub(crate) args: Vec<JsValue>,
}

#[derive(Default, Trace, Finalize)]
pub(crate) struct TimerTable {
    next_id: u32,
    entries: HashMap<u32, TimerEntry>,
    #[unsafe_ignore_trace]
    heap: BinaryHeap<Scheduled>,
}

impl TimerTable {
    pub(crate) fn schedule(&mut self, callback: JsObject, delay: Duration, interval: bool, args: Vec<JsValue>) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let deadline = Instant::now() + delay;
        self.entries.insert(
            id,
            TimerEntry {
                callback,
                args,
                deadline,
                interval: interval.then_some(delay),
            },
        );
        self.heap.push(Scheduled { deadline, id });
        id
    }

    pub(crate) fn clear(&mut self, id: u32) {
        self.entries.remove(&id);
    }

    /// Earliest live deadline, discarding heap entries of cleared timers
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            match self.entries.get(&top.id) {
                Some(entry) if entry.deadline == top.deadline => return Some(top.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop the earliest timer if its deadline has passed
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<DueTimer> {
        let deadline = self.next_deadline()?;
        if deadline > now {
            return None;
        }
        let Scheduled { id, .. } = self.heap.pop()?;
        let entry = self.entries.get_mut(&id)?;
        let due = DueTimer {
            callback: entry.callback.clone(),
            args: entry.args.clone(),
        };
        match entry.interval {
            Some(interval) => {
                entry.deadline = now + interval;
                self.heap.push(Scheduled {
                    deadline: entry.deadline,
                    id,
                });
            }
            None => {
                self.entries.remove(&id);
            }
        }
        Some(due)
    }
}

fn delay_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<Duration> {
    let ms = args.get_or_undefined(index).to_number(context)?;
    let ms = if ms.is_finite() && ms > 0.0 { ms } else { 0.0 };
    Ok(Duration::from_secs_f64(ms / 1000.0))
}

fn callback_arg(args: &[JsValue], name: &str) -> JsResult<JsObject> {
    args.get_or_undefined(0)
        .as_callable()
        .map(|c| c.clone())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{name}: callback must be a function"))
                .into()
        })
}

fn set_timeout(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let callback = callback_arg(args, "setTimeout")?;
    let delay = delay_arg(args, 1, context)?;
    let rest = args.iter().skip(2).cloned().collect();
    let id = handle.borrow_mut().timers.schedule(callback, delay, false, rest);
    Ok(JsValue::from(id))
}

fn set_interval(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let callback = callback_arg(args, "setInterval")?;
    let delay = delay_arg(args, 1, context)?.max(Duration::from_millis(1));
    let rest = args.iter().skip(2).cloned().collect();
    let id = handle.borrow_mut().timers.schedule(callback, delay, true, rest);
    Ok(JsValue::from(id))
}

fn set_immediate(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, _context: &mut Context) -> JsResult<JsValue> {
    let callback = callback_arg(args, "setImmediate")?;
    let rest = args.iter().skip(1).cloned().collect();
    let id = handle.borrow_mut().timers.schedule(callback, Duration::ZERO, false, rest);
    Ok(JsValue::from(id))
}

fn clear_timer(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0);
    if id.is_number() {
        let id = id.to_u32(context)?;
        handle.borrow_mut().timers.clear(id);
    }
    Ok(JsValue::undefined())
}

/// Timer functions bound to one runner
pub(crate) struct TimerFunctions {
    pub(crate) set_timeout: JsFunction,
    pub(crate) clear_timeout: JsFunction,
    pub(crate) set_interval: JsFunction,
    pub(crate) clear_interval: JsFunction,
    pub(crate) set_immediate: JsFunction,
    pub(crate) clear_immediate: JsFunction,
}

impl TimerFunctions {
    pub(crate) fn new(handle: &RunnerHandle, context: &mut Context) -> Self {
        Self {
            set_timeout: bind_native(handle, set_timeout, context),
            clear_timeout: bind_native(handle, clear_timer, context),
            set_interval: bind_native(handle, set_interval, context),
            clear_interval: bind_native(handle, clear_timer, context),
            set_immediate: bind_native(handle, set_immediate, context),
            clear_immediate: bind_native(handle, clear_timer, context),
        }
    }

    pub(crate) fn entries(&self) -> [(&'static str, &JsFunction); 6] {
        [
            ("setTimeout", &self.set_timeout),
            ("clearTimeout", &self.clear_timeout),
            ("setInterval", &self.set_interval),
            ("clearInterval", &self.clear_interval),
            ("setImmediate", &self.set_immediate),
            ("clearImmediate", &self.clear_immediate),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{Source, js_string};

    fn callback(context: &mut Context) -> JsObject {
        context
            .eval(Source::from_bytes("(function () {})"))
            .unwrap()
            .as_object()
            .map(|o| o.clone())
            .unwrap()
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut context = Context::default();
        let mut table = TimerTable::default();
        let late = table.schedule(callback(&mut context), Duration::from_millis(50), false, vec![]);
        let early = table.schedule(callback(&mut context), Duration::ZERO, false, vec![JsValue::from(js_string!("x"))]);
        assert_ne!(late, early);

        let due = table.take_due(Instant::now()).unwrap();
        assert_eq!(due.args.len(), 1);
        assert!(table.take_due(Instant::now()).is_none());
        assert!(table.next_deadline().is_some());
    }

    #[test]
    fn test_cleared_timer_never_fires() {
        let mut context = Context::default();
        let mut table = TimerTable::default();
        let id = table.schedule(callback(&mut context), Duration::ZERO, false, vec![]);
        table.clear(id);
        assert!(table.next_deadline().is_none());
        assert!(table.take_due(Instant::now() + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_interval_reschedules() {
        let mut context = Context::default();
        let mut table = TimerTable::default();
        table.schedule(callback(&mut context), Duration::from_millis(1), true, vec![]);
        let later = Instant::now() + Duration::from_millis(5);
        assert!(table.take_due(later).is_some());
        assert!(table.next_deadline().unwrap() > later);
    }
}
