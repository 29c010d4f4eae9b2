//! Processing of independent items with bounded concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::run::ItemOutcome;

/// Process every item with `work`, running at most `concurrency` at once.
///
/// A failing item never stops the others. The outcomes are returned in the
/// order of `items`, independent of the order they finished in.
pub fn process_items<T, F>(items: &[T], concurrency: usize, work: F) -> Vec<ItemOutcome>
where
    T: Sync,
    F: Fn(&T) -> ItemOutcome + Sync,
{
    let workers = concurrency.clamp(1, items.len().max(1));
    if workers == 1 {
        return items.iter().map(work).collect();
    }

    let next = AtomicUsize::new(0);
    let outcomes = Mutex::new(vec![None; items.len()]);

    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(index) else {
                        break;
                    };
                    let outcome = work(item);
                    outcomes.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(outcome);
                }
            });
        }
    });

    outcomes
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .flatten()
        .collect()
}
