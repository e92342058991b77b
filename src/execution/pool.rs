//! Bounded Worker Pool
//!
//! Runs one closure per child index on a fixed number of scoped threads.
//! Workers pull the next index from a shared cursor and send results back
//! over a channel; the caller gets every result, sorted by index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use log::debug;

/// Applies `f` to every index using at most `workers` threads.
///
/// Every index is attempted exactly once; a slow or failing call never
/// stops the others. Results come back sorted by index.
pub fn run_bounded<T, F>(indices: &[usize], workers: usize, f: F) -> Vec<(usize, T)>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if indices.is_empty() {
        return Vec::new();
    }

    let workers = workers.clamp(1, indices.len());
    debug!("Running {} child operations on {} workers", indices.len(), workers);

    let cursor = AtomicUsize::new(0);
    let (tx, rx): (Sender<(usize, T)>, Receiver<(usize, T)>) = channel();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            let f = &f;
            scope.spawn(move || loop {
                let slot = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(&index) = indices.get(slot) else {
                    break;
                };
                if tx.send((index, f(index))).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut results: Vec<(usize, T)> = rx.into_iter().collect();
    results.sort_by_key(|(index, _)| *index);
    results
}
