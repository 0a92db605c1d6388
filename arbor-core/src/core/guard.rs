//! Process-wide exclusive section for consistency-sensitive work.
//!
//! A sync cycle, a consistency audit and an erasure pass all need a view of
//! the store that nobody else mutates halfway through. They run inside one
//! [`ExclusiveSection`]; at most one section is active at a time and waiting
//! callers are admitted strictly in arrival order.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// A FIFO mutual-exclusion section.
#[derive(Debug, Default)]
pub struct ExclusiveSection {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

/// Proof of being inside the section; leaving happens on drop, including unwinding.
#[must_use = "the section is released as soon as the ticket is dropped"]
pub struct SectionTicket<'a> {
    section: &'a ExclusiveSection,
}

impl ExclusiveSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single section shared by everything in this process.
    pub fn global() -> Arc<ExclusiveSection> {
        static GLOBAL: OnceLock<Arc<ExclusiveSection>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ExclusiveSection::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every earlier requester has left, then enters.
    pub fn enter(&self) -> SectionTicket<'_> {
        let mut tickets = self.lock();
        let mine = tickets.next;
        tickets.next += 1;
        while tickets.serving != mine {
            tickets = self.turn.wait(tickets).unwrap_or_else(PoisonError::into_inner);
        }
        SectionTicket { section: self }
    }

    /// Runs `f` inside the section.
    ///
    /// The section is released before the result (or error) reaches the caller.
    pub fn run<T, E>(&self, f: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<T, E> {
        let _ticket = self.enter();
        f()
    }

    /// Whether some caller is currently inside the section or waiting for it.
    pub fn is_busy(&self) -> bool {
        let tickets = self.lock();
        tickets.next != tickets.serving
    }

    fn leave(&self) {
        let mut tickets = self.lock();
        tickets.serving += 1;
        drop(tickets);
        self.turn.notify_all();
    }
}

impl Drop for SectionTicket<'_> {
    fn drop(&mut self) {
        self.section.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_run_returns_result_and_releases() {
        let section = ExclusiveSection::new();
        let ok: Result<i32, String> = section.run(|| Ok(7));
        assert_eq!(ok, Ok(7));
        let err: Result<i32, String> = section.run(|| Err("boom".to_string()));
        assert_eq!(err, Err("boom".to_string()));
        assert!(!section.is_busy());
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&ExclusiveSection::global(), &ExclusiveSection::global()));
    }

    #[test]
    fn test_section_is_released_after_panic() {
        let section = Arc::new(ExclusiveSection::new());
        let inner = Arc::clone(&section);
        let handle = thread::spawn(move || {
            let _ticket = inner.enter();
            panic!("maintenance task failed");
        });
        assert!(handle.join().is_err());
        assert!(!section.is_busy());
        let _ticket = section.enter();
    }

    #[test]
    fn test_at_most_one_active() {
        let section = Arc::new(ExclusiveSection::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (section, active, max_seen) =
                    (Arc::clone(&section), Arc::clone(&active), Arc::clone(&max_seen));
                thread::spawn(move || {
                    section
                        .run(|| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, ()>(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiters_are_admitted_in_arrival_order() {
        let section = Arc::new(ExclusiveSection::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = section.enter();
        let mut handles = Vec::new();
        for i in 0..4 {
            let (waiter, order) = (Arc::clone(&section), Arc::clone(&order));
            handles.push(thread::spawn(move || {
                let _ticket = waiter.enter();
                order.lock().unwrap().push(i);
            }));
            // Wait until thread `i` holds its ticket before spawning the next.
            while section.lock().next < i as u64 + 2 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        drop(first);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
