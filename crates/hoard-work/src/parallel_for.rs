//! Cooperative parallel-for over a [`WorkManager`].
//!
//! The calling thread and up to `work_count` pool workers pull indices from a
//! shared cursor. The shared context lives in an `Arc`: the caller may drain
//! every item before a single pool worker gets scheduled, and those late
//! workers still find valid (exhausted) state when they do run.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Event, WorkManager};

struct Cursor {
    next: usize,
    active: u32,
}

struct ParallelForContext<T, F> {
    items: Vec<T>,
    func: F,
    cursor: Mutex<Cursor>,
    done: Event,
}

impl<T, F> ParallelForContext<T, F>
where
    F: Fn(&T),
{
    fn participate(&self) {
        self.cursor.lock().active += 1;
        let _participation = Participation(self);

        loop {
            let index = {
                let mut cursor = self.cursor.lock();
                if cursor.next >= self.items.len() {
                    break;
                }
                let index = cursor.next;
                cursor.next += 1;
                index
            };
            (self.func)(&self.items[index]);
        }
    }
}

/// Leaves the participant set on drop, so a panicking item still releases the caller.
struct Participation<'a, T, F>(&'a ParallelForContext<T, F>);

impl<T, F> Drop for Participation<'_, T, F> {
    fn drop(&mut self) {
        let ctx = self.0;
        let mut cursor = ctx.cursor.lock();
        cursor.active -= 1;
        if cursor.active == 0 && cursor.next >= ctx.items.len() {
            ctx.done.set();
        }
    }
}

/// Visit every element of `items` exactly once using `work_count` pool
/// workers plus the calling thread. Blocks until all elements are processed.
pub fn parallel_for<T, F>(
    work_manager: &dyn WorkManager,
    work_count: u32,
    items: Vec<T>,
    description: &str,
    func: F,
) where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    if items.is_empty() {
        return;
    }

    let helpers = work_count.min(items.len().saturating_sub(1) as u32);
    let ctx = Arc::new(ParallelForContext {
        items,
        func,
        cursor: Mutex::new(Cursor { next: 0, active: 0 }),
        done: Event::new(),
    });

    if helpers > 0 {
        let shared = Arc::clone(&ctx);
        work_manager.add_work(Arc::new(move || shared.participate()), helpers, description, false);
    }

    ctx.participate();
    ctx.done.wait();
}
