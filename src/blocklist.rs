// Time-boxed set of proxy authorities that recently failed to accept
// connections. Entries age out after five minutes, which matches Chrome's
// behaviour when it evaluates proxy lists.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_AGE: Duration = Duration::from_secs(5 * 60);

type Clock = Box<dyn Fn() -> Instant + Send>;

pub struct Blocklist {
    inner: Mutex<Inner>,
}

struct Inner {
    // Entries ordered by expiry time, plus the expiry for each entry. The
    // two structures always agree on membership.
    entries: Vec<String>,
    expiry: HashMap<String, Instant>,
    now: Clock,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::with_clock(Box::new(Instant::now))
    }

    fn with_clock(now: Clock) -> Self {
        Blocklist {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                expiry: HashMap::new(),
                now,
            }),
        }
    }

    pub fn add(&self, entry: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep();
        if inner.expiry.contains_key(entry) {
            // An entry has a single expiry time, so it must not appear in
            // the ordered list twice.
            return;
        }
        let deadline = (inner.now)() + MAX_AGE;
        inner.expiry.insert(entry.to_string(), deadline);
        inner.entries.push(entry.to_string());
    }

    pub fn contains(&self, entry: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep();
        inner.expiry.contains_key(entry)
    }

    /// Drops all entries. Called when a new PAC script is installed, since
    /// the new script may name an entirely different set of proxies.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.expiry.clear();
    }
}

impl Inner {
    fn sweep(&mut self) {
        let now = (self.now)();
        let mut count = 0;
        for entry in &self.entries {
            let expiry = self
                .expiry
                .get(entry)
                .expect("blocklist entry without expiry time");
            if now < *expiry {
                break;
            }
            self.expiry.remove(entry);
            count += 1;
        }
        self.entries.drain(..count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    // A clock that only moves when the test tells it to.
    fn manual_clock() -> (Arc<AtomicU64>, Clock) {
        let offset = Arc::new(AtomicU64::new(0));
        let epoch = Instant::now();
        let handle = Arc::clone(&offset);
        let clock = Box::new(move || epoch + Duration::from_secs(handle.load(Ordering::SeqCst)));
        (offset, clock)
    }

    #[test]
    fn entries_expire_after_five_minutes() {
        let (clock, now) = manual_clock();
        let bl = Blocklist::with_clock(now);
        bl.add("proxy1:80");
        assert!(bl.contains("proxy1:80"));
        clock.store(299, Ordering::SeqCst);
        assert!(bl.contains("proxy1:80"));
        clock.store(300, Ordering::SeqCst);
        assert!(!bl.contains("proxy1:80"));
    }

    #[test]
    fn duplicate_add_keeps_original_expiry() {
        let (clock, now) = manual_clock();
        let bl = Blocklist::with_clock(now);
        bl.add("proxy1:80");
        clock.store(200, Ordering::SeqCst);
        bl.add("proxy1:80");
        clock.store(301, Ordering::SeqCst);
        // Expiry counts from the first add, not the second.
        assert!(!bl.contains("proxy1:80"));
    }

    #[test]
    fn entries_expire_independently() {
        let (clock, now) = manual_clock();
        let bl = Blocklist::with_clock(now);
        bl.add("proxy1:80");
        clock.store(100, Ordering::SeqCst);
        bl.add("proxy2:80");
        clock.store(350, Ordering::SeqCst);
        assert!(!bl.contains("proxy1:80"));
        assert!(bl.contains("proxy2:80"));
        clock.store(400, Ordering::SeqCst);
        assert!(!bl.contains("proxy2:80"));
    }

    #[test]
    fn sweep_runs_on_add() {
        let (clock, now) = manual_clock();
        let bl = Blocklist::with_clock(now);
        bl.add("proxy1:80");
        clock.store(301, Ordering::SeqCst);
        // Adding a fresh entry after the first expired must not panic or
        // resurrect the stale one.
        bl.add("proxy2:80");
        assert!(!bl.contains("proxy1:80"));
        assert!(bl.contains("proxy2:80"));
    }

    #[test]
    fn clear_empties_the_list() {
        let bl = Blocklist::new();
        bl.add("proxy1:80");
        bl.add("proxy2:80");
        bl.clear();
        assert!(!bl.contains("proxy1:80"));
        assert!(!bl.contains("proxy2:80"));
    }
}
