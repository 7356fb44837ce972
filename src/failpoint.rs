//! Crash injection for tests.
//!
//! Failure-sensitive paths check in by name, `trip("txn.commit.after_log")`,
//! and get an injected `io::Error` back when a test has armed that name.
//! Names follow the crate's `component.operation.phase` convention. A shot
//! fires once and disarms itself, and arming is per thread, keeping
//! parallel tests out of each other's way. `STRATUM_FAILPOINTS` seeds a
//! thread's armed set on first use so a child process can be crashed from
//! the outside.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

thread_local! {
    static ARMED: RefCell<Armed> = RefCell::new(Armed {
        shots: HashMap::new(),
        env_seeded: false,
    });
}

struct Armed {
    /// Pending shots per point name.
    shots: HashMap<String, u32>,
    env_seeded: bool,
}

impl Armed {
    fn seed_from_env(&mut self) {
        if self.env_seeded {
            return;
        }
        self.env_seeded = true;
        if let Ok(raw) = std::env::var("STRATUM_FAILPOINTS") {
            for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                *self.shots.entry(name.to_string()).or_insert(0) += 1;
            }
        }
    }

    fn fire(&mut self, name: &str) -> bool {
        self.seed_from_env();
        let Some(remaining) = self.shots.get_mut(name) else {
            return false;
        };
        *remaining -= 1;
        if *remaining == 0 {
            self.shots.remove(name);
        }
        true
    }
}

/// Arms `name` to fail on its next trip. Arming again queues another shot.
pub fn arm(name: &str) {
    ARMED.with(|armed| {
        *armed
            .borrow_mut()
            .shots
            .entry(name.to_string())
            .or_insert(0) += 1;
    });
}

/// Drops every shot still armed on this thread.
pub fn disarm_all() {
    ARMED.with(|armed| armed.borrow_mut().shots.clear());
}

/// The checkpoint placed on a failure-sensitive path: consumes one armed
/// shot for `name` and reports the injected failure, or passes through.
pub fn trip(name: &str) -> io::Result<()> {
    let fired = ARMED.with(|armed| armed.borrow_mut().fire(name));
    if fired {
        Err(io::Error::other(format!("fail point tripped: {name}")))
    } else {
        Ok(())
    }
}
