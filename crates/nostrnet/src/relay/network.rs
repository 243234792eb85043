use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Reachability of the device's network path, as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PathStatus {
    Satisfied = 0,
    Unsatisfied = 1,
    RequiresConnection = 2,
    Unknown = 3,
}

impl PathStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PathStatus::Satisfied,
            1 => PathStatus::Unsatisfied,
            2 => PathStatus::RequiresConnection,
            _ => PathStatus::Unknown,
        }
    }

    pub fn is_usable(self) -> bool {
        self == PathStatus::Satisfied
    }
}

/// Shared reachability state. Construct one per process and hand an `Arc`
/// of it to the pool and to whatever receives platform path updates.
///
/// Updates may arrive from any thread. Each one swaps the new status in and
/// decides against the status it displaced, so two racing updates can
/// never both see the same transition.
#[derive(Debug)]
pub struct NetworkMonitor {
    status: AtomicU8,
    reconnect_requested: AtomicBool,
    reconnects: AtomicUsize,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(PathStatus::Satisfied)
    }
}

impl NetworkMonitor {
    pub fn new(initial: PathStatus) -> Self {
        Self {
            status: AtomicU8::new(initial as u8),
            reconnect_requested: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> PathStatus {
        PathStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Record a path update. Returns the status it replaced.
    pub fn update(&self, new: PathStatus) -> PathStatus {
        let old = PathStatus::from_u8(self.status.swap(new as u8, Ordering::AcqRel));
        if old == new {
            return old;
        }

        tracing::info!("network path changed: {:?} -> {:?}", old, new);
        if new.is_usable() && !old.is_usable() {
            self.reconnects.fetch_add(1, Ordering::AcqRel);
            self.reconnect_requested.store(true, Ordering::Release);
        }

        old
    }

    /// Consume a pending reconnect request. Several transitions between two
    /// polls collapse into one reconnect.
    pub fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::AcqRel)
    }

    /// Number of transitions into a usable path so far
    pub fn reconnects_requested(&self) -> usize {
        self.reconnects.load(Ordering::Acquire)
    }
}
