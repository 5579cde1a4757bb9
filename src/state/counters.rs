/// Session-wide task counters
///
/// `admitted` counts tasks that were assigned an id and began fetching.
/// Every admitted task eventually lands in exactly one of `succeeded` or
/// `failed`; `completed` is their sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl Counters {
    /// Number of admitted tasks with a terminal outcome
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Number of admitted tasks still waiting for a terminal outcome
    pub fn outstanding(&self) -> u64 {
        self.admitted.saturating_sub(self.completed())
    }

    /// True when all admitted work has produced a terminal outcome
    pub fn is_settled(&self) -> bool {
        self.completed() == self.admitted
    }
}
