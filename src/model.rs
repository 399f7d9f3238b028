#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub live_workers: usize,
    pub idle_workers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub total_submitted: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        self.active_tasks as f64 / self.live_workers as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }

    pub fn finished(&self) -> usize {
        self.completed_tasks + self.failed_tasks + self.cancelled_tasks
    }
}

/// How a unit of work ended, as counted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
    Cancelled,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued = 0,
    Running = 1,
    Finished = 2,
    Cancelled = 3,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Finished,
            _ => Self::Cancelled,
        }
    }
}

/// State of one request's async lifecycle.
///
/// `Completing` is held while a timeout or error notification is being
/// delivered to listeners; only the path that moved the lifecycle out of
/// `Active` may finalise it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active = 0,
    Completing = 1,
    Closed = 2,
}

impl LifecycleState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Completing,
            _ => Self::Closed,
        }
    }
}
