//! Scheduling parameters for the periodic tasks, kept as data in one place
//! rather than constants scattered through the task bodies.

use embassy_time::Duration;

/// Per-task budget. The run loops consume `period`; `stack_bytes` feeds
/// the executor arena check in the firmware image.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskConfig {
    pub period: Duration,
    /// Scheduling weight, higher preempts lower. The firmware currently
    /// runs one thread-mode executor, so this is budget metadata until the
    /// tasks are split across interrupt executors; it maps onto their
    /// levels then.
    pub priority: u8,
    pub stack_bytes: usize,
}

pub const SENSOR: TaskConfig = TaskConfig {
    period: Duration::from_millis(50),
    priority: 2,
    stack_bytes: 2048,
};

pub const GPS: TaskConfig = TaskConfig {
    period: Duration::from_millis(1000),
    priority: 2,
    stack_bytes: 3072,
};

pub const VARIO: TaskConfig = TaskConfig {
    period: Duration::from_millis(100),
    priority: 3,
    stack_bytes: 2048,
};

pub const TELEMETRY: TaskConfig = TaskConfig {
    period: Duration::from_millis(500),
    priority: 1,
    stack_bytes: 3072,
};
