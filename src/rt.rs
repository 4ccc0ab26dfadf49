//! Best-effort real-time scheduling for the audio and receiver threads

use tracing::warn;

/// SCHED_FIFO priority requested for the relay's hot threads
pub const RT_PRIORITY: i32 = 90;

/// Promote the calling thread to `SCHED_FIFO`.
///
/// Returns false when the scheduler change is denied, which is common
/// without `CAP_SYS_NICE` or an rtprio limit.
pub fn promote_current_thread(priority: i32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
        false
    }
}

/// Promote the calling thread, logging a warning instead of failing.
pub fn promote_or_warn(role: &str) {
    if !promote_current_thread(RT_PRIORITY) {
        warn!(role, "failed to set SCHED_FIFO, continuing with default scheduling");
    }
}
