/*!
Real-time plumbing: SCHED_FIFO priorities and page locking for the hot-path
threads. Compiled to no-ops unless the `rt` feature is enabled, so tests
and development hosts need no RT privileges.
*/

#[cfg(feature = "rt")]
pub fn configure_current_thread(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::warn!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(feature = "rt"))]
pub fn configure_current_thread(_priority: i32) {}

#[cfg(feature = "rt")]
pub fn lock_memory() {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        log::warn!("mlockall failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(feature = "rt"))]
pub fn lock_memory() {}
