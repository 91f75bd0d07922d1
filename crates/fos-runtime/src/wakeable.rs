//! Wakeable
//!
//! Capability to arrange a future flush of the loop hosting a queue.

use std::sync::Weak;

use fos_base::TimePoint;

/// Something that can be asked to flush its queues no later than a given time
pub trait Wakeable: Send + Sync {
    /// Arrange a flush at or before `time_point`. `TimePoint::max()` means no
    /// pending work is known.
    fn wake_up(&self, time_point: TimePoint);

    /// Wakeup on behalf of a VSync-aligned queue. Loops without a VSync
    /// source treat it as a plain wakeup.
    fn wake_up_by_vsync(&self, time_point: TimePoint) {
        self.wake_up(time_point);
    }
}

/// Address identity of a wakeable, used to answer "is this queue bound here"
pub(crate) fn same_wakeable(weak: &Weak<dyn Wakeable>, wakeable: &dyn Wakeable) -> bool {
    std::ptr::addr_eq(weak.as_ptr(), wakeable as *const dyn Wakeable)
}

#[cfg(test)]
pub(crate) fn downgrade<W: Wakeable + 'static>(wakeable: &std::sync::Arc<W>) -> Weak<dyn Wakeable> {
    let weak: Weak<W> = std::sync::Arc::downgrade(wakeable);
    weak
}
