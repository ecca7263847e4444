//! Per-thread log tags
//!
//! Every framework thread carries a tag identifying which subsystem it
//! belongs to. Records are emitted through the [`log`] facade; the embedding
//! application's sink can query [`thread_tag`] inside its formatter to print
//! the tag alongside each record, since `log` formats records on the emitting
//! thread. The level threshold also belongs to the embedding application
//! (`log::set_max_level`), so records below it cost a single branch at the
//! call site.

use std::cell::Cell;

/// Identifies the subsystem a framework thread belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogTag {
    /// The main thread, which drains the job queue and runs user callbacks
    Primary,
    /// The database daemon worker thread
    MySql,
    /// The timer daemon thread
    Timer,
    /// The readiness event loop thread
    Epoll,
}

impl LogTag {
    /// Fixed-width, lowercase name suitable for log prefixes
    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::Primary => "primary",
            LogTag::MySql => "mysql",
            LogTag::Timer => "timer",
            LogTag::Epoll => "epoll",
        }
    }
}

thread_local! {
    static THREAD_TAG: Cell<LogTag> = const { Cell::new(LogTag::Primary) };
}

/// Sets the calling thread's log tag
///
/// Framework threads call this once at startup. Threads that never set a tag
/// report [`LogTag::Primary`].
pub fn set_thread_tag(tag: LogTag) {
    THREAD_TAG.with(|t| t.set(tag));
}

/// Returns the calling thread's log tag
pub fn thread_tag() -> LogTag {
    THREAD_TAG.with(|t| t.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tag_is_primary() {
        std::thread::spawn(|| {
            assert_eq!(thread_tag(), LogTag::Primary);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_tag_is_per_thread() {
        set_thread_tag(LogTag::Epoll);
        let other = std::thread::spawn(|| {
            set_thread_tag(LogTag::MySql);
            thread_tag()
        })
        .join()
        .unwrap();
        assert_eq!(other, LogTag::MySql);
        assert_eq!(thread_tag(), LogTag::Epoll);
        set_thread_tag(LogTag::Primary);
    }
}
