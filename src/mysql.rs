//! Write-back persistence daemon
//!
//! One worker thread owns the database connection and drains two queues: a
//! save queue whose entries are deferred by a configurable delay, and a load
//! queue serviced whenever no save is due. Deferral is what makes the save
//! path cheap for callers: mutating code calls
//! [`pend_for_saving`](MySqlDaemon::pend_for_saving) as often as it likes and
//! the daemon coalesces the burst into a single write.
//!
//! # Coalescing
//!
//! Every persistable object carries an atomic context slot. Each save request
//! stamps a fresh generation number into both the queued entry and the
//! object's slot; by the time an entry comes due, a newer request may have
//! overwritten the slot, in which case the entry is dead and the worker skips
//! it. The newest request always wins and at most one entry per object is
//! live at any moment.
//!
//! # Connection lifecycle
//!
//! The driver itself lives behind [`MySqlConnector`]; the daemon owns
//! reconnect policy. A failed connect retries with exponential backoff
//! starting at 1 ms and doubling up to `database_max_reconn_delay`. A
//! [`MySqlError`] from a save or load logs the code, state and message, then
//! discards the connection so the next operation reconnects.
//!
//! Configuration keys, read once at startup: `database_server`,
//! `database_username`, `database_password`, `database_name`,
//! `database_save_delay` (ms), `database_max_reconn_delay` (ms).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::MySqlError;
use crate::job::JobQueue;
use crate::logtag::{self, LogTag};

/// Connection parameters handed to the connector
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Server URL, e.g. `tcp://localhost:3306`
    pub server: String,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
    /// Schema selected after connecting
    pub schema: String,
}

/// Factory for database connections
///
/// Implemented over the concrete SQL driver by the embedding application;
/// tests substitute an in-memory fake. The daemon calls `connect` from its
/// worker thread only.
pub trait MySqlConnector: Send + 'static {
    /// The driver's connection type
    type Connection: Send + 'static;

    /// Opens a fresh connection and selects the schema
    fn connect(&mut self, settings: &ConnectionSettings) -> Result<Self::Connection, MySqlError>;
}

/// A persistable object the daemon can save and load
///
/// Objects are shared across threads; the daemon only ever calls these
/// methods from its worker thread, holding no queue lock.
pub trait MySqlObject<Conn>: Send + Sync {
    /// Writes the object's current state through the connection
    fn sync_save(&self, connection: &mut Conn) -> Result<(), MySqlError>;

    /// Populates the object from rows matching `filter`
    fn sync_load(&self, connection: &mut Conn, filter: &str) -> Result<(), MySqlError>;

    /// Called after a successful load; subsequent mutations are expected to
    /// schedule saves automatically
    fn enable_auto_saving(&self);

    /// The object's coalescing slot
    ///
    /// Reserved for the daemon; embed one `AtomicU64` per object and return
    /// it here. The stored value identifies the newest pending save request.
    fn context(&self) -> &AtomicU64;
}

/// Shared-ownership alias for queued objects
pub type ObjectRef<Conn> = Arc<dyn MySqlObject<Conn>>;

/// Completion callback for [`MySqlDaemon::pend_for_loading`], delivered
/// through the main-thread job queue
pub type LoadCallback<Conn> = Box<dyn FnOnce(ObjectRef<Conn>) + Send>;

struct SaveItem<Conn> {
    object: Option<ObjectRef<Conn>>,
    deadline: Instant,
    generation: u64,
}

impl<Conn> SaveItem<Conn> {
    fn vacant() -> Self {
        Self {
            object: None,
            deadline: Instant::now(),
            generation: 0,
        }
    }
}

struct LoadItem<Conn> {
    object: Option<ObjectRef<Conn>>,
    filter: String,
    callback: Option<LoadCallback<Conn>>,
}

impl<Conn> LoadItem<Conn> {
    fn vacant() -> Self {
        Self {
            object: None,
            filter: String::new(),
            callback: None,
        }
    }
}

/// Queues plus their free-list pools; nodes shuttle between the two so the
/// steady state allocates nothing.
struct QueueState<Conn> {
    save_queue: VecDeque<SaveItem<Conn>>,
    save_pool: Vec<SaveItem<Conn>>,
    load_queue: VecDeque<LoadItem<Conn>>,
    load_pool: Vec<LoadItem<Conn>>,
    /// True while the worker is executing a claimed operation
    in_flight: bool,
}

impl<Conn> QueueState<Conn> {
    fn new() -> Self {
        Self {
            save_queue: VecDeque::new(),
            save_pool: Vec::new(),
            load_queue: VecDeque::new(),
            load_pool: Vec::new(),
            in_flight: false,
        }
    }

    fn recycle_save(&mut self, mut item: SaveItem<Conn>) {
        item.object = None;
        item.generation = 0;
        self.save_pool.push(item);
    }

    fn recycle_load(&mut self, mut item: LoadItem<Conn>) {
        item.object = None;
        item.filter.clear();
        item.callback = None;
        self.load_pool.push(item);
    }

    fn drained(&self) -> bool {
        self.save_queue.is_empty() && self.load_queue.is_empty()
    }
}

struct Shared<Conn> {
    state: Mutex<QueueState<Conn>>,
    new_object_avail: Condvar,
    queue_empty: Condvar,
    running: AtomicBool,
    generation: AtomicU64,
}

enum Work<Conn> {
    Save(ObjectRef<Conn>),
    Load(ObjectRef<Conn>, String, Option<LoadCallback<Conn>>),
}

/// At most one daemon may run per process; a second start is a programming
/// error severe enough to abort.
static DAEMON_RUNNING: AtomicBool = AtomicBool::new(false);

/// All condition waits are bounded so shutdown is observed within a second.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// The asynchronous persistence daemon
///
/// Start one per process; the worker thread carries the
/// [`LogTag::MySql`] tag.
pub struct MySqlDaemon<C: MySqlConnector> {
    shared: Arc<Shared<C::Connection>>,
    save_delay: Duration,
    thread: Option<JoinHandle<()>>,
}

impl<C: MySqlConnector> std::fmt::Debug for MySqlDaemon<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlDaemon")
            .field("save_delay", &self.save_delay)
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<C: MySqlConnector> MySqlDaemon<C> {
    /// Reads the database knobs from `config` and spawns the worker thread
    ///
    /// Load completions are delivered through `jobs`. Aborts the process if a
    /// daemon is already running.
    pub fn start(config: &Config, connector: C, jobs: Arc<JobQueue>) -> MySqlDaemon<C> {
        if DAEMON_RUNNING.swap(true, Ordering::AcqRel) {
            log::error!("only one MySQL daemon is allowed at the same time.");
            std::process::abort();
        }
        log::info!("starting MySQL daemon...");

        let settings = ConnectionSettings {
            server: config.get_str("database_server", "tcp://localhost:3306"),
            username: config.get_str("database_username", "root"),
            password: config.get_str("database_password", "root"),
            schema: config.get_str("database_name", "test"),
        };
        let save_delay = Duration::from_millis(config.get_u64("database_save_delay", 5000));
        let max_reconn_delay = config.get_u64("database_max_reconn_delay", 60000);
        log::debug!("MySQL server = {}", settings.server);
        log::debug!("MySQL username = {}", settings.username);
        log::debug!("MySQL database name = {}", settings.schema);
        log::debug!("MySQL save delay = {} ms", save_delay.as_millis());
        log::debug!("MySQL max reconnect delay = {max_reconn_delay} ms");

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::new()),
            new_object_avail: Condvar::new(),
            queue_empty: Condvar::new(),
            running: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("mysql".to_owned())
            .spawn(move || {
                logtag::set_thread_tag(LogTag::MySql);
                thread_main::<C>(thread_shared, connector, settings, max_reconn_delay, jobs);
            })
            .expect("failed to spawn MySQL daemon thread");

        MySqlDaemon {
            shared,
            save_delay,
            thread: Some(thread),
        }
    }

    /// Schedules a save of `object`, superseding any earlier pending save
    ///
    /// The write happens on the worker thread no earlier than
    /// `database_save_delay` from now; until then further calls for the same
    /// object collapse into the newest one.
    pub fn pend_for_saving(&self, object: ObjectRef<C::Connection>) {
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        object.context().store(generation, Ordering::Release);
        let deadline = Instant::now() + self.save_delay;

        let mut state = self.shared.state.lock().unwrap();
        let mut item = state.save_pool.pop().unwrap_or_else(SaveItem::vacant);
        item.object = Some(object);
        item.deadline = deadline;
        item.generation = generation;
        state.save_queue.push_back(item);
        self.shared.new_object_avail.notify_all();
    }

    /// Schedules a load of `object` from rows matching `filter`
    ///
    /// After the load succeeds the object's auto-saving is enabled and
    /// `callback`, if any, is pended on the job queue with the loaded object.
    pub fn pend_for_loading(
        &self,
        object: ObjectRef<C::Connection>,
        filter: &str,
        callback: Option<LoadCallback<C::Connection>>,
    ) {
        let mut state = self.shared.state.lock().unwrap();
        let mut item = state.load_pool.pop().unwrap_or_else(LoadItem::vacant);
        item.object = Some(object);
        item.filter.push_str(filter);
        item.callback = callback;
        state.load_queue.push_back(item);
        self.shared.new_object_avail.notify_all();
    }

    /// Blocks until both queues are empty and no operation is executing
    pub fn wait_for_all_async_operations(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while !(state.drained() && !state.in_flight) {
            let (guard, _) = self
                .shared
                .queue_empty
                .wait_timeout(state, WAIT_SLICE)
                .unwrap();
            state = guard;
        }
    }

    /// Stops the worker, flushing queued work first, and joins it
    pub fn stop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        log::info!("stopping MySQL daemon...");
        self.shared.running.store(false, Ordering::Release);
        {
            let _state = self.shared.state.lock().unwrap();
            self.shared.new_object_avail.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        DAEMON_RUNNING.store(false, Ordering::Release);
    }
}

impl<C: MySqlConnector> Drop for MySqlDaemon<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn thread_main<C: MySqlConnector>(
    shared: Arc<Shared<C::Connection>>,
    mut connector: C,
    settings: ConnectionSettings,
    max_reconn_delay: u64,
    jobs: Arc<JobQueue>,
) {
    log::info!("MySQL daemon started.");

    let mut connection: Option<C::Connection> = None;
    loop {
        if connection.is_none() {
            connection = connect_with_backoff(&mut connector, &settings, &shared, max_reconn_delay);
            if connection.is_none() {
                // Stopped while reconnecting.
                break;
            }
        }

        let Some(work) = claim_work(&shared) else {
            break;
        };

        let Some(conn) = connection.as_mut() else {
            shared.state.lock().unwrap().in_flight = false;
            break;
        };
        let result = match work {
            Work::Save(object) => object.sync_save(conn),
            Work::Load(object, filter, callback) => match object.sync_load(conn, &filter) {
                Ok(()) => {
                    object.enable_auto_saving();
                    if let Some(callback) = callback {
                        jobs.pend(move || callback(object));
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            log::error!("SQL error in MySQL daemon: {e}");
            log::info!("the connection was left in an indeterminate state, discarding it.");
            connection = None;
        }

        let mut state = shared.state.lock().unwrap();
        state.in_flight = false;
        if state.drained() {
            shared.queue_empty.notify_all();
        }
    }

    log::info!("MySQL daemon stopped.");
}

/// Pops the next operation, blocking with bounded waits until one is ready.
/// Returns `None` when the daemon should exit: stopped, with both queues
/// empty.
fn claim_work<Conn>(shared: &Shared<Conn>) -> Option<Work<Conn>> {
    let mut state = shared.state.lock().unwrap();
    loop {
        let running = shared.running.load(Ordering::Acquire);
        let now = Instant::now();

        // An overdue save is claimed first. Once stopping, deferral no longer
        // applies: queued saves flush immediately.
        let head_due = state
            .save_queue
            .front()
            .is_some_and(|item| item.deadline <= now || !running);
        if head_due {
            let mut item = state.save_queue.pop_front().unwrap();
            let object = item.object.take();
            let generation = item.generation;
            state.recycle_save(item);
            match object {
                Some(object) if object.context().load(Ordering::Acquire) == generation => {
                    state.in_flight = true;
                    return Some(Work::Save(object));
                }
                _ => {
                    log::debug!("dropping superseded save entry");
                    if state.drained() {
                        shared.queue_empty.notify_all();
                    }
                    continue;
                }
            }
        }

        // No save is due; service loads so pending deadlines cannot starve
        // them.
        if let Some(mut item) = state.load_queue.pop_front() {
            let object = item.object.take();
            let filter = std::mem::take(&mut item.filter);
            let callback = item.callback.take();
            state.recycle_load(item);
            if let Some(object) = object {
                state.in_flight = true;
                return Some(Work::Load(object, filter, callback));
            }
            continue;
        }

        if !running && state.save_queue.is_empty() {
            return None;
        }

        let (guard, _) = shared
            .new_object_avail
            .wait_timeout(state, WAIT_SLICE)
            .unwrap();
        state = guard;
    }
}

fn connect_with_backoff<C: MySqlConnector>(
    connector: &mut C,
    settings: &ConnectionSettings,
    shared: &Shared<C::Connection>,
    max_delay_ms: u64,
) -> Option<C::Connection> {
    log::info!("connecting to MySQL server...");

    let mut delay_ms = 0u64;
    loop {
        match connector.connect(settings) {
            Ok(connection) => {
                log::info!("successfully connected to MySQL server.");
                return Some(connection);
            }
            Err(e) => {
                log::error!("error connecting to MySQL server: {e}");
            }
        }

        delay_ms = next_reconnect_delay(delay_ms, max_delay_ms);
        log::info!("will retry after {delay_ms} milliseconds.");

        // Sleep in slices so a stop request interrupts the backoff.
        let mut remaining = delay_ms;
        while remaining > 0 {
            if !shared.running.load(Ordering::Acquire) {
                return None;
            }
            let slice = remaining.min(1000);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
        if !shared.running.load(Ordering::Acquire) {
            return None;
        }
    }
}

/// Exponential backoff: 1 ms doubling up to `max_ms`.
fn next_reconnect_delay(prev_ms: u64, max_ms: u64) -> u64 {
    if prev_ms == 0 {
        1
    } else {
        prev_ms.saturating_mul(2).min(max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// Daemon tests share the process-wide single-daemon slot, so they run
    /// one at a time.
    static DAEMON_TEST_GUARD: Mutex<()> = Mutex::new(());

    fn guard() -> std::sync::MutexGuard<'static, ()> {
        let _ = env_logger::builder().is_test(true).try_init();
        DAEMON_TEST_GUARD
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    struct TestConnector {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl TestConnector {
        fn reliable() -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    attempts: Arc::clone(&attempts),
                    fail_first: 0,
                },
                attempts,
            )
        }
    }

    impl MySqlConnector for TestConnector {
        type Connection = ();

        fn connect(&mut self, _settings: &ConnectionSettings) -> Result<(), MySqlError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                Err(MySqlError::new("test", 2003, "HY000", "server unreachable"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct TestObject {
        context: AtomicU64,
        saves: AtomicUsize,
        fail_saves: AtomicUsize,
        loaded_filter: Mutex<Option<String>>,
        auto_saving: AtomicBool,
    }

    impl MySqlObject<()> for TestObject {
        fn sync_save(&self, _connection: &mut ()) -> Result<(), MySqlError> {
            if self.fail_saves.load(Ordering::SeqCst) > 0 {
                self.fail_saves.fetch_sub(1, Ordering::SeqCst);
                return Err(MySqlError::new("test", 1205, "HY000", "lock wait timeout"));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn sync_load(&self, _connection: &mut (), filter: &str) -> Result<(), MySqlError> {
            *self.loaded_filter.lock().unwrap() = Some(filter.to_owned());
            Ok(())
        }

        fn enable_auto_saving(&self) {
            self.auto_saving.store(true, Ordering::SeqCst);
        }

        fn context(&self) -> &AtomicU64 {
            &self.context
        }
    }

    fn test_config(save_delay_ms: u64) -> Config {
        Config::from_pairs([
            ("database_save_delay", save_delay_ms.to_string()),
            ("database_max_reconn_delay", "50".to_owned()),
        ])
    }

    #[test]
    fn test_two_quick_saves_coalesce_into_one_write() {
        let _guard = guard();
        let (connector, _) = TestConnector::reliable();
        let jobs = Arc::new(JobQueue::new());
        let mut daemon = MySqlDaemon::start(&test_config(100), connector, jobs);

        let object = Arc::new(TestObject::default());
        daemon.pend_for_saving(object.clone());
        daemon.pend_for_saving(object.clone());
        daemon.wait_for_all_async_operations();
        daemon.stop();

        assert_eq!(object.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_enables_auto_saving_and_pends_completion_job() {
        let _guard = guard();
        let (connector, _) = TestConnector::reliable();
        let jobs = Arc::new(JobQueue::new());
        let mut daemon = MySqlDaemon::start(&test_config(0), connector, Arc::clone(&jobs));

        let object = Arc::new(TestObject::default());
        let (tx, rx) = mpsc::channel();
        daemon.pend_for_loading(
            object.clone(),
            "account_id = 42",
            Some(Box::new(move |loaded| {
                tx.send(Arc::strong_count(&loaded) > 0).unwrap();
            })),
        );
        daemon.wait_for_all_async_operations();

        // The completion runs only once the main thread drains the queue.
        assert!(rx.try_recv().is_err());
        assert_eq!(jobs.perform_all(), 1);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());

        assert_eq!(
            object.loaded_filter.lock().unwrap().as_deref(),
            Some("account_id = 42")
        );
        assert!(object.auto_saving.load(Ordering::SeqCst));
        daemon.stop();
    }

    #[test]
    fn test_sql_error_forces_reconnect_and_next_save_succeeds() {
        let _guard = guard();
        let (connector, attempts) = TestConnector::reliable();
        let jobs = Arc::new(JobQueue::new());
        let mut daemon = MySqlDaemon::start(&test_config(0), connector, jobs);

        let object = Arc::new(TestObject::default());
        object.fail_saves.store(1, Ordering::SeqCst);
        daemon.pend_for_saving(object.clone());
        daemon.wait_for_all_async_operations();

        daemon.pend_for_saving(object.clone());
        daemon.wait_for_all_async_operations();
        daemon.stop();

        assert_eq!(object.saves.load(Ordering::SeqCst), 1);
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_stop_flushes_saves_whose_deadline_is_still_ahead() {
        let _guard = guard();
        let (connector, _) = TestConnector::reliable();
        let jobs = Arc::new(JobQueue::new());
        let mut daemon = MySqlDaemon::start(&test_config(3_600_000), connector, jobs);

        let object = Arc::new(TestObject::default());
        daemon.pend_for_saving(object.clone());
        daemon.stop();

        assert_eq!(object.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_retries_until_server_appears() {
        let _guard = guard();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = TestConnector {
            attempts: Arc::clone(&attempts),
            fail_first: 3,
        };
        let jobs = Arc::new(JobQueue::new());
        let mut daemon = MySqlDaemon::start(&test_config(0), connector, jobs);

        let object = Arc::new(TestObject::default());
        daemon.pend_for_saving(object.clone());
        daemon.wait_for_all_async_operations();
        daemon.stop();

        assert_eq!(object.saves.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_reconnect_delays_double_up_to_the_cap() {
        let mut delays = Vec::new();
        let mut delay = 0u64;
        for _ in 0..18 {
            delay = next_reconnect_delay(delay, 60000);
            delays.push(delay);
        }
        let expected: Vec<u64> = (0..16)
            .map(|i| 1u64 << i)
            .chain([60000, 60000])
            .collect();
        assert_eq!(delays, expected);
    }
}
