mod common;

use common::MemoryDatabase;
use sqlobject::plugins::Next;
use sqlobject::prelude::*;
use sqlobject::{
    DeclaredType, Invocation, InvocationWrapper, Marker, MethodDescriptor, Outcome, Plugin,
    RetryPlugin, TimingPlugin,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[sql_object]
trait CounterDao {
    #[sql_query("select count(*) from something")]
    fn count(&self) -> Result<i64>;

    #[sql_update("insert into something (id, name) values (:id, :name)")]
    fn insert(&self, id: i64, name: &str) -> Result<u64>;

    fn greeting(&self) -> Result<String> {
        Ok("hello".to_string())
    }
}

type Log = Arc<Mutex<Vec<String>>>;

/// Records entry and exit of every call it wraps.
struct RecordingPlugin {
    label: &'static str,
    log: Log,
}

struct RecordingWrapper {
    label: &'static str,
    log: Log,
}

impl Plugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        self.label
    }

    fn wrapper_for(
        &self,
        _declared: &DeclaredType,
        _method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>> {
        Some(Arc::new(RecordingWrapper {
            label: self.label,
            log: self.log.clone(),
        }))
    }
}

impl InvocationWrapper for RecordingWrapper {
    fn invoke(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> sqlobject::Result<Outcome> {
        let method = invocation.method().name;
        self.log.lock().unwrap().push(format!("{} enter {}", self.label, method));
        let outcome = next(invocation);
        self.log.lock().unwrap().push(format!("{} exit {}", self.label, method));
        outcome
    }
}

/// Fails the first `failures` statement calls with an engine error, without
/// reaching the connection.
struct FlakyPlugin {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl Plugin for FlakyPlugin {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn wrapper_for(
        &self,
        _declared: &DeclaredType,
        method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>> {
        if !method.markers.iter().any(Marker::is_statement) {
            return None;
        }
        Some(Arc::new(FlakyWrapper {
            failures: self.failures,
            attempts: self.attempts.clone(),
        }))
    }
}

struct FlakyWrapper {
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl InvocationWrapper for FlakyWrapper {
    fn invoke(
        &self,
        invocation: &mut Invocation<'_>,
        next: Next<'_>,
    ) -> sqlobject::Result<Outcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(DbError::Statement {
                context: "flaky".to_string(),
                source: Box::new(DbError::ExecutionError(format!("attempt {} lost", attempt))),
            });
        }
        next(invocation)
    }
}

/// Answers every call itself.
struct ShortCircuit;

impl Plugin for ShortCircuit {
    fn name(&self) -> &'static str {
        "short_circuit"
    }

    fn wrapper_for(
        &self,
        _declared: &DeclaredType,
        method: &MethodDescriptor,
    ) -> Option<Arc<dyn InvocationWrapper>> {
        (method.key.name == "count").then(|| Arc::new(ShortCircuit) as Arc<dyn InvocationWrapper>)
    }
}

impl InvocationWrapper for ShortCircuit {
    fn invoke(
        &self,
        _invocation: &mut Invocation<'_>,
        _next: Next<'_>,
    ) -> sqlobject::Result<Outcome> {
        Ok(Outcome::Value(Value::Integer(42)))
    }
}

fn setup() -> (MemoryDatabase, Dbi) {
    let db = MemoryDatabase::new();
    let dbi = Dbi::new(Arc::new(db.clone()));
    (db, dbi)
}

#[test]
fn test_last_registered_plugin_runs_outermost() {
    let (_db, mut dbi) = setup();
    let log: Log = Arc::default();
    dbi.register_plugin(Arc::new(RecordingPlugin {
        label: "first",
        log: log.clone(),
    }));
    dbi.register_plugin(Arc::new(RecordingPlugin {
        label: "second",
        log: log.clone(),
    }));
    assert_eq!(dbi.plugin_names(), vec!["first", "second"]);

    let handle = dbi.open().unwrap();
    let dao: CounterDaoProxy = dbi.attach(&handle).unwrap();
    assert_eq!(dao.greeting().unwrap(), "hello");

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "second enter greeting",
            "first enter greeting",
            "first exit greeting",
            "second exit greeting",
        ]
    );
}

#[test]
fn test_attached_objects_keep_their_plugins() {
    let (_db, mut dbi) = setup();
    let log: Log = Arc::default();
    let handle = dbi.open().unwrap();
    let before: CounterDaoProxy = dbi.attach(&handle).unwrap();

    dbi.register_plugin(Arc::new(RecordingPlugin {
        label: "late",
        log: log.clone(),
    }));
    let after: CounterDaoProxy = dbi.attach(&handle).unwrap();

    before.count().unwrap();
    assert!(log.lock().unwrap().is_empty());
    after.count().unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn test_wrapper_can_answer_without_the_handler() {
    let (db, mut dbi) = setup();
    dbi.register_plugin(Arc::new(ShortCircuit));
    let handle = dbi.open().unwrap();
    let dao: CounterDaoProxy = dbi.attach(&handle).unwrap();
    db.clear_journal();

    assert_eq!(dao.count().unwrap(), 42);
    assert!(db.journal().is_empty());
    assert_eq!(handle.retain_count().unwrap(), 0);

    // Methods the plugin declined are untouched.
    assert_eq!(dao.insert(1, "a").unwrap(), 1);
}

#[test]
fn test_retry_plugin_repeats_engine_failures() {
    let (db, mut dbi) = setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    dbi.register_plugin(Arc::new(FlakyPlugin {
        failures: 2,
        attempts: attempts.clone(),
    }));
    dbi.register_plugin(Arc::new(RetryPlugin::new(3)));
    let handle = dbi.open().unwrap();
    let dao: CounterDaoProxy = dbi.attach(&handle).unwrap();

    assert_eq!(dao.insert(1, "persistent").unwrap(), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(db.rows(), vec![(1, "persistent".to_string())]);
}

#[test]
fn test_retry_plugin_gives_up_after_max_attempts() {
    let (db, mut dbi) = setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    dbi.register_plugin(Arc::new(FlakyPlugin {
        failures: 5,
        attempts: attempts.clone(),
    }));
    dbi.register_plugin(Arc::new(RetryPlugin::new(2)));
    let handle = dbi.open().unwrap();
    let dao: CounterDaoProxy = dbi.attach(&handle).unwrap();

    let err = dao.insert(1, "never").unwrap_err();
    assert!(matches!(err.root(), DbError::ExecutionError(msg) if msg == "attempt 2 lost"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(db.rows().is_empty());
}

#[test]
fn test_timing_plugin_is_transparent() {
    let (db, mut dbi) = setup();
    dbi.register_plugin(Arc::new(
        TimingPlugin::new().slow_threshold(Duration::from_nanos(1)),
    ));
    let handle = dbi.open().unwrap();
    let dao: CounterDaoProxy = dbi.attach(&handle).unwrap();
    db.insert(1, "a");

    assert_eq!(dao.count().unwrap(), 1);
    assert_eq!(dao.greeting().unwrap(), "hello");
    assert_eq!(handle.retain_count().unwrap(), 0);
}
