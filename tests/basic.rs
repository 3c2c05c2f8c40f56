use flowtable::{
    Flow, FlowEndpointStatistics, FlowEndpointType, FlowEndpointsStatistics, FlowTable,
    FlowTableBuilder,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn flow(uuid: &str, start: i64, last: i64) -> Flow {
    Flow::new(uuid).with_times(start, last)
}

fn eth_flow(uuid: &str, ab: (&str, u64), ba: (&str, u64)) -> Flow {
    let side = |(value, bytes): (&str, u64)| FlowEndpointStatistics {
        value: value.to_string(),
        bytes,
        packets: 0,
    };
    Flow::new(uuid)
        .with_layers_path("Ethernet/IPv4/TCP")
        .with_endpoints(
            FlowEndpointType::Ethernet,
            FlowEndpointsStatistics::new(side(ab), side(ba)),
        )
}

fn table_every(secs: u64) -> FlowTable {
    FlowTableBuilder::new()
        .expire_every(Duration::from_secs(secs))
        .build()
}

// ---------------------------------------------------------------------------
// Fundamental API correctness
// ---------------------------------------------------------------------------

#[test]
fn empty_table_describes_itself() {
    let table = FlowTable::new();
    assert!(table.is_empty());
    assert_eq!(table.describe(), "0 flows");
    assert_eq!(table.to_string(), "0 flows");
}

#[test]
fn first_write_wins() {
    let table = FlowTable::new();
    table.update(vec![
        Flow::new("k").with_layers_path("first").with_times(1, 2),
        Flow::new("k").with_layers_path("second").with_times(3, 4),
    ]);
    table.update(vec![Flow::new("k").with_layers_path("third")]);

    assert_eq!(table.len(), 1, "duplicate key must not create a second entry");
    let resident = table.get("k").unwrap();
    assert_eq!(resident.read().layers_path, "first");
    assert_eq!(table.stats().duplicates, 2);
}

#[test]
fn from_flows_prepopulates() {
    let table = FlowTable::from_flows(vec![flow("a", 0, 1), flow("b", 0, 1), flow("a", 5, 6)]);
    assert_eq!(table.len(), 2);
    assert!(table.contains("a") && table.contains("b"));
    assert_eq!(table.get("a").unwrap().read().statistics.start, 0);
}

#[test]
fn get_or_create_reports_creation_once() {
    let table = FlowTable::new();
    let (first, created) = table.get_or_create("k");
    assert!(created);
    let (second, created_again) = table.get_or_create("k");
    assert!(!created_again);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.read().uuid, "k");
}

#[test]
fn ingestion_mutates_in_place() {
    let table = FlowTable::new();
    let (f, _) = table.get_or_create("k");
    f.write().touch(500);
    assert_eq!(table.get("k").unwrap().read().last(), 500);
}

#[test]
fn remove_then_remove_again_is_harmless() {
    init_tracing();
    let table = FlowTable::new();
    table.update(vec![flow("k", 0, 1)]);

    assert!(table.remove("k").is_some());
    assert!(table.remove("k").is_none(), "second removal must only be reported");
    assert!(table.remove("never-existed").is_none());

    let stats = table.stats();
    assert_eq!(stats.removed, 1);
    assert_eq!(stats.stale_removals, 2);
}

#[test]
fn table_is_clone_and_shared() {
    let t1 = FlowTable::new();
    let t2 = t1.clone();
    t1.update(vec![flow("shared", 0, 1)]);
    assert!(t2.contains("shared"), "cloned handle must see the same flows");
}

// ---------------------------------------------------------------------------
// Windowed filter
// ---------------------------------------------------------------------------

#[test]
fn filter_last_selects_trailing_window() {
    let table = FlowTable::new();
    table.update(vec![
        flow("old", 0, 100),
        flow("edge", 0, 140),
        flow("fresh", 0, 190),
    ]);

    let got: HashSet<String> = table
        .filter_last_at(Duration::from_secs(60), 200)
        .iter()
        .map(|f| f.read().uuid.clone())
        .collect();
    let want: HashSet<String> = ["edge", "fresh"].iter().map(|s| s.to_string()).collect();
    assert_eq!(got, want);
}

#[test]
fn filter_last_returns_independent_vector() {
    let table = FlowTable::new();
    table.update(vec![flow("a", 0, 100)]);
    let view = table.filter_last_at(Duration::from_secs(10), 100);
    table.remove("a");
    assert_eq!(view.len(), 1, "snapshot survives eviction");
    assert!(table.is_empty());
}

#[test]
fn filter_last_uses_wall_clock() {
    let now = chrono::Utc::now().timestamp();
    let table = FlowTable::from_flows(vec![flow("recent", now - 5, now), flow("ancient", 0, 1)]);
    let recent = table.filter_last(Duration::from_secs(3600));
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].read().uuid, "recent");
}

// ---------------------------------------------------------------------------
// Expiration
// ---------------------------------------------------------------------------

#[test]
fn sweep_evicts_just_past_the_boundary() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let t = 1_000;
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(60))
        .eviction_listener(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    table.update(vec![flow("f", t - 10, t)]);

    let report = table.sweep(t + 60 - 1);
    assert_eq!(report.expired, 0);
    assert!(table.contains("f"), "flow inside the period must survive");

    let report = table.sweep(t + 60 + 1);
    assert_eq!(report.expired, 1);
    assert!(!table.contains("f"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    table.sweep(t + 600);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "callback fires exactly once");
}

#[test]
fn end_to_end_single_flow_expires() {
    let seen: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(60))
        .eviction_listener(move |e| {
            let last = e.flow().read().last();
            seen2.lock().unwrap().push((e.key().to_string(), last));
        })
        .build();

    table.update(vec![flow("f1", 90, 100)]);
    let report = table.sweep(200);

    assert_eq!(report.threshold, 140);
    assert_eq!(*seen.lock().unwrap(), vec![("f1".to_string(), 100)]);
    assert_eq!(table.len(), 0);
    assert_eq!(table.stats().expired, 1);
}

#[test]
fn sweep_without_listener_still_evicts() {
    let table = table_every(10);
    table.update(vec![flow("a", 0, 1), flow("b", 0, 95)]);
    let report = table.sweep(100);
    assert_eq!(report.expired, 1);
    assert!(table.contains("b"));
}

#[test]
fn listener_may_remove_the_notified_flow() {
    init_tracing();
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(10))
        .eviction_listener(|e| {
            let key = e.key().to_string();
            assert!(e.flows().contains(&key));
            assert!(e.remove().is_some());
        })
        .build();
    table.update(vec![flow("a", 0, 1), flow("b", 0, 2)]);

    let report = table.sweep(100);
    assert_eq!(report.expired, 2);
    assert!(table.is_empty());

    let stats = table.stats();
    assert_eq!(stats.removed, 2);
    assert_eq!(stats.stale_removals, 0, "sweep must not double-report");
}

#[test]
fn panicking_listener_does_not_abort_the_sweep() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(10))
        .eviction_listener(move |e| {
            calls2.fetch_add(1, Ordering::SeqCst);
            if e.key() == "bad" {
                panic!("listener failure");
            }
        })
        .build();
    table.update(vec![flow("bad", 0, 1), flow("good", 0, 1), flow("live", 0, 99)]);

    let report = table.sweep(100);
    assert_eq!(report.expired, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(table.len(), 1);
    assert_eq!(table.stats().listener_panics, 1);

    // The table is still usable afterwards.
    table.update(vec![flow("next", 100, 100)]);
    assert_eq!(table.len(), 2);
}

// ---------------------------------------------------------------------------
// Conversation graph
// ---------------------------------------------------------------------------

#[test]
fn graph_of_empty_table() {
    assert_eq!(
        FlowTable::new().ethernet_conversation_json(),
        r#"{"nodes":[],"links":[]}"#
    );
}

#[test]
fn graph_of_single_flow() {
    let table = FlowTable::from_flows(vec![eth_flow("f", ("aa", 10), ("bb", 20))]);
    let json: serde_json::Value =
        serde_json::from_str(&table.ethernet_conversation_json()).unwrap();

    let names: HashSet<&str> = json["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, HashSet::from(["aa", "bb"]));

    let links = json["links"].as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["value"], 30);
    assert_ne!(links[0]["source"], links[0]["target"]);
}

#[test]
fn graph_is_deterministic() {
    let flows: Vec<Flow> = (0..50)
        .map(|i| eth_flow(&format!("f{i:02}"), (format!("m{}", i % 7).as_str(), i), ("gw", 1)))
        .collect();
    let a = FlowTable::from_flows(flows.clone()).ethernet_conversation_json();
    let b = FlowTable::from_flows(flows.into_iter().rev()).ethernet_conversation_json();
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_get_or_create_creates_once() {
    let table = FlowTable::new();
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let created = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let t = table.clone();
            let b = Arc::clone(&barrier);
            let c = Arc::clone(&created);
            std::thread::spawn(move || {
                b.wait();
                let (_, new) = t.get_or_create("contended");
                if new {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(table.len(), 1);
    assert_eq!(table.stats().created, 1);
}

#[test]
fn concurrent_writers_readers_and_sweeps() {
    let table = table_every(10);
    let mut handles = Vec::new();

    for t in 0..4 {
        let table = table.clone();
        handles.push(std::thread::spawn(move || {
            for j in 0..250 {
                table.update(vec![flow(&format!("t{t}-{j}"), 0, 1000)]);
                let key = format!("t{t}-g{j}");
                let (f, _) = table.get_or_create_with(&key, &1000i64, |k, now| {
                    Flow::new(k).with_times(*now, *now)
                });
                f.write().touch(1000);
            }
        }));
    }
    for _ in 0..2 {
        let table = table.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let _ = table.filter_last_at(Duration::from_secs(5), 1000);
                let _ = table.conversation_graph();
            }
        }));
    }
    {
        let table = table.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                // Nothing is older than the threshold at now = 1000.
                assert_eq!(table.sweep(1000).expired, 0);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(table.len(), 2000);
    assert_eq!(table.sweep(2000).expired, 2000);
    assert!(table.is_empty());
}

#[test]
fn readers_never_see_a_partial_batch() {
    const BATCH: usize = 20_000;
    for round in 0..20 {
        let table = FlowTable::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let table = table.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut partial = 0usize;
                while !done.load(Ordering::Acquire) {
                    let n = table.len();
                    if n != 0 && n != BATCH {
                        partial += 1;
                    }
                }
                partial
            })
        };

        table.update((0..BATCH).map(|i| flow(&format!("r{round}-{i}"), 0, 1)));
        done.store(true, Ordering::Release);

        assert_eq!(reader.join().unwrap(), 0, "reader saw a half-applied batch");
        assert_eq!(table.len(), BATCH);
    }
}

#[test]
fn chunked_update_is_opt_in() {
    let table = FlowTableBuilder::new().max_batch(7).build();
    table.update((0..50).map(|i| flow(&format!("c{i}"), 0, 1)));
    assert_eq!(table.len(), 50);
}

// ---------------------------------------------------------------------------
// Listener re-entering the table
// ---------------------------------------------------------------------------

#[test]
fn listener_calling_locking_remove_does_not_deadlock() {
    init_tracing();
    let slot: Arc<std::sync::OnceLock<FlowTable>> = Arc::new(std::sync::OnceLock::new());
    let slot2 = Arc::clone(&slot);
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(10))
        .eviction_listener(move |e| {
            let t = slot2.get().expect("table registered");
            assert!(t.remove(e.key()).is_none(), "locking remove is refused");
        })
        .build();
    assert!(slot.set(table.clone()).is_ok());
    table.update(vec![flow("a", 0, 1), flow("b", 0, 2)]);

    let report = table.sweep(100);
    assert_eq!(report.expired, 2);
    assert!(table.is_empty());

    let stats = table.stats();
    assert_eq!(stats.listener_panics, 0);
    assert_eq!(stats.stale_removals, 0);
}

#[test]
fn listener_calling_locking_reader_is_contained() {
    let slot: Arc<std::sync::OnceLock<FlowTable>> = Arc::new(std::sync::OnceLock::new());
    let slot2 = Arc::clone(&slot);
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(10))
        .eviction_listener(move |_| {
            if let Some(t) = slot2.get() {
                let _ = t.len();
            }
        })
        .build();
    assert!(slot.set(table.clone()).is_ok());
    table.update(vec![flow("a", 0, 1)]);

    let report = table.sweep(100);
    assert_eq!(report.expired, 1);
    assert_eq!(table.stats().listener_panics, 1);

    // Outside the listener the table is fully usable.
    table.update(vec![flow("b", 100, 100)]);
    assert_eq!(table.len(), 1);
}

#[test]
fn listener_may_use_a_different_table() {
    let archive = FlowTable::new();
    let archive2 = archive.clone();
    let table = FlowTableBuilder::new()
        .expire_every(Duration::from_secs(10))
        .eviction_listener(move |e| {
            let flow = e.flow().read().clone();
            archive2.update(vec![flow]);
        })
        .build();
    table.update(vec![flow("a", 0, 1)]);

    table.sweep(100);
    assert!(table.is_empty());
    assert!(archive.contains("a"));
}
