use plantbus::clock::{Clock, ClockError, ManualClock};
use plantbus::signal::{Quantity, SignalSpec};
use plantbus::{StatusCode, TimeSeriesStore, Value};
use std::sync::Arc;

const KEY: &str = "Device1_Voltage";

#[derive(Debug)]
struct BrokenClock;

impl Clock for BrokenClock {
    fn now_ms(&self) -> Result<u64, ClockError> {
        Err(ClockError::BeforeEpoch)
    }
}

fn store(retention: usize) -> (TimeSeriesStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let mut store = TimeSeriesStore::new(clock.clone());
    for quantity in Quantity::ALL {
        let spec = SignalSpec::for_quantity("Device1", quantity, 100, retention).unwrap();
        assert!(store.register(spec));
    }
    (store, clock)
}

#[test]
fn test_registration_order_and_first_wins() {
    let (mut store, _) = store(10);
    let duplicate = SignalSpec::for_quantity("Device1", Quantity::Voltage, 500, 99).unwrap();
    assert!(!store.register(duplicate));
    assert_eq!(store.spec(KEY).unwrap().retention, 10);

    let keys: Vec<&str> = store.specs().map(|spec| spec.key.as_str()).collect();
    assert_eq!(
        keys,
        vec!["Device1_Temperature", "Device1_Power", "Device1_Voltage", "Device1_Current"]
    );
}

#[test]
fn test_eviction_keeps_most_recent_retention_samples() {
    let retention = 20;
    let extra = 7;
    let (store, clock) = store(retention);

    for i in 0..(retention + extra) as u64 {
        clock.set(i * 1000);
        store.write(KEY, Value::Double(i as f64), i * 1000).unwrap();
    }

    assert_eq!(store.len(KEY), retention);
    let history = store.read_range(KEY, None, None, 0);
    assert_eq!(history.status, StatusCode::Good);
    assert_eq!(history.samples.len(), retention);
    assert_eq!(history.samples[0].value, Some(Value::Double(extra as f64)));
    assert_eq!(
        history.samples.last().unwrap().value,
        Some(Value::Double((retention + extra - 1) as f64))
    );
}

#[test]
fn test_inclusive_range_query() {
    let (store, _) = store(100);
    for t in 1..=8u64 {
        store.write(KEY, Value::Double(t as f64), t).unwrap();
    }

    let history = store.read_range(KEY, Some(3), Some(6), 0);
    assert_eq!(history.status, StatusCode::Good);
    let times: Vec<u64> = history.samples.iter().map(|s| s.source_timestamp).collect();
    assert_eq!(times, vec![3, 4, 5, 6]);
}

#[test]
fn test_max_count_keeps_latest_in_ascending_order() {
    let (store, _) = store(100);
    for t in 1..=8u64 {
        store.write(KEY, Value::Double(t as f64), t).unwrap();
    }

    let history = store.read_range(KEY, Some(2), None, 3);
    let times: Vec<u64> = history.samples.iter().map(|s| s.source_timestamp).collect();
    assert_eq!(times, vec![6, 7, 8]);
}

#[test]
fn test_empty_and_inverted_ranges_report_no_data() {
    let (store, _) = store(100);
    assert_eq!(store.read_range(KEY, None, None, 0).status, StatusCode::BadNoData);

    store.write(KEY, Value::Double(1.0), 10).unwrap();
    let inverted = store.read_range(KEY, Some(20), Some(10), 0);
    assert_eq!(inverted.status, StatusCode::BadNoData);
    assert!(inverted.samples.is_empty());

    let miss = store.read_range(KEY, Some(11), Some(15), 0);
    assert_eq!(miss.status, StatusCode::BadNoData);
}

#[test]
fn test_latest_value_and_placeholders() {
    let (store, clock) = store(100);
    assert_eq!(store.read_latest(KEY).status, StatusCode::BadNoData);
    assert_eq!(store.read_latest("Unknown_Signal").status, StatusCode::BadNoData);
    assert!(store.write("Unknown_Signal", Value::Double(1.0), 1).is_none());

    clock.set(4_200);
    store.write(KEY, Value::Double(221.3), 4_100).unwrap();
    let latest = store.read_latest(KEY);
    assert_eq!(latest.value, Some(Value::Double(221.3)));
    assert_eq!(latest.status, StatusCode::Good);
    assert_eq!(latest.source_timestamp, 4_100);
    assert_eq!(latest.server_timestamp, 4_200);
}

#[test]
fn test_clock_failure_degrades_status() {
    let mut store = TimeSeriesStore::new(Arc::new(BrokenClock));
    store.register(SignalSpec::for_quantity("Device1", Quantity::Voltage, 100, 10).unwrap());

    let sample = store.write(KEY, Value::Double(219.0), 777).unwrap();
    assert_eq!(sample.status, StatusCode::BadInternalError);
    assert_eq!(sample.server_timestamp, 777);
    assert_eq!(store.len(KEY), 1);
}

#[test]
fn test_clear_keeps_registrations() {
    let (store, _) = store(10);
    store.write(KEY, Value::Double(1.0), 1).unwrap();
    store.clear();
    assert_eq!(store.len(KEY), 0);
    assert!(store.contains(KEY));
    assert!(store.write(KEY, Value::Double(2.0), 2).is_some());
}

#[test]
fn test_concurrent_writers_on_distinct_signals() {
    let (store, _) = store(1000);
    let store = Arc::new(store);

    let handles: Vec<_> = ["Device1_Voltage", "Device1_Current", "Device1_Temperature"]
        .into_iter()
        .map(|key| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for t in 0..500u64 {
                    store.write(key, Value::Double(t as f64), t).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for key in ["Device1_Voltage", "Device1_Current", "Device1_Temperature"] {
        let history = store.read_range(key, None, None, 0);
        assert_eq!(history.samples.len(), 500);
        assert!(history
            .samples
            .windows(2)
            .all(|pair| pair[0].source_timestamp < pair[1].source_timestamp));
    }
}
