use plantbus::clock::ManualClock;
use plantbus::device::DeviceProfile;
use plantbus::{Plant, Sample, StatusCode, SubscriptionParams, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const KEY: &str = "Device2_Voltage";

fn plant() -> (Plant, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(10_000));
    let plant = Plant::build(&DeviceProfile::defaults(), 1000, 100, 100_000, clock.clone()).unwrap();
    (plant, clock)
}

fn write(plant: &Plant, value: f64, ts: u64) -> Sample {
    let sample = plant.store.write(KEY, Value::Double(value), ts).unwrap();
    plant.hub.publish(KEY, sample);
    sample
}

#[test]
fn test_slow_consumer_sees_most_recent_values() {
    let (plant, _) = plant();
    let params = SubscriptionParams {
        sampling_interval_ms: 100,
        queue_depth: 3,
        discard_oldest: true,
    };
    let handle = plant.hub.subscribe(KEY, params).unwrap();
    assert_eq!(handle.pending(), 0);

    for (i, value) in [30.1, 30.4, 30.9, 31.2, 31.0].into_iter().enumerate() {
        write(&plant, value, 10_000 + i as u64 * 10);
    }

    let notification = handle.try_drain().unwrap();
    let values: Vec<Option<Value>> = notification.samples.iter().map(|s| s.value).collect();
    assert_eq!(
        values,
        vec![
            Some(Value::Double(30.9)),
            Some(Value::Double(31.2)),
            Some(Value::Double(31.0))
        ]
    );
    assert!(notification.overflow);
    assert_eq!(notification.dropped, 2);
    assert!(handle.try_drain().is_none());
}

#[test]
fn test_each_subscriber_gets_its_own_queue() {
    let (plant, _) = plant();
    let wide = plant
        .hub
        .subscribe(KEY, SubscriptionParams::default())
        .unwrap();
    let narrow = plant
        .hub
        .subscribe(
            KEY,
            SubscriptionParams {
                queue_depth: 1,
                ..SubscriptionParams::default()
            },
        )
        .unwrap();
    assert_ne!(wide.id(), narrow.id());

    for i in 0..4 {
        write(&plant, 40.0 + i as f64, 10_000 + i);
    }
    assert_eq!(wide.pending(), 4);
    assert_eq!(narrow.peek().len(), 1);
    assert_eq!(narrow.peek()[0].value, Some(Value::Double(43.0)));
    assert_eq!(plant.hub.subscription_count(), 2);
}

#[test]
fn test_gateway_write_notifies_subscribers() {
    let (plant, _) = plant();
    let handle = plant
        .gateway
        .subscribe("Device4_Power", SubscriptionParams::default())
        .unwrap();

    assert!(plant.gateway.write("Device4_Power", Value::Boolean(true)).success);
    let rejected = plant.gateway.write("Device4_Voltage", Value::Double(1.0));
    assert_eq!(rejected.status, StatusCode::BadNotWritable);

    let notification = handle.try_drain().unwrap();
    assert_eq!(notification.samples.len(), 1);
    assert_eq!(notification.samples[0].value, Some(Value::Boolean(true)));
    assert!(!notification.overflow);
}

#[tokio::test]
async fn test_next_waits_for_new_values() {
    let (plant, _) = plant();
    let plant = Arc::new(plant);
    let handle = plant.hub.subscribe(KEY, SubscriptionParams::default()).unwrap();

    let writer = Arc::clone(&plant);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        write(&writer, 55.5, 10_500);
    });

    let notification = tokio::time::timeout(Duration::from_secs(2), handle.next())
        .await
        .expect("notification in time")
        .expect("subscription open");
    assert_eq!(notification.signal.as_str(), KEY);
    assert_eq!(notification.samples[0].value, Some(Value::Double(55.5)));
}

#[tokio::test]
async fn test_next_paces_by_sampling_interval() {
    let (plant, _) = plant();
    let params = SubscriptionParams {
        sampling_interval_ms: 200,
        queue_depth: 10,
        discard_oldest: true,
    };
    let handle = plant.hub.subscribe(KEY, params).unwrap();

    write(&plant, 1.0, 10_001);
    let first = handle.next().await.unwrap();
    assert_eq!(first.samples.len(), 1);
    let delivered_at = Instant::now();

    write(&plant, 2.0, 10_002);
    write(&plant, 3.0, 10_003);
    let second = handle.next().await.unwrap();
    assert!(delivered_at.elapsed() >= Duration::from_millis(150));
    assert_eq!(second.samples.len(), 2);
}

#[tokio::test]
async fn test_unsubscribe_ends_pending_next() {
    let (plant, _) = plant();
    let plant = Arc::new(plant);
    let handle = plant.hub.subscribe(KEY, SubscriptionParams::default()).unwrap();
    let id = handle.id();

    let waiter = tokio::spawn(async move { handle.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(plant.hub.unsubscribe(id));

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter finished")
        .unwrap();
    assert!(result.is_none());
    assert_eq!(plant.hub.publish(KEY, Sample::good(Value::Double(1.0), 1, 1)), 0);
}

#[test]
fn test_reaper_releases_idle_subscriptions() {
    let clock = Arc::new(ManualClock::new(0));
    let plant = Plant::build(&DeviceProfile::defaults(), 10, 100, 1_000, clock.clone()).unwrap();
    let handle = plant.hub.subscribe(KEY, SubscriptionParams::default()).unwrap();

    clock.advance(500);
    assert!(plant.hub.reap_idle().is_empty());
    clock.advance(600);
    assert_eq!(plant.hub.reap_idle(), vec![handle.id()]);
    assert!(handle.is_closed());
    assert!(!plant.hub.has_subscribers(KEY));
}

#[test]
fn test_subscribing_during_writes_misses_no_value() {
    let (plant, _) = plant();
    let params = SubscriptionParams {
        sampling_interval_ms: 100,
        queue_depth: 2_500,
        discard_oldest: true,
    };
    let last = 2_000u64;

    let handles = std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for i in 1..=last {
                write(&plant, i as f64, 10_000 + i);
            }
        });
        let mut handles = Vec::new();
        while !writer.is_finished() && handles.len() < 200 {
            handles.push(plant.hub.subscribe(KEY, params).unwrap());
        }
        handles
    });

    for handle in &handles {
        let mut values: Vec<f64> = handle
            .peek()
            .iter()
            .filter_map(|s| match s.value {
                Some(Value::Double(v)) => Some(v),
                _ => None,
            })
            .collect();
        // A value written while subscribing may arrive as both the initial
        // value and the first change.
        values.dedup();
        assert_eq!(values.last().copied(), Some(last as f64));
        assert!(values.windows(2).all(|pair| pair[1] - pair[0] == 1.0), "gap in {:?}", values);
    }
}
