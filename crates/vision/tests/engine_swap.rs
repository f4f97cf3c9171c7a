mod common;

use std::{thread, time::Duration};

use common::{Gate, TIMEOUT, rig, wait_until};
use ml_core::{DeviceConfig, ExecutionDevice, ModelVariant};
use vision::{ConfigurationError, ConfigureError, EngineState, PresentationEvent};

#[test]
fn swap_waits_for_the_in_flight_classification() {
    let gate = Gate::closed();
    let mut rig = rig(gate.clone(), TIMEOUT);
    rig.binder.activate().unwrap();

    assert!(rig.feed.push(1));
    assert!(wait_until(|| gate.entered() == 1));

    let engines = rig.engines.clone();
    let swap = thread::spawn(move || engines.configure(DeviceConfig::default().with_threads(4)));
    thread::sleep(Duration::from_millis(50));
    assert!(!swap.is_finished());
    assert_eq!(rig.factory.ledger.lock().unwrap().created, [1]);

    gate.open();
    let second = swap.join().unwrap().unwrap();
    assert_eq!(rig.engines.state(), EngineState::Ready(second));
    {
        // The old engine is gone by the time configure returns.
        let ledger = rig.factory.ledger.lock().unwrap();
        assert_eq!(ledger.closed.get(&1), Some(&1));
        assert_eq!(ledger.live(), 1);
    }

    let event = rig.rx.recv_timeout(TIMEOUT).expect("in-flight result");
    match event {
        PresentationEvent::Result(published) => assert_eq!(published.recognition.id, "1"),
        other => panic!("expected a result, got {other:?}"),
    }

    // The next frame runs on the new engine.
    assert!(rig.feed.push(2));
    match rig.rx.recv_timeout(TIMEOUT) {
        Some(PresentationEvent::Result(published)) => assert_eq!(published.recognition.id, "2"),
        other => panic!("expected a result, got {other:?}"),
    }

    rig.binder.shutdown().unwrap();
    let ledger = rig.factory.ledger.lock().unwrap();
    assert_eq!(ledger.created, [1, 2]);
    assert_eq!(ledger.closed_in_use, 0);
    assert_eq!(rig.factory.max_concurrent(), 1);
    assert!(ledger.closed.values().all(|count| *count == 1));
    assert_eq!(ledger.closed.len(), 2);
}

#[test]
fn rejected_configuration_keeps_classifying_on_the_old_engine() {
    let mut rig = rig(Gate::opened(), TIMEOUT);
    let EngineState::Ready(first) = rig.engines.state() else {
        panic!("rig starts configured");
    };
    rig.binder.activate().unwrap();

    let quantized_gpu = DeviceConfig::new(ModelVariant::Quantized, ExecutionDevice::Gpu, 2);
    let err = rig.binder.configure(quantized_gpu).unwrap_err();
    assert!(matches!(
        err,
        ConfigureError::Configuration(ConfigurationError::GpuUnavailable)
    ));
    assert_eq!(err.to_string(), "GPU acceleration unavailable.");
    assert_eq!(rig.engines.state(), EngineState::Ready(first));

    assert!(rig.feed.push(10));
    match rig.rx.recv_timeout(TIMEOUT) {
        Some(PresentationEvent::Result(published)) => {
            assert_eq!(published.recognition.id, first.get().to_string());
            assert_eq!(published.to_string(), "[1] cat (82.0%)");
        }
        other => panic!("expected a result, got {other:?}"),
    }
    rig.binder.deactivate().unwrap();
}

#[test]
fn low_confidence_results_clear_the_display() {
    let mut rig = rig(Gate::opened(), TIMEOUT);
    rig.factory.set_output("cat", 0.4);
    rig.binder
        .configure(DeviceConfig::default().with_threads(1))
        .unwrap();
    rig.binder.activate().unwrap();

    assert!(rig.feed.push(3));
    assert_eq!(
        rig.rx.recv_timeout(TIMEOUT),
        Some(PresentationEvent::Clear { timestamp_ms: 3 })
    );
    rig.binder.deactivate().unwrap();
}

#[test]
fn frames_without_an_engine_are_skipped() {
    let mut rig = rig(Gate::opened(), TIMEOUT);
    assert!(rig.engines.close());
    rig.binder.activate().unwrap();

    assert!(rig.feed.push(1));
    assert!(wait_until(|| rig.binder.stats().skipped_no_engine == 1));
    assert!(rig.rx.try_iter().next().is_none());

    rig.binder.configure(DeviceConfig::default()).unwrap();
    assert!(rig.feed.push(2));
    let event = rig.rx.recv_timeout(TIMEOUT).expect("result once configured");
    assert_eq!(event.timestamp_ms(), 2);
    rig.binder.deactivate().unwrap();
}
