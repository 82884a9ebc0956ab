mod common;

use common::{LONG, config, info, outlet, resolve_one, wait_until};
use core::time::Duration;
use std::sync::Arc;
use strata::{Config, Inlet, InletConfig, InletState, OutletConfig, SampleFormat};

#[test]
fn inlets_follow_a_restarted_outlet() {
    let config = config();
    let stream = || info("Restarted", 1, 0., SampleFormat::Int32, "rec-1");

    let first = outlet(&config, stream(), OutletConfig::default());
    let first_uid = first.info().uid().to_owned();

    let inlet =
        Inlet::new_with_config(&resolve_one(&config, "Restarted"), InletConfig::default(), config.clone())
            .unwrap();
    inlet.open_stream(LONG).unwrap();
    assert!(first.wait_for_consumers(LONG));

    inlet.time_correction(LONG).unwrap();
    assert!(!inlet.was_clock_reset());

    first.push_sample(&[1i32], None, true).unwrap();
    assert_eq!(inlet.pull_sample::<i32>(LONG).unwrap().unwrap().values, [1]);

    drop(first);

    let second = outlet(&config, stream(), OutletConfig::default());
    assert_ne!(second.info().uid(), first_uid);

    // samples pushed before the inlet found the new outlet are lost
    let start = std::time::Instant::now();
    let sample = loop {
        assert!(start.elapsed() < Duration::from_secs(15), "never recovered");

        second.push_sample(&[2i32], None, true).unwrap();

        if let Some(sample) = inlet.pull_sample::<i32>(Some(Duration::from_millis(100))).unwrap() {
            break sample;
        }
    };

    assert_eq!(sample.values, [2]);
    assert_eq!(inlet.state(), InletState::Open);
    assert!(inlet.was_clock_reset());
    assert!(!inlet.was_clock_reset());

    assert_eq!(inlet.info(LONG).unwrap().uid(), second.info().uid());
}

#[test]
fn recovering_inlets_keep_waiting() {
    let config = config();
    let first = outlet(
        &config,
        info("Vanished", 1, 0., SampleFormat::Int8, "gone-1"),
        OutletConfig::default(),
    );

    let inlet =
        Inlet::new_with_config(&resolve_one(&config, "Vanished"), InletConfig::default(), config.clone())
            .unwrap();
    inlet.open_stream(LONG).unwrap();
    assert!(first.wait_for_consumers(LONG));

    drop(first);

    wait_until(Duration::from_secs(5), || {
        inlet.state() == InletState::Reconnecting
    });

    // no error, just no samples
    assert_eq!(
        inlet.pull_sample::<i8>(Some(Duration::from_millis(300))).unwrap(),
        None
    );

    inlet.close_stream();
    assert_eq!(inlet.state(), InletState::Closed);
}

#[test]
fn reconnecting_to_the_same_outlet_reports_a_clock_reset() {
    // heartbeats too rare to keep the watchdog quiet
    let config = Arc::new(Config {
        heartbeat_interval: Duration::from_secs(3),
        connection_timeout: Duration::from_millis(600),
        ..Config::clone(&config())
    });

    let outlet = outlet(
        &config,
        info("Flaky", 1, 0., SampleFormat::Int16, "flaky-1"),
        OutletConfig::default(),
    );

    let inlet =
        Inlet::new_with_config(&resolve_one(&config, "Flaky"), InletConfig::default(), config.clone())
            .unwrap();
    inlet.open_stream(LONG).unwrap();
    assert!(outlet.wait_for_consumers(LONG));
    assert!(!inlet.was_clock_reset());

    wait_until(Duration::from_secs(10), || inlet.was_clock_reset());

    let start = std::time::Instant::now();
    let sample = loop {
        assert!(start.elapsed() < Duration::from_secs(10), "never reconnected");

        outlet.push_sample(&[7i16], None, true).unwrap();

        if let Some(sample) = inlet.pull_sample::<i16>(Some(Duration::from_millis(100))).unwrap() {
            break sample;
        }
    };

    assert_eq!(sample.values, [7]);
    assert_eq!(inlet.info(LONG).unwrap().uid(), outlet.info().uid());
}
