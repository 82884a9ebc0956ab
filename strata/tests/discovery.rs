mod common;

use common::{LONG, config, info, outlet, resolve_one, wait_until};
use core::time::Duration;
use std::sync::Arc;
use strata::{Config, ContinuousResolver, Error, OutletConfig, SampleFormat};

#[test]
fn resolves_by_property() {
    let config = config();
    let outlet = outlet(
        &config,
        info("Discovered", 4, 250., SampleFormat::Float32, "disc-1"),
        OutletConfig::default(),
    );

    let found = resolve_one(&config, "Discovered");

    assert_eq!(found.uid(), outlet.info().uid());
    assert_eq!(found.core(), outlet.info().core());
    assert_eq!(found.channel_count(), 4);
    assert_eq!(found.nominal_rate(), 250.);
    assert_eq!(found.format(), SampleFormat::Float32);
    assert_eq!(found.source_id(), "disc-1");
    assert_eq!(found.session_id(), config.session_id);
    assert!(found.endpoint().is_some());
}

#[test]
fn advertisements_carry_no_metadata() {
    let config = config();

    let mut described = info("Described", 1, 0., SampleFormat::Int8, "");
    described.desc_mut().append_child_value("manufacturer", "BioSemi");
    let _outlet = outlet(&config, described, OutletConfig::default());

    // the predicate is evaluated against the full descriptor
    let found = strata::resolve_by_predicate_with_config(
        "desc/manufacturer='BioSemi'",
        1,
        LONG,
        &config,
    )
    .unwrap();

    assert_eq!(found.len(), 1);
    assert!(found[0].desc().is_empty());

    let none = strata::resolve_by_predicate_with_config(
        "desc/manufacturer='Other'",
        1,
        Some(Duration::from_millis(600)),
        &config,
    )
    .unwrap();

    assert!(none.is_empty());
}

#[test]
fn sessions_are_isolated() {
    let config = config();
    let _outlet = outlet(
        &config,
        info("Isolated", 1, 0., SampleFormat::Int8, ""),
        OutletConfig::default(),
    );

    let other = Config::clone(&config).with_session("someone-else");

    let found = strata::resolve_by_property_with_config(
        "name",
        "Isolated",
        1,
        Some(Duration::from_millis(600)),
        &other,
    )
    .unwrap();

    assert!(found.is_empty());
    assert_eq!(resolve_one(&config, "Isolated").name(), "Isolated");
}

#[test]
fn resolve_all_and_first() {
    let config = config();
    let a = outlet(&config, info("A", 1, 0., SampleFormat::Int8, ""), OutletConfig::default());
    let b = outlet(&config, info("B", 2, 0., SampleFormat::Int8, ""), OutletConfig::default());

    let found = strata::resolve_by_property_with_config("type", "Test", 2, LONG, &config).unwrap();
    assert_eq!(found.len(), 2);

    let mut uids: Vec<_> = strata::resolve_all_with_config(LONG, &config)
        .unwrap()
        .into_iter()
        .map(|i| i.uid().to_owned())
        .collect();
    uids.sort();

    let mut expected = vec![a.info().uid().to_owned(), b.info().uid().to_owned()];
    expected.sort();

    assert_eq!(uids, expected);

    let first = strata::resolve_first_with_config("channel_count > 1", LONG, &config).unwrap();
    assert_eq!(first.name(), "B");

    assert!(matches!(
        strata::resolve_first_with_config(
            "name='Missing'",
            Some(Duration::from_millis(500)),
            &config
        ),
        Err(Error::NotFound)
    ));
}

#[test]
fn immediate_resolution_returns_right_away() {
    let config = config();

    let start = std::time::Instant::now();
    let found = strata::resolve_all_with_config(strata::IMMEDIATE, &config).unwrap();

    assert!(found.is_empty());
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn minimum_of_zero_returns_after_one_window() {
    let config = config();
    let _outlet = outlet(&config, info("Windowed", 1, 0., SampleFormat::Int8, ""), OutletConfig::default());

    let start = std::time::Instant::now();
    let found =
        strata::resolve_by_predicate_with_config("name='Nobody'", 0, LONG, &config).unwrap();

    assert!(found.is_empty());
    assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());

    let found = strata::resolve_by_property_with_config("name", "Windowed", 0, None, &config).unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn continuous_resolver_forgets_silent_streams() {
    let config = config();
    let forget_after = Duration::from_secs(1);

    let resolver =
        ContinuousResolver::by_property_with_config("name", "Fleeting", forget_after, config.clone())
            .unwrap();

    let outlet = outlet(
        &config,
        info("Fleeting", 1, 0., SampleFormat::Int8, ""),
        OutletConfig::default(),
    );
    let uid = outlet.info().uid().to_owned();

    let listed = |resolver: &ContinuousResolver| resolver.results().iter().any(|i| i.uid() == uid);

    wait_until(Duration::from_secs(5), || listed(&resolver));

    // stays listed while advertising
    std::thread::sleep(forget_after * 2);
    assert!(listed(&resolver));

    drop(outlet);

    wait_until(forget_after + Duration::from_secs(3), || !listed(&resolver));
}

#[test]
fn continuous_resolver_requires_a_horizon() {
    assert!(matches!(
        ContinuousResolver::all_with_config(Duration::ZERO, Arc::new(Config::default())),
        Err(Error::InvalidArgument(_))
    ));
}
