//! Stream discovery.
//!
//! One-shot resolvers block until enough streams answered, or their timeout elapses, and
//! return whatever they found, possibly nothing. The returned descriptors carry core
//! fields only: use [`Inlet::info`](crate::Inlet::info) to get a stream's metadata tree.

use crate::{Error, Result};
use core::time::Duration;
use std::sync::Arc;
use strata_network::{
    Config,
    resolver::{self, Wanted},
};
use strata_proto::{Expr, StreamInfo, info::CORE_FIELDS, message::Match};

fn wanted(minimum: usize) -> Wanted {
    match minimum {
        0 => Wanted::Window,
        n => Wanted::AtLeast(n),
    }
}

fn property_match(property: &str, value: &str) -> Result<Match> {
    if !CORE_FIELDS.contains(&property) {
        return Err(strata_proto::Error::UnknownProperty(property.to_owned()).into());
    }

    Ok(Match::Property {
        name: property.to_owned(),
        value: value.to_owned(),
    })
}

/// Lists every stream of the session, waiting up to `wait` for the first one to answer,
/// then for answers to settle.
pub fn resolve_all(wait: Option<Duration>) -> Result<Vec<StreamInfo>> {
    resolve_all_with_config(wait, &Config::global())
}

pub fn resolve_all_with_config(wait: Option<Duration>, config: &Config) -> Result<Vec<StreamInfo>> {
    Ok(resolver::resolve(config, Match::All, Wanted::Settled, wait)?)
}

/// Finds streams whose core field `property` equals `value`, waiting up to `timeout` for
/// at least `minimum` of them.
///
/// With a `minimum` of 0, collects the streams answering until answers settle, and
/// returns even if none did.
pub fn resolve_by_property(
    property: &str,
    value: &str,
    minimum: usize,
    timeout: Option<Duration>,
) -> Result<Vec<StreamInfo>> {
    resolve_by_property_with_config(property, value, minimum, timeout, &Config::global())
}

pub fn resolve_by_property_with_config(
    property: &str,
    value: &str,
    minimum: usize,
    timeout: Option<Duration>,
    config: &Config,
) -> Result<Vec<StreamInfo>> {
    let matching = property_match(property, value)?;
    Ok(resolver::resolve(config, matching, wanted(minimum), timeout)?)
}

/// Finds streams satisfying a predicate (see [`Expr`]), waiting up to `timeout` for at
/// least `minimum` of them.
///
/// Fails right away if the predicate doesn't parse.
pub fn resolve_by_predicate(
    predicate: &str,
    minimum: usize,
    timeout: Option<Duration>,
) -> Result<Vec<StreamInfo>> {
    resolve_by_predicate_with_config(predicate, minimum, timeout, &Config::global())
}

pub fn resolve_by_predicate_with_config(
    predicate: &str,
    minimum: usize,
    timeout: Option<Duration>,
    config: &Config,
) -> Result<Vec<StreamInfo>> {
    let matching = Match::Predicate(Expr::parse(predicate)?);
    Ok(resolver::resolve(config, matching, wanted(minimum), timeout)?)
}

/// Returns the first stream found satisfying a predicate.
///
/// Fails with `NotFound` if none answered within `timeout`.
pub fn resolve_first(predicate: &str, timeout: Option<Duration>) -> Result<StreamInfo> {
    resolve_first_with_config(predicate, timeout, &Config::global())
}

pub fn resolve_first_with_config(
    predicate: &str,
    timeout: Option<Duration>,
    config: &Config,
) -> Result<StreamInfo> {
    resolve_by_predicate_with_config(predicate, 1, timeout, config)?
        .into_iter()
        .next()
        .ok_or(Error::NotFound)
}

/// Keeps an up-to-date list of matching streams, in the background.
///
/// A stream stays listed while it keeps answering, and is dropped once it has been silent
/// for `forget_after`.
#[derive(Debug)]
pub struct ContinuousResolver(resolver::ContinuousResolver);

impl ContinuousResolver {
    /// Lists every stream of the session.
    pub fn all(forget_after: Duration) -> Result<Self> {
        Self::all_with_config(forget_after, Config::global())
    }

    pub fn all_with_config(forget_after: Duration, config: Arc<Config>) -> Result<Self> {
        Self::start(config, Match::All, forget_after)
    }

    /// Lists the streams whose core field `property` equals `value`.
    pub fn by_property(property: &str, value: &str, forget_after: Duration) -> Result<Self> {
        Self::by_property_with_config(property, value, forget_after, Config::global())
    }

    pub fn by_property_with_config(
        property: &str,
        value: &str,
        forget_after: Duration,
        config: Arc<Config>,
    ) -> Result<Self> {
        Self::start(config, property_match(property, value)?, forget_after)
    }

    /// Lists the streams satisfying a predicate.
    pub fn by_predicate(predicate: &str, forget_after: Duration) -> Result<Self> {
        Self::by_predicate_with_config(predicate, forget_after, Config::global())
    }

    pub fn by_predicate_with_config(
        predicate: &str,
        forget_after: Duration,
        config: Arc<Config>,
    ) -> Result<Self> {
        Self::start(
            config,
            Match::Predicate(Expr::parse(predicate)?),
            forget_after,
        )
    }

    fn start(config: Arc<Config>, matching: Match, forget_after: Duration) -> Result<Self> {
        if forget_after.is_zero() {
            return Err(Error::InvalidArgument(
                "streams must be remembered for a non-zero duration".into(),
            ));
        }

        Ok(Self(resolver::ContinuousResolver::start(
            config,
            matching,
            forget_after,
        )?))
    }

    /// The streams currently listed, in no particular order.
    #[inline(always)]
    pub fn results(&self) -> Vec<StreamInfo> {
        self.0.results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_of_zero_collects_one_window() {
        assert_eq!(wanted(0), Wanted::Window);
        assert_eq!(wanted(3), Wanted::AtLeast(3));
    }

    #[test]
    fn unknown_properties_fail_fast() {
        assert!(matches!(
            resolve_by_property_with_config("colour", "red", 1, None, &Config::default()),
            Err(Error::Protocol(strata_proto::Error::UnknownProperty(_)))
        ));
        assert!(matches!(
            ContinuousResolver::by_property_with_config(
                "colour",
                "red",
                Duration::from_secs(1),
                Arc::new(Config::default())
            ),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn malformed_predicates_fail_fast() {
        assert!(matches!(
            resolve_by_predicate_with_config("name = ", 1, None, &Config::default()),
            Err(Error::Protocol(strata_proto::Error::Predicate { .. }))
        ));
        assert!(matches!(
            ContinuousResolver::by_predicate_with_config(
                "name='x' and",
                Duration::from_secs(1),
                Arc::new(Config::default())
            ),
            Err(Error::Protocol(_))
        ));
    }
}
