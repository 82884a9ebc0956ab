//! Stream producers.

use crate::{Error, Result};
use core::num::NonZeroUsize;
use core::time::Duration;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};
use strata_network::{
    Config,
    server::{
        tcp::{FeedServer, QueuedSample},
        udp::{DatagramHandler, Responder, bind_service_socket},
    },
};
use strata_proto::{ChannelValue, StreamInfo};
use strata_utils::{local_clock, queue::BufferLimit};

/// Per-outlet settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutletConfig {
    /// Preferred number of samples per chunk sent to consumers. Consumers may ask for
    /// smaller chunks.
    pub chunk_size: Option<NonZeroUsize>,
    /// Bounds of the queue kept for each consumer. When a consumer falls behind, its
    /// oldest samples are dropped.
    pub buffer: BufferLimit,
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            buffer: BufferLimit::duration(360.),
        }
    }
}

/// Publishes one stream on the network.
///
/// The stream is advertised for as long as the outlet lives. Samples pushed into it are
/// delivered to every inlet subscribed at that time.
#[derive(Debug)]
pub struct Outlet {
    info: StreamInfo,
    feed: FeedServer,
    responder: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Outlet {
    /// Starts advertising a stream, with the process-wide network settings.
    ///
    /// Fails if the descriptor's sample format can't be transported.
    pub fn new(info: StreamInfo, config: OutletConfig) -> Result<Self> {
        Self::new_with_config(info, config, Config::global())
    }

    /// Starts advertising a stream, with explicit network settings.
    pub fn new_with_config(
        mut info: StreamInfo,
        outlet_config: OutletConfig,
        config: Arc<Config>,
    ) -> Result<Self> {
        if !info.format().is_transportable() {
            return Err(Error::InvalidArgument(format!(
                "streams of format `{}` can't be transported",
                info.format()
            )));
        }

        info.assign_identity(&config.session_id, local_clock());

        let service = bind_service_socket(&config)?;
        let service_port = service.local_addr()?.port();

        let feed = FeedServer::start(
            info.clone(),
            config,
            outlet_config.buffer,
            outlet_config.chunk_size,
        )?;

        let stop = Arc::new(AtomicBool::new(false));

        let responder = {
            let stop = stop.clone();
            let mut responder = Responder::new(info.clone(), feed.port(), service_port);
            std::thread::Builder::new()
                .name("strata-responder".into())
                .spawn(move || {
                    if let Err(e) = responder.serve(&service, &stop) {
                        log::warn!("outlet service socket failed: {e}");
                    }
                })?
        };

        log::info!(
            "advertising {} ({}), service port {service_port}, data port {}",
            info.name(),
            info.uid(),
            feed.port()
        );

        Ok(Self {
            info,
            feed,
            responder: Some(responder),
            stop,
        })
    }

    /// The stream's descriptor, with its system-assigned fields filled in.
    #[inline(always)]
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn check_sample<T: ChannelValue>(&self, values: &[T]) -> Result<()> {
        if T::FORMAT != self.info.format() {
            return Err(Error::InvalidArgument(format!(
                "pushing {} values into a {} stream",
                T::FORMAT,
                self.info.format()
            )));
        }

        let channels = self.info.core().channel_count.as_usize();

        if values.len() != channels {
            return Err(Error::InvalidArgument(format!(
                "sample has {} values, the stream has {channels} channels",
                values.len()
            )));
        }

        Ok(())
    }

    /// Pushes one sample, one value per channel.
    ///
    /// `timestamp` defaults to the current local time. With `pushthrough`, the sample is
    /// sent right away instead of waiting for a full chunk.
    pub fn push_sample<T: ChannelValue>(
        &self,
        values: &[T],
        timestamp: Option<f64>,
        pushthrough: bool,
    ) -> Result<()> {
        self.check_sample(values)?;

        let timestamp = timestamp.unwrap_or_else(local_clock);
        self.feed
            .push(&[(timestamp, T::into_values(values.to_vec()))], pushthrough);

        Ok(())
    }

    /// Pushes several samples, sharing one base timestamp (the current local time by
    /// default).
    ///
    /// The base timestamp is that of the last sample. On regular streams, earlier samples
    /// are dated backwards, one sampling period apart. On irregular streams, every sample
    /// gets the base timestamp.
    pub fn push_chunk<T: ChannelValue, S: AsRef<[T]>>(
        &self,
        samples: &[S],
        timestamp: Option<f64>,
        pushthrough: bool,
    ) -> Result<()> {
        let base = timestamp.unwrap_or_else(local_clock);
        let period = self.info.core().nominal_rate.period().unwrap_or(0.);
        let last = samples.len().saturating_sub(1);

        let timestamps: Vec<_> = (0..samples.len())
            .map(|i| base - (last - i) as f64 * period)
            .collect();

        self.push_chunk_stamped(samples, &timestamps, pushthrough)
    }

    /// Pushes several samples, each with its own timestamp.
    ///
    /// Timestamps must not decrease. Nothing is pushed if they do.
    pub fn push_chunk_stamped<T: ChannelValue, S: AsRef<[T]>>(
        &self,
        samples: &[S],
        timestamps: &[f64],
        pushthrough: bool,
    ) -> Result<()> {
        if samples.len() != timestamps.len() {
            return Err(Error::InvalidArgument(format!(
                "{} samples with {} timestamps",
                samples.len(),
                timestamps.len()
            )));
        }

        if let Some(i) = timestamps.windows(2).position(|w| w[1] < w[0]) {
            return Err(Error::InvalidArgument(format!(
                "timestamps decrease at sample {}",
                i + 1
            )));
        }

        for sample in samples {
            self.check_sample(sample.as_ref())?;
        }

        if samples.is_empty() {
            return Ok(());
        }

        let queued: Vec<QueuedSample> = samples
            .iter()
            .zip(timestamps)
            .map(|(s, &t)| (t, T::into_values(s.as_ref().to_vec())))
            .collect();

        self.feed.push(&queued, pushthrough);

        Ok(())
    }

    /// Returns whether at least one inlet is subscribed.
    #[inline(always)]
    pub fn have_consumers(&self) -> bool {
        self.feed.has_consumers()
    }

    /// Waits until at least one inlet is subscribed, or `timeout` elapses. Returns
    /// whether an inlet is subscribed.
    #[inline(always)]
    pub fn wait_for_consumers(&self, timeout: Option<Duration>) -> bool {
        self.feed.wait_for_consumers(timeout)
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(responder) = self.responder.take() {
            let _ = responder.join();
        }

        self.feed.shutdown();

        log::info!("stopped advertising {} ({})", self.info.name(), self.info.uid());
    }
}
