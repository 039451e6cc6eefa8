//! Periodic read, decode and publish
//!
//! Each cycle is isolated: a failed read or decode skips the cycle without
//! publishing anything, and a failed field publish skips only that field.
//! The sleep between cycles is cancellable through the shutdown channel.

use crate::device::{Connector, DeviceLink, ReadError};
use crate::measurement::{
    MeasurementDecoder, MeasurementError, MeasurementSet, PRIMARY_BLOCK_ADDRESS,
    PRIMARY_BLOCK_LEN, SECONDARY_BLOCK_ADDRESS, SECONDARY_BLOCK_LEN,
};
use crate::observability::metrics::metrics;
use crate::poll_span;
use crate::transport::Publisher;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Why a cycle produced no measurement set
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Failed to read {block} block")]
    Read {
        block: &'static str,
        #[source]
        source: ReadError,
    },
    #[error(transparent)]
    Decode(#[from] MeasurementError),
}

/// Result of one poll cycle
#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every field was offered to the publisher; `failed` of them were rejected
    Published { fields: usize, failed: usize },
    /// A register read failed; nothing was published
    ReadFailed,
    /// Decoding failed; nothing was published
    DecodeFailed,
}

/// Read both register blocks and decode them
///
/// The secondary block is only requested once the primary block is in, so a
/// partial measurement set can never be produced.
pub async fn read_measurements<C: Connector>(
    link: &mut DeviceLink<C>,
) -> Result<MeasurementSet, CycleError> {
    let primary = link
        .read_registers(PRIMARY_BLOCK_ADDRESS, PRIMARY_BLOCK_LEN)
        .await
        .map_err(|source| CycleError::Read {
            block: "primary",
            source,
        })?;

    let secondary = link
        .read_registers(SECONDARY_BLOCK_ADDRESS, SECONDARY_BLOCK_LEN)
        .await
        .map_err(|source| CycleError::Read {
            block: "secondary",
            source,
        })?;

    if MeasurementDecoder::is_all_zero(&primary, &secondary) {
        warn!("Controller reported all-zero registers, readings may be stale");
    }

    Ok(MeasurementDecoder::decode(&primary, &secondary)?)
}

/// Drives the device link and forwards readings to the publisher
pub struct PollLoop<C: Connector, P: Publisher> {
    link: DeviceLink<C>,
    publisher: Arc<P>,
    interval: Duration,
    cycles: u64,
}

impl<C: Connector, P: Publisher> PollLoop<C, P> {
    pub fn new(link: DeviceLink<C>, publisher: Arc<P>, interval: Duration) -> Self {
        Self {
            link,
            publisher,
            interval,
            cycles: 0,
        }
    }

    /// Publish every field of a set; failures are counted, not propagated
    async fn publish_all(publisher: &P, set: &MeasurementSet) -> usize {
        let mut failed = 0;
        for measurement in set.iter() {
            let payload = measurement.value.to_payload();
            match publisher.publish_field(measurement.name, &payload).await {
                Ok(()) => {
                    metrics().record_field_published();
                    debug!(field = measurement.name, value = %payload, "Field published");
                }
                Err(e) => {
                    failed += 1;
                    metrics().record_field_publish_failure();
                    warn!(field = measurement.name, error = %e, "Failed to publish field");
                }
            }
        }
        failed
    }

    /// One read-decode-publish cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        metrics().record_cycle_started();

        let set = match read_measurements(&mut self.link).await {
            Ok(set) => set,
            Err(CycleError::Read { block, source }) => {
                metrics().record_device_read_failure();
                warn!(block = block, error = %source, "Device read failed, skipping cycle");
                return CycleOutcome::ReadFailed;
            }
            Err(CycleError::Decode(e)) => {
                metrics().record_decode_failure();
                warn!(error = %e, "Measurement decode failed, skipping cycle");
                return CycleOutcome::DecodeFailed;
            }
        };

        let failed = Self::publish_all(self.publisher.as_ref(), &set).await;
        metrics().record_cycle_published();
        if failed > 0 {
            warn!(
                fields = set.len(),
                failed = failed,
                "Poll cycle published with failures"
            );
        } else {
            debug!(fields = set.len(), "Poll cycle published");
        }

        CycleOutcome::Published {
            fields: set.len(),
            failed,
        }
    }

    /// Run cycles until shutdown is signalled
    ///
    /// Shutdown is checked before each cycle and interrupts the sleep between
    /// cycles; an in-flight cycle runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            endpoint = %self.link.endpoint(),
            interval_secs = self.interval.as_secs(),
            "Poll loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle = self.cycles + 1;
            self.run_cycle()
                .instrument(poll_span!(cycle = cycle))
                .await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.link.disconnect();
        info!(cycles = self.cycles, "Poll loop stopped");
    }
}
