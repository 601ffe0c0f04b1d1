//! Fan-out execution
//!
//! Sends one logical command to a set of devices concurrently and joins all
//! outcomes. The result is unanimous: either every device succeeded, or one
//! aggregated failure naming each failing device. There is no rollback of
//! devices that did succeed.

use super::device::{
    CommandKind, CommandResponse, DeviceAddress, DeviceCommand, DeviceLink, LinkError,
};
use super::error::NotchError;
use super::registry::NetworkMember;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default bound on concurrently outstanding device commands
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// One device's share of a fan-out
#[derive(Clone)]
pub struct FanOutRequest {
    pub address: DeviceAddress,
    pub link: Arc<dyn DeviceLink>,
    pub command: DeviceCommand,
}

impl FanOutRequest {
    /// Request for a bound network member
    pub fn for_member(member: &NetworkMember, command: DeviceCommand) -> Self {
        Self {
            address: member.address().clone(),
            link: member.link.clone(),
            command,
        }
    }
}

impl fmt::Debug for FanOutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutRequest")
            .field("address", &self.address)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Build one request per member
pub fn requests_for<F>(members: &[NetworkMember], mut build: F) -> Vec<FanOutRequest>
where
    F: FnMut(&NetworkMember) -> DeviceCommand,
{
    members
        .iter()
        .map(|member| FanOutRequest::for_member(member, build(member)))
        .collect()
}

/// Successful response from one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub address: DeviceAddress,
    pub response: CommandResponse,
    /// Round-trip time, including time spent waiting for a permit
    pub elapsed: Duration,
}

/// Failure on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub address: DeviceAddress,
    pub error: LinkError,
}

/// Aggregated fan-out failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct FanOutFailure {
    /// Command that was fanned out
    pub command: CommandKind,
    /// Failing devices, in request order
    pub failures: Vec<DeviceFault>,
    /// Devices that succeeded, in request order
    pub succeeded: Vec<DeviceAddress>,
}

impl FanOutFailure {
    /// Addresses of the failing devices
    pub fn failed_addresses(&self) -> Vec<DeviceAddress> {
        self.failures.iter().map(|f| f.address.clone()).collect()
    }
}

impl fmt::Display for FanOutFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on {} of {} device(s)",
            self.command,
            self.failures.len(),
            self.failures.len() + self.succeeded.len()
        )?;
        for (i, fault) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} ({})", fault.address, fault.error)?;
        }
        Ok(())
    }
}

/// Unanimous fan-out result
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub command: CommandKind,
    /// Responses in request order
    pub responses: Vec<DeviceResponse>,
    /// Time until the last device answered
    pub total_duration: Duration,
}

impl FanOutReport {
    /// Payloads of the devices that returned data, in request order
    pub fn payloads(&self) -> Vec<(DeviceAddress, Bytes)> {
        self.responses
            .iter()
            .filter_map(|r| match &r.response {
                CommandResponse::Data(bytes) => Some((r.address.clone(), bytes.clone())),
                CommandResponse::Ack => None,
            })
            .collect()
    }

    /// Slowest device round-trip
    pub fn max_latency(&self) -> Duration {
        self.responses.iter().map(|r| r.elapsed).max().unwrap_or_default()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} acknowledged by {} device(s) in {:?} (slowest {:?})",
            self.command,
            self.responses.len(),
            self.total_duration,
            self.max_latency()
        )
    }
}

/// Concurrent command executor
///
/// Holds no state between calls. Each call gets its own permit pool of
/// `max_in_flight`, so detached commands of a cancelled call never delay a
/// later one.
#[derive(Debug, Clone)]
pub struct FanOutExecutor {
    max_in_flight: usize,
}

impl Default for FanOutExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl FanOutExecutor {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Send every request concurrently and wait for all of them
    ///
    /// When `token` fires, outstanding device tasks are detached (they run to
    /// completion and their results are dropped) and `Cancelled` is returned.
    pub async fn execute(
        &self,
        requests: Vec<FanOutRequest>,
        token: &CancellationToken,
    ) -> Result<FanOutReport, NotchError> {
        let Some(first) = requests.first() else {
            return Err(NotchError::EmptyDeviceSet);
        };
        if token.is_cancelled() {
            return Err(NotchError::Cancelled);
        }

        let command = first.command.kind();
        let total = requests.len();
        let started = Instant::now();
        let addresses: Vec<DeviceAddress> = requests.iter().map(|r| r.address.clone()).collect();
        debug!("fanning out {} to {} device(s)", command, total);

        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let permits = permits.clone();
            tasks.spawn(async move {
                let FanOutRequest { address, link, command } = request;
                let begun = Instant::now();
                let _permit = permits.acquire_owned().await;
                debug!("{}: {}", address, command.kind());
                let result = AssertUnwindSafe(async move { link.send_command(command).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(LinkError::Internal(panic_message(panic.as_ref())))
                    });
                (index, result, begun.elapsed())
            });
        }

        let mut outcomes: Vec<Option<(Result<CommandResponse, LinkError>, Duration)>> =
            vec![None; total];
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("{} cancelled with {} device(s) outstanding", command, tasks.len());
                    tasks.detach_all();
                    return Err(NotchError::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, result, elapsed))) => outcomes[index] = Some((result, elapsed)),
                    Some(Err(err)) => {
                        warn!("device task for {} did not complete: {}", command, err)
                    }
                    None => break,
                },
            }
        }

        let mut responses = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut succeeded = Vec::new();
        for (address, outcome) in addresses.into_iter().zip(outcomes) {
            match outcome {
                Some((Ok(response), elapsed)) => {
                    succeeded.push(address.clone());
                    responses.push(DeviceResponse {
                        address,
                        response,
                        elapsed,
                    });
                }
                Some((Err(error), _)) => {
                    warn!("{}: {} failed: {}", address, command, error);
                    failures.push(DeviceFault { address, error });
                }
                None => failures.push(DeviceFault {
                    address,
                    error: LinkError::Internal("device task aborted".into()),
                }),
            }
        }

        if !failures.is_empty() {
            return Err(FanOutFailure {
                command,
                failures,
                succeeded,
            }
            .into());
        }

        let report = FanOutReport {
            command,
            responses,
            total_duration: started.elapsed(),
        };
        debug!("{}", report.summary());
        Ok(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("device task panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("device task panicked: {msg}")
    } else {
        "device task panicked".to_string()
    }
}
