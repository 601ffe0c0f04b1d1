//! Sequential download of recorded data
//!
//! Devices are downloaded one at a time in slot order. Each payload is
//! written to the sink as one frame:
//!
//! ```text
//! +--------+-----------------+-------------+--------------+---------+
//! | u8 len | address (UTF-8) | u16 slot BE | u32 size BE  | payload |
//! +--------+-----------------+-------------+--------------+---------+
//! ```

use super::descriptor::Descriptor;
use super::device::{CommandResponse, DeviceAddress, DeviceCommand, LinkError};
use super::error::NotchError;
use super::registry::NetworkMember;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::SinkExt;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed header bytes around the address
const HEADER_LEN: usize = 1 + 2 + 4;

/// One device's payload in a download stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFrame {
    pub address: DeviceAddress,
    pub slot_index: u16,
    pub payload: Bytes,
}

impl DownloadFrame {
    /// Decode every frame in `data`
    pub fn parse_all(data: &[u8]) -> io::Result<Vec<DownloadFrame>> {
        let mut buf = BytesMut::from(data);
        let mut codec = DownloadFrameCodec;
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame);
        }
        if !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} trailing byte(s) after last frame", buf.len()),
            ));
        }
        Ok(frames)
    }
}

/// Codec for [`DownloadFrame`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadFrameCodec;

impl Encoder<DownloadFrame> for DownloadFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: DownloadFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let address = frame.address.as_str().as_bytes();
        let address_len = u8::try_from(address.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "device address longer than 255 bytes")
        })?;
        let payload_len = u32::try_from(frame.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload larger than 4 GiB"))?;

        dst.reserve(HEADER_LEN + address.len() + frame.payload.len());
        dst.put_u8(address_len);
        dst.put_slice(address);
        dst.put_u16(frame.slot_index);
        dst.put_u32(payload_len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for DownloadFrameCodec {
    type Item = DownloadFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&address_len) = src.first() else {
            return Ok(None);
        };
        let address_len = usize::from(address_len);
        if src.len() < HEADER_LEN + address_len {
            return Ok(None);
        }

        let size_at = 1 + address_len + 2;
        let payload_len = u32::from_be_bytes([
            src[size_at],
            src[size_at + 1],
            src[size_at + 2],
            src[size_at + 3],
        ]) as usize;
        if src.len() < HEADER_LEN + address_len + payload_len {
            src.reserve(HEADER_LEN + address_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let address = src.split_to(address_len);
        let address = std::str::from_utf8(&address)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let address = DeviceAddress::new(address);
        let slot_index = src.get_u16();
        src.advance(4);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(DownloadFrame {
            address,
            slot_index,
            payload,
        }))
    }
}

/// Per-device download result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDownload {
    pub address: DeviceAddress,
    pub slot_index: usize,
    pub bytes: usize,
}

/// Summary of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub descriptor: Uuid,
    /// Devices in download order
    pub devices: Vec<DeviceDownload>,
    /// Payload bytes written (excluding frame headers)
    pub total_bytes: usize,
    pub elapsed: Duration,
}

/// A finished download together with the sink it was written to
#[derive(Debug)]
pub struct DownloadOutput<W> {
    pub report: DownloadReport,
    pub sink: W,
}

/// Sequential downloader
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadCoordinator;

impl DownloadCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Download `descriptor` from `members` into `sink`
    ///
    /// The sink is flushed once every device has been written, but never
    /// closed. Cancellation is observed between devices and while waiting
    /// for a device.
    pub async fn download<W>(
        &self,
        descriptor: &Descriptor,
        members: &[NetworkMember],
        sink: &mut W,
        token: &CancellationToken,
    ) -> Result<DownloadReport, NotchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let id = descriptor.id();
        let mut writer = FramedWrite::new(sink, DownloadFrameCodec);
        let mut devices = Vec::with_capacity(descriptor.devices().len());
        let mut total_bytes = 0;

        for (completed, address) in descriptor.devices().iter().enumerate() {
            if token.is_cancelled() {
                return Err(NotchError::Cancelled);
            }
            let Some(member) = members.iter().find(|m| m.address() == address) else {
                return Err(NotchError::DownloadFailed {
                    address: address.clone(),
                    completed,
                    source: LinkError::Disconnected,
                });
            };

            debug!("downloading {} from {}", id, address);
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(NotchError::Cancelled),
                response = member.link.send_command(DeviceCommand::Download {
                    descriptor: id,
                }) => response,
            };
            let payload = match response {
                Ok(CommandResponse::Data(payload)) => payload,
                Ok(CommandResponse::Ack) => Bytes::new(),
                Err(source) => {
                    warn!("download of {} failed on {}: {}", id, address, source);
                    return Err(NotchError::DownloadFailed {
                        address: address.clone(),
                        completed,
                        source,
                    });
                }
            };

            let slot_index = u16::try_from(member.slot_index).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "slot index does not fit a frame")
            })?;
            let bytes = payload.len();
            writer
                .feed(DownloadFrame {
                    address: address.clone(),
                    slot_index,
                    payload,
                })
                .await?;
            total_bytes += bytes;
            devices.push(DeviceDownload {
                address: address.clone(),
                slot_index: member.slot_index,
                bytes,
            });
        }

        writer.flush().await?;

        let report = DownloadReport {
            descriptor: id,
            devices,
            total_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            "downloaded {} byte(s) of {} from {} device(s)",
            report.total_bytes,
            id,
            report.devices.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::{CaptureKind, Measurement};
    use crate::core::device::{CommandKind, DeviceLink, SimulatedDevice};
    use crate::core::registry::NetworkRegistry;
    use crate::core::workout::{DeviceSlot, LedColor, Workout};
    use crate::core::device::{DiscoveredDevice, NotchDevice};
    use chrono::Utc;
    use std::sync::Arc;

    async fn recorded(
        addresses: &[&str],
        id: Uuid,
    ) -> (Vec<Arc<SimulatedDevice>>, Vec<NetworkMember>) {
        let devices: Vec<Arc<SimulatedDevice>> =
            addresses.iter().map(|a| SimulatedDevice::standard(*a)).collect();
        for device in &devices {
            device.send_command(DeviceCommand::Connect).await.unwrap();
            device.send_command(DeviceCommand::StartCapture { measurement: id }).await.unwrap();
            device.send_command(DeviceCommand::StopCapture { measurement: id }).await.unwrap();
        }
        let candidates: Vec<DiscoveredDevice> = devices
            .iter()
            .map(|d| DiscoveredDevice::new(NotchDevice::new(d.address()), d.clone()))
            .collect();
        let mut workout = Workout::new("dl");
        for i in 0..addresses.len() {
            workout = workout.with_slot(DeviceSlot::new(format!("s{i}"), LedColor::palette(i)));
        }
        let assignment = NetworkRegistry::new().resolve(Arc::new(workout), &candidates).unwrap();
        (devices, assignment.members)
    }

    fn measurement(id: Uuid, members: &[NetworkMember]) -> Descriptor {
        Measurement {
            id,
            generation: 1,
            kind: CaptureKind::Capture,
            devices: members.iter().map(|m| m.address().clone()).collect(),
            started_at: Utc::now(),
            stopped_at: Utc::now(),
        }
        .into()
    }

    #[test]
    fn test_frame_layout() {
        let mut buf = BytesMut::new();
        DownloadFrameCodec
            .encode(
                DownloadFrame {
                    address: DeviceAddress::new("ab"),
                    slot_index: 3,
                    payload: Bytes::from_static(&[9, 8]),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[2, b'A', b'B', 0, 3, 0, 0, 0, 2, 9, 8]);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut buf = BytesMut::from(&[2, b'A', b'B', 0, 3, 0, 0, 0, 2, 9][..]);
        assert_eq!(DownloadFrameCodec.decode(&mut buf).unwrap(), None);
        assert!(DownloadFrame::parse_all(&buf).is_err());
    }

    #[tokio::test]
    async fn test_sequential_download_in_slot_order() {
        let id = Uuid::new_v4();
        let (_, members) = recorded(&["02", "01"], id).await;
        let descriptor = measurement(id, &members);

        let mut sink = Vec::new();
        let report = DownloadCoordinator::new()
            .download(&descriptor, &members, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        let frames = DownloadFrame::parse_all(&sink).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address.as_str(), "01");
        assert_eq!(frames[1].slot_index, 1);
        assert_eq!(report.total_bytes, frames.iter().map(|f| f.payload.len()).sum::<usize>());
    }

    #[tokio::test]
    async fn test_oversized_slot_index_is_a_sink_error() {
        let id = Uuid::new_v4();
        let (_, mut members) = recorded(&["01"], id).await;
        members[0].slot_index = usize::from(u16::MAX) + 1;
        let descriptor = measurement(id, &members);

        let mut sink = Vec::new();
        let err = DownloadCoordinator::new()
            .download(&descriptor, &members, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();
        let NotchError::Sink(source) = err else {
            panic!("expected sink error, got {err:?}");
        };
        assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_completed_devices() {
        let id = Uuid::new_v4();
        let (devices, members) = recorded(&["01", "02", "03"], id).await;
        devices[1].fail_on(CommandKind::Download, LinkError::Timeout(10));
        let descriptor = measurement(id, &members);

        let mut sink = Vec::new();
        let err = DownloadCoordinator::new()
            .download(&descriptor, &members, &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            NotchError::DownloadFailed { address, completed, source } => {
                assert_eq!(address.as_str(), "02");
                assert_eq!(completed, 1);
                assert_eq!(source, LinkError::Timeout(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(devices[2].command_count(CommandKind::Download), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_device() {
        let id = Uuid::new_v4();
        let (devices, members) = recorded(&["01"], id).await;
        let token = CancellationToken::new();
        token.cancel();

        let mut sink = Vec::new();
        let err = DownloadCoordinator::new()
            .download(&measurement(id, &members), &members, &mut sink, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(sink.is_empty());
        assert_eq!(devices[0].command_count(CommandKind::Download), 0);
    }
}
