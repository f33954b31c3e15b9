use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use led_router_core::{LedFrame, LedRouterError, TransportError, TransportSink};
use tokio::net::UdpSocket;

/// WLED realtime protocol id for plain RGB triples.
const DRGB: u8 = 2;
/// Largest frame a single DRGB datagram carries.
pub const MAX_DRGB_PIXELS: usize = 490;

/// Sends frames to WLED controllers as DRGB datagrams.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    targets: BTreeMap<String, SocketAddr>,
    timeout_secs: u8,
}

impl UdpSink {
    pub async fn bind(
        outputs: &BTreeMap<String, String>,
        timeout_secs: u8,
    ) -> led_router_core::Result<Self> {
        let mut targets = BTreeMap::new();
        for (device_id, address) in outputs {
            let addr: SocketAddr = address.parse().map_err(|err| {
                LedRouterError::msg(format!("bad address `{address}` for `{device_id}`: {err}"))
            })?;
            targets.insert(device_id.clone(), addr);
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            targets,
            timeout_secs,
        })
    }
}

/// Encodes a frame as a DRGB packet: protocol byte, timeout, RGB triples.
pub fn encode_drgb(frame: &LedFrame, timeout_secs: u8) -> Result<Vec<u8>, TransportError> {
    if frame.len() > MAX_DRGB_PIXELS {
        return Err(TransportError::Encode(format!(
            "{} pixels exceed the DRGB limit of {MAX_DRGB_PIXELS}",
            frame.len()
        )));
    }
    let mut packet = Vec::with_capacity(2 + frame.len() * 3);
    packet.push(DRGB);
    packet.push(timeout_secs);
    for pixel in &frame.pixels {
        packet.extend_from_slice(&[pixel.r, pixel.g, pixel.b]);
    }
    Ok(packet)
}

#[async_trait]
impl TransportSink for UdpSink {
    async fn send(&self, device_id: &str, frame: Arc<LedFrame>) -> Result<(), TransportError> {
        let target = self
            .targets
            .get(device_id)
            .ok_or_else(|| TransportError::Unreachable(device_id.to_string()))?;
        let packet = encode_drgb(&frame, self.timeout_secs)?;
        self.socket.send_to(&packet, *target).await?;
        Ok(())
    }
}
