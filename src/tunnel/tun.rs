//! `tun-rs` backed interface

use super::{DeviceFactory, DeviceRef, InterfaceConfig, TunDevice, TunnelError};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tracing::info;
use tun_rs::AsyncDevice;

/// OS tun interface
pub struct TunRsDevice {
    inner: AsyncDevice,
}

#[async_trait]
impl TunDevice for TunRsDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.recv(buf).await
    }

    async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        self.inner.send(frame).await
    }
}

/// Creates and brings up OS tun interfaces. Routes through the gateway are
/// left to the operator.
#[derive(Debug, Default)]
pub struct TunRsFactory;

#[async_trait]
impl DeviceFactory for TunRsFactory {
    async fn create(&self, config: &InterfaceConfig) -> Result<DeviceRef, TunnelError> {
        let mtu = u16::try_from(config.mtu)
            .map_err(|_| TunnelError::Interface(format!("MTU {} out of range", config.mtu)))?;

        let device = tun_rs::create_as_async(
            tun_rs::Configuration::default()
                .address_with_prefix(config.address, config.prefix)
                .platform_config(|_v| {
                    #[cfg(target_os = "linux")]
                    _v.tx_queue_len(1000);
                })
                .mtu(mtu)
                .up(),
        )
        .map_err(|e| {
            TunnelError::Interface(format!(
                "failed to create interface {}/{}: {}",
                config.address, config.prefix, e
            ))
        })?;

        #[cfg(target_os = "macos")]
        {
            use tun_rs::AbstractDevice;
            device.set_ignore_packet_info(true);
        }

        info!(
            "Interface up: {}/{} mtu {}{}",
            config.address,
            config.prefix,
            mtu,
            config
                .gateway
                .map(|gw| format!(" gateway {}", gw))
                .unwrap_or_default()
        );

        Ok(Arc::new(TunRsDevice { inner: device }))
    }
}
