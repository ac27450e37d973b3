//! Peer data-channel server and client
//!
//! The link is point-to-point: every frame read from the interface goes
//! over the `data` channel, and every frame arriving on it is written to the
//! interface. The server brings its interface up before negotiating; the
//! client waits for its lease.

use super::{RelayContext, Runtime};
use crate::config::Config;
use crate::protocol::{FlowKey, DATA_CHANNEL_LABEL};
use crate::session::{LeasePool, Session, SessionError, SessionOutput, Signaling};
use crate::transport::{ChannelRef, PeerChannel, PeerConnection, PeerEvents};
use crate::tunnel::{DeviceFactory, InterfaceConfig, Routing};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, trace};

fn data_channel(peer: &Arc<dyn PeerConnection>) -> ChannelRef {
    Arc::new(PeerChannel::new(Arc::clone(peer), DATA_CHANNEL_LABEL))
}

/// Offer a session, hand out a lease and relay until the session ends
pub(super) async fn serve(
    config: &Config,
    context: &RelayContext,
    devices: &dyn DeviceFactory,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    signaling: &mut dyn Signaling,
) -> crate::Result<()> {
    let block = config.block()?;
    let pool = Arc::new(LeasePool::new(block).map_err(SessionError::from)?);

    let mut iface = InterfaceConfig::new(pool.gateway(), block.prefix_len(), config.node.mtu);
    iface.gateway = Some(pool.gateway());
    let device = devices.create(&iface).await?;
    info!(
        "Peer server gateway {} for block {}",
        pool.gateway(),
        pool.block()
    );

    let mut runtime = context.start(Arc::clone(&device));
    let relay = runtime.relay().clone();
    runtime.track(relay.spawn_egress(device, Routing::PointToPoint(data_channel(&peer))));

    let session = Session::server(
        Arc::clone(&peer),
        events,
        Arc::clone(context.transform()),
        pool,
    );
    drive(session, signaling, context, devices, config.node.mtu, Some(runtime)).await
}

/// Answer a session, wait for the lease, then relay until the session ends
pub(super) async fn connect(
    config: &Config,
    context: &RelayContext,
    devices: &dyn DeviceFactory,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    signaling: &mut dyn Signaling,
) -> crate::Result<()> {
    let session = Session::client(peer, events, Arc::clone(context.transform()));
    drive(session, signaling, context, devices, config.node.mtu, None).await
}

async fn drive(
    mut session: Session,
    signaling: &mut dyn Signaling,
    context: &RelayContext,
    devices: &dyn DeviceFactory,
    mtu: usize,
    mut runtime: Option<Runtime>,
) -> crate::Result<()> {
    let cancel = context.cancel_token().clone();
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = run_session(&mut session, signaling, devices, mtu, &mut runtime, context) => result,
    };

    session.close().await;
    if let Some(runtime) = runtime {
        runtime.shutdown().await;
    }
    info!("Peer session ended ({})", session.state());
    result
}

async fn run_session(
    session: &mut Session,
    signaling: &mut dyn Signaling,
    devices: &dyn DeviceFactory,
    mtu: usize,
    runtime: &mut Option<Runtime>,
    context: &RelayContext,
) -> crate::Result<()> {
    session.negotiate(signaling).await?;

    while let Some(output) = session.next().await {
        match output? {
            SessionOutput::Ready => info!("Peer session ready"),
            SessionOutput::DataChannelOpen => debug!("Data channel open"),
            SessionOutput::LeaseIssued(lease) => {
                info!("Client leased {}", lease.client);
            }
            SessionOutput::LeaseReceived(lease) => {
                if runtime.is_some() {
                    continue;
                }
                let device = devices
                    .create(&InterfaceConfig::from_lease(&lease, mtu))
                    .await?;
                let mut started = context.start(Arc::clone(&device));
                let relay = started.relay().clone();
                started.track(relay.spawn_egress(
                    device,
                    Routing::PointToPoint(data_channel(session.peer())),
                ));
                *runtime = Some(started);
                info!("Interface up with {}, relaying", lease.client);
            }
            SessionOutput::Data(data) => deliver(runtime.as_ref(), session, data).await,
            SessionOutput::Closed => break,
        }
    }
    Ok(())
}

async fn deliver(runtime: Option<&Runtime>, session: &Session, data: Bytes) {
    let Some(runtime) = runtime else {
        debug!("Interface not ready, discarding {} bytes", data.len());
        return;
    };
    let relay = runtime.relay();
    let Some(frame) = relay.deliver(&data, false).await else {
        return;
    };
    trace!("Received {} bytes on data channel", frame.len());
    if let Some(key) = FlowKey::inbound(&frame) {
        relay.flows().record(key, data_channel(session.peer())).await;
    }
}
