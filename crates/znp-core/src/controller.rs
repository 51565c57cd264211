//! Coordinator control flow
//!
//! Owns the dispatcher and drives startup, network formation, the data
//! request path with its delivery-failure recovery ladder, and the
//! watchdog with automatic reconnection.

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{broadcast, watch, RwLock, Semaphore};

use znp_protocol::codec::{LongBytes, ShortBytes, ShortList};
use znp_protocol::commands::{af, app_config, sys, util, zdo as zdo_cmd};
use znp_protocol::cstruct::Alignment;
use znp_protocol::nvids::OsalNvId;
use znp_protocol::types::{
    Address, AddrMode, BdbCommissioningMode, BdbCommissioningStatus, Channels,
    DeviceLogicalType, DeviceState, Eui64, KeyData, LatencyReq, MacCapabilities,
    MtCapabilities, NodeRelation, ProtocolError, ResetType, StartupOptions, Status,
    TransmitOptions, BROADCAST_ROUTERS,
};
use znp_protocol::Znp;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::network::{self, FirmwareGeneration, NetworkInfo};
use crate::nvram::Nvram;
use crate::security::{self, NetworkBackup, TC_COUNTER_INCREMENT};
use crate::zdo::{self, ZdoResponse};

/// Bounded retries through the delivery recovery ladder
const REQUEST_MAX_ATTEMPTS: usize = 5;

/// Hop limit for outgoing requests
const REQUEST_RADIUS: u8 = 30;

/// Consecutive watchdog ping failures before the link is declared dead
const WATCHDOG_FAILURES: u32 = 2;

/// Marker written after a successful configuration, checked by
/// zigbee-shepherd descendants
const ZSTACK_CONFIGURED_MARKER: u8 = 0x55;

const ZHA_PROFILE: u16 = 0x0104;
const ZLL_PROFILE: u16 = 0xC05E;
const CONFIGURATION_TOOL_DEVICE: u16 = 0x0005;

/// First build id whose firmware expects the ZLL endpoint on endpoint 1.
/// New build ids should be triaged against the firmware source before
/// being added here.
const NEW_ENDPOINT_LAYOUT_MIN_BUILD: u32 = 20210708;

/// An incoming application-layer message, or a synthesized ZDO response
#[derive(Debug, Clone)]
pub struct ApsMessage {
    pub src: u16,
    pub src_endpoint: u8,
    pub dst_endpoint: u8,
    pub cluster: u16,
    pub group: Option<u16>,
    pub was_broadcast: bool,
    /// Absent for synthesized ZDO responses
    pub lqi: Option<u8>,
    pub data: Vec<u8>,
}

/// Events emitted to the upstream Zigbee stack
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ApsMessage(ApsMessage),
    DeviceJoined {
        nwk: u16,
        ieee: Eui64,
        parent_nwk: u16,
    },
    DeviceAnnounced {
        nwk: u16,
        ieee: Eui64,
        capabilities: MacCapabilities,
    },
    DeviceLeft {
        nwk: u16,
        ieee: Eui64,
    },
    StateChanged(DeviceState),
    DeviceRelays {
        nwk: u16,
        relays: Vec<u16>,
    },
    PermitJoin {
        duration: u8,
    },
    ConnectionLost,
    Reconnected,
}

/// Everything bound to one live serial connection; replaced wholesale on
/// reconnect
#[derive(Clone)]
struct Stack {
    znp: Arc<Znp>,
    nvram: Nvram,
    capabilities: MtCapabilities,
    generation: FirmwareGeneration,
    build_id: Option<u32>,
    network: NetworkInfo,
    /// Bounds in-flight AF data requests
    semaphore: Arc<Semaphore>,
}

/// Network identity used when forming
struct FormParams {
    pan_id: u16,
    extended_pan_id: Eui64,
    network_key: KeyData,
    channels: Channels,
    ieee: Option<Eui64>,
}

enum OutgoingFrame {
    Ext(af::DataRequestExt),
    SrcRtg(af::DataRequestSrcRtg),
}

/// The coordinator application
pub struct Controller {
    config: ControllerConfig,
    stack: RwLock<Option<Stack>>,
    event_tx: broadcast::Sender<ControllerEvent>,
    /// In-flight route discoveries, one per destination
    route_discovery: Arc<DashMap<u16, broadcast::Sender<bool>>>,
    /// Last known relay list per destination, from `ZDO.SrcRtgInd`
    relays: Arc<DashMap<u16, Vec<u16>>>,
}

impl Controller {
    /// Connect to the coprocessor and run the full startup sequence
    ///
    /// With `auto_form` set, a coordinator that is not part of a network
    /// forms one from the configured (or generated) parameters.
    pub async fn connect(
        config: ControllerConfig,
        auto_form: bool,
    ) -> Result<Arc<Self>, ControllerError> {
        let (event_tx, _) = broadcast::channel(128);
        let controller = Arc::new(Self {
            config,
            stack: RwLock::new(None),
            event_tx,
            route_discovery: Arc::new(DashMap::new()),
            relays: Arc::new(DashMap::new()),
        });

        let stack = controller.start_stack(auto_form).await?;
        let connection = stack.znp.connection_watch();
        *controller.stack.write().await = Some(stack);

        controller.clone().spawn_watchdog();
        controller.clone().spawn_connection_monitor(connection);

        Ok(controller)
    }

    /// Subscribe to controller events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    /// Identity of the network the coordinator is running
    pub async fn network_info(&self) -> Result<NetworkInfo, ControllerError> {
        Ok(self.stack_handle().await?.network)
    }

    /// Detected firmware generation
    pub async fn firmware_generation(&self) -> Result<FirmwareGeneration, ControllerError> {
        Ok(self.stack_handle().await?.generation)
    }

    /// Build id reported by `SYS.Version`, absent on older firmware
    pub async fn firmware_build_id(&self) -> Result<Option<u32>, ControllerError> {
        Ok(self.stack_handle().await?.build_id)
    }

    /// MT interfaces the coprocessor advertises
    pub async fn capabilities(&self) -> Result<MtCapabilities, ControllerError> {
        Ok(self.stack_handle().await?.capabilities)
    }

    /// Close the transport and stop processing
    pub async fn shutdown(&self) {
        if let Some(stack) = self.stack.write().await.take() {
            stack.znp.close();
        }
    }

    async fn stack_handle(&self) -> Result<Stack, ControllerError> {
        self.stack
            .read()
            .await
            .clone()
            .ok_or(ControllerError::Protocol(ProtocolError::NotConnected))
    }

    async fn start_stack(&self, auto_form: bool) -> Result<Stack, ControllerError> {
        let znp = Znp::connect(&self.config.serial, self.config.znp_config()).await?;

        let ping = znp
            .request(sys::Ping {}, sys::PingRspPattern::default())
            .await?;
        let capabilities = ping.capabilities;
        tracing::info!(?capabilities, "coprocessor is alive");

        // Alignment is unknown until the generation is; plain byte reads
        // do not care
        let probe = Nvram::new(znp.clone(), capabilities, Alignment::Unaligned);
        let generation = network::detect_firmware(&probe, capabilities).await?;
        tracing::info!(%generation, "detected firmware");
        let nvram = Nvram::new(znp.clone(), capabilities, generation.alignment());

        let reset = self.reset(&znp).await?;
        tracing::debug!(
            major = reset.major_rel,
            minor = reset.minor_rel,
            "reset complete"
        );

        let version = znp
            .request(sys::Version {}, sys::VersionRspPattern::default())
            .await?;
        let build_id = version.code_revision;
        tracing::info!(
            product = version.product_id,
            release = %format_args!("{}.{}", version.major_rel, version.minor_rel),
            build_id,
            "firmware version"
        );

        network::fix_misaligned_nvram(&nvram, generation).await?;

        let network = match network::load_network_info(&nvram, generation).await {
            Ok(info) => info,
            Err(ControllerError::NotOnNetwork) if auto_form => {
                tracing::info!("coordinator is not on a network, forming one");
                let params = self.generated_form_params();
                self.form_network(&znp, &nvram, generation, &params).await?;
                network::load_network_info(&nvram, generation).await?
            }
            Err(error) => return Err(error),
        };
        tracing::info!(
            pan_id = %format_args!("{:#06X}", network.pan_id),
            channel = network.channel,
            ieee = %network.ieee,
            "network is up"
        );

        self.register_endpoints(&znp, build_id).await?;

        if let Some(dbm) = self.config.tx_power {
            apply_tx_power(&znp, generation, dbm).await?;
        }

        if let Some(on) = self.config.led_mode {
            match znp
                .request(
                    util::LedControl { led_id: 0xFF, on },
                    util::LedControlRspPattern {
                        status: Some(Status::Success),
                    },
                )
                .await
            {
                Ok(_) => {}
                Err(ProtocolError::CommandNotRecognized { .. }) => {
                    tracing::debug!("firmware has no LED control handler");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let permits = self
            .config
            .max_concurrent_requests
            .unwrap_or(match generation {
                FirmwareGeneration::ZStack12 => 2,
                _ => 16,
            });

        self.register_callbacks(&znp);

        Ok(Stack {
            znp,
            nvram,
            capabilities,
            generation,
            build_id,
            network,
            semaphore: Arc::new(Semaphore::new(permits)),
        })
    }

    /// Soft-reset the coprocessor and wait for it to come back
    async fn reset(&self, znp: &Arc<Znp>) -> Result<sys::ResetInd, ControllerError> {
        let reset_ind = znp.wait_for(sys::ResetIndPattern::default());
        znp.send(sys::ResetReq {
            reset_type: ResetType::Soft,
        })
        .await?;

        let ind = tokio::time::timeout(self.config.arsp_timeout, reset_ind.recv_as())
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(ind)
    }

    fn generated_form_params(&self) -> FormParams {
        let mut rng = rand::thread_rng();
        let net = &self.config.network;

        FormParams {
            pan_id: net.pan_id.unwrap_or(0xFFFF),
            extended_pan_id: net.extended_pan_id.unwrap_or_else(|| {
                let mut epid = [0u8; 8];
                rng.fill_bytes(&mut epid);
                Eui64(epid)
            }),
            network_key: net.network_key.unwrap_or_else(|| {
                let mut key = [0u8; 16];
                rng.fill_bytes(&mut key);
                KeyData(key)
            }),
            channels: net
                .channels
                .unwrap_or_else(|| Channels::from_channel_list([15, 20, 25])),
            ieee: None,
        }
    }

    async fn form_network(
        &self,
        znp: &Arc<Znp>,
        nvram: &Nvram,
        generation: FirmwareGeneration,
        params: &FormParams,
    ) -> Result<(), ControllerError> {
        // Startup options are only read at boot, so clearing state needs
        // its own reset before any configuration is written
        nvram
            .osal_write(
                OsalNvId::StartupOption,
                &[(StartupOptions::CLEAR_STATE | StartupOptions::CLEAR_CONFIG).bits()],
                true,
            )
            .await?;
        nvram
            .osal_write(
                OsalNvId::LogicalType,
                &[DeviceLogicalType::Coordinator.as_u8()],
                true,
            )
            .await?;
        self.reset(znp).await?;

        if let Some(ieee) = params.ieee {
            nvram.osal_write(OsalNvId::ExtAddr, &ieee.0, true).await?;
        }

        // ZDO callbacks must come to the host directly instead of being
        // consumed by an on-chip endpoint
        nvram.osal_write(OsalNvId::ZdoDirectCb, &[1], true).await?;
        nvram
            .osal_write(OsalNvId::PreCfgKey, &params.network_key.0, true)
            .await?;
        nvram
            .osal_write(OsalNvId::PreCfgKeysEnable, &[1], true)
            .await?;
        nvram
            .osal_write(OsalNvId::PanId, &params.pan_id.to_le_bytes(), true)
            .await?;
        nvram
            .osal_write(OsalNvId::ExtendedPanId, &params.extended_pan_id.0, true)
            .await?;
        nvram
            .osal_write(
                OsalNvId::ChanList,
                &params.channels.bits().to_le_bytes(),
                true,
            )
            .await?;

        if generation == FirmwareGeneration::ZStack12 {
            // No BDB on 1.2; the network layer starts from the written
            // configuration
            let started = znp.wait_for(zdo_cmd::StateChangeIndPattern {
                state: Some(DeviceState::StartedAsCoordinator),
            });
            znp.request(
                zdo_cmd::StartupFromApp { start_delay: 100 },
                zdo_cmd::StartupFromAppRspPattern::default(),
            )
            .await?;

            tokio::time::timeout(self.config.arsp_timeout, started.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??;
        } else {
            znp.request(
                app_config::BdbSetChannel {
                    is_primary: true,
                    channel: params.channels,
                },
                app_config::BdbSetChannelRspPattern {
                    status: Some(Status::Success),
                },
            )
            .await?;
            znp.request(
                app_config::BdbSetChannel {
                    is_primary: false,
                    channel: Channels::NONE,
                },
                app_config::BdbSetChannelRspPattern {
                    status: Some(Status::Success),
                },
            )
            .await?;

            // Formation can take a while; it is finished when no
            // commissioning modes remain
            let notification = znp
                .request_callback_rsp(
                    app_config::BdbStartCommissioning {
                        mode: BdbCommissioningMode::NWK_FORMATION,
                    },
                    app_config::BdbStartCommissioningRspPattern {
                        status: Some(Status::Success),
                    },
                    app_config::BdbCommissioningNotificationPattern {
                        remaining_modes: Some(BdbCommissioningMode::NONE),
                        ..Default::default()
                    },
                )
                .await?;

            if !matches!(
                notification.status,
                BdbCommissioningStatus::Success | BdbCommissioningStatus::NetworkRestored
            ) {
                tracing::warn!(
                    status = ?notification.status,
                    "BDB commissioning did not report success"
                );
            }
        }

        let marker = if generation == FirmwareGeneration::ZStack12 {
            OsalNvId::HasConfiguredZstack1
        } else {
            OsalNvId::HasConfiguredZstack3
        };
        nvram
            .osal_write(marker, &[ZSTACK_CONFIGURED_MARKER], true)
            .await?;

        self.reset(znp).await?;
        Ok(())
    }

    async fn register_endpoints(
        &self,
        znp: &Arc<Znp>,
        build_id: Option<u32>,
    ) -> Result<(), ControllerError> {
        for &(endpoint, profile_id) in endpoint_table(build_id) {
            znp.request(
                af::Register {
                    endpoint,
                    profile_id,
                    device_id: CONFIGURATION_TOOL_DEVICE,
                    device_version: 0x00,
                    latency_req: LatencyReq::NoLatency,
                    input_clusters: ShortList(vec![]),
                    output_clusters: ShortList(vec![]),
                },
                af::RegisterRspPattern {
                    status: Some(Status::Success),
                },
            )
            .await?;
        }
        Ok(())
    }

    fn register_callbacks(&self, znp: &Arc<Znp>) {
        let event_tx = self.event_tx.clone();
        znp.callback_for(
            af::IncomingMsgPattern::default(),
            move |msg: af::IncomingMsg| {
                let _ = event_tx.send(ControllerEvent::ApsMessage(ApsMessage {
                    src: msg.src_addr,
                    src_endpoint: msg.src_endpoint,
                    dst_endpoint: msg.dst_endpoint,
                    cluster: msg.cluster_id,
                    group: (msg.group_id != 0).then_some(msg.group_id),
                    was_broadcast: msg.was_broadcast,
                    lqi: Some(msg.lqi),
                    data: msg.data.0,
                }));
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            af::IncomingMsgExtPattern::default(),
            move |msg: af::IncomingMsgExt| {
                let src = match msg.src_addr {
                    Address::Nwk(nwk) | Address::Group(nwk) | Address::Broadcast(nwk) => nwk,
                    // No short address is known for inter-PAN senders
                    Address::Ieee(_) => 0xFFFE,
                };
                let _ = event_tx.send(ControllerEvent::ApsMessage(ApsMessage {
                    src,
                    src_endpoint: msg.src_endpoint,
                    dst_endpoint: msg.dst_endpoint,
                    cluster: msg.cluster_id,
                    group: (msg.group_id != 0).then_some(msg.group_id),
                    was_broadcast: msg.was_broadcast,
                    lqi: Some(msg.lqi),
                    data: msg.data.0,
                }));
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            zdo_cmd::EndDeviceAnnceIndPattern::default(),
            move |ind: zdo_cmd::EndDeviceAnnceInd| {
                let _ = event_tx.send(ControllerEvent::DeviceAnnounced {
                    nwk: ind.nwk,
                    ieee: ind.ieee,
                    capabilities: ind.capabilities,
                });
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            zdo_cmd::TcDevIndPattern::default(),
            move |ind: zdo_cmd::TcDevInd| {
                let _ = event_tx.send(ControllerEvent::DeviceJoined {
                    nwk: ind.src_nwk,
                    ieee: ind.src_ieee,
                    parent_nwk: ind.parent_nwk,
                });
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            zdo_cmd::LeaveIndPattern::default(),
            move |ind: zdo_cmd::LeaveInd| {
                let _ = event_tx.send(ControllerEvent::DeviceLeft {
                    nwk: ind.nwk,
                    ieee: ind.ieee,
                });
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            zdo_cmd::StateChangeIndPattern::default(),
            move |ind: zdo_cmd::StateChangeInd| {
                let _ = event_tx.send(ControllerEvent::StateChanged(ind.state));
            },
        );

        let event_tx = self.event_tx.clone();
        znp.callback_for(
            zdo_cmd::PermitJoinIndPattern::default(),
            move |ind: zdo_cmd::PermitJoinInd| {
                let _ = event_tx.send(ControllerEvent::PermitJoin {
                    duration: ind.duration,
                });
            },
        );

        let event_tx = self.event_tx.clone();
        let relays = self.relays.clone();
        znp.callback_for(
            zdo_cmd::SrcRtgIndPattern::default(),
            move |ind: zdo_cmd::SrcRtgInd| {
                relays.insert(ind.dst_addr, ind.relays.0.clone());
                let _ = event_tx.send(ControllerEvent::DeviceRelays {
                    nwk: ind.dst_addr,
                    relays: ind.relays.0,
                });
            },
        );
    }

    fn spawn_watchdog(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        let period = self.config.watchdog_period;
        drop(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            let mut failures = 0u32;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else { break };

                let Some(stack) = this.stack.read().await.clone() else {
                    continue;
                };
                if !*stack.znp.connection_watch().borrow() {
                    continue;
                }

                match stack
                    .znp
                    .request(sys::Ping {}, sys::PingRspPattern::default())
                    .await
                {
                    Ok(_) => failures = 0,
                    Err(error) => {
                        failures += 1;
                        tracing::warn!(failures, %error, "watchdog ping failed");
                        if failures >= WATCHDOG_FAILURES {
                            failures = 0;
                            // The connection monitor takes over from here
                            stack.znp.close();
                        }
                    }
                }
            }
        });
    }

    fn spawn_connection_monitor(self: Arc<Self>, mut connection: watch::Receiver<bool>) {
        let weak = Arc::downgrade(&self);
        drop(self);

        tokio::spawn(async move {
            while *connection.borrow() {
                if connection.changed().await.is_err() {
                    break;
                }
            }

            let Some(this) = weak.upgrade() else { return };
            tracing::warn!("connection to the coprocessor was lost");
            let _ = this.event_tx.send(ControllerEvent::ConnectionLost);
            *this.stack.write().await = None;

            if !this.config.auto_reconnect {
                return;
            }

            loop {
                tokio::time::sleep(this.config.reconnect_delay).await;
                match this.start_stack(false).await {
                    Ok(stack) => {
                        tracing::info!("reconnected to the coprocessor");
                        let connection = stack.znp.connection_watch();
                        *this.stack.write().await = Some(stack);
                        let _ = this.event_tx.send(ControllerEvent::Reconnected);
                        this.clone().spawn_connection_monitor(connection);
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    /// Send an application-layer request
    ///
    /// ZDO-endpoint requests for clusters the firmware intercepts are
    /// rewritten into MT commands and their responses re-injected through
    /// the event stream.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        dst_nwk: u16,
        dst_ieee: Option<Eui64>,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster: u16,
        tsn: u8,
        data: &[u8],
        prefer_ieee: bool,
    ) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;

        if dst_endpoint == zdo::ZDO_ENDPOINT {
            if zdo::is_supported_cluster(cluster) {
                let response =
                    zdo::rewrite_request(&stack.znp, dst_nwk, cluster, data).await?;
                self.emit_zdo_response(dst_nwk, response);
                return Ok(());
            }
            tracing::warn!(
                cluster = %format_args!("{cluster:#06X}"),
                "passing an unrecognized ZDO cluster through as a raw AF request"
            );
        }

        if zdo::is_broadcast(dst_nwk) {
            return self
                .send_broadcast(&stack, dst_nwk, dst_endpoint, src_endpoint, cluster, tsn, data)
                .await;
        }

        self.send_unicast(
            &stack,
            dst_nwk,
            dst_ieee,
            dst_endpoint,
            src_endpoint,
            cluster,
            tsn,
            data,
            prefer_ieee,
        )
        .await
    }

    /// Broadcast to a NWK broadcast address
    pub async fn broadcast(
        &self,
        broadcast_address: u16,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster: u16,
        tsn: u8,
        data: &[u8],
    ) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;
        self.send_broadcast(
            &stack,
            broadcast_address,
            dst_endpoint,
            src_endpoint,
            cluster,
            tsn,
            data,
        )
        .await
    }

    fn emit_zdo_response(&self, src: u16, response: ZdoResponse) {
        let _ = self.event_tx.send(ControllerEvent::ApsMessage(ApsMessage {
            src,
            src_endpoint: zdo::ZDO_ENDPOINT,
            dst_endpoint: zdo::ZDO_ENDPOINT,
            cluster: response.cluster,
            group: None,
            was_broadcast: false,
            lqi: None,
            data: response.payload,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_broadcast(
        &self,
        stack: &Stack,
        dst_nwk: u16,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster: u16,
        tsn: u8,
        data: &[u8],
    ) -> Result<(), ControllerError> {
        let _permit = stack
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let frame = OutgoingFrame::Ext(af::DataRequestExt {
            dst_addr: Address::Broadcast(dst_nwk),
            dst_endpoint,
            dst_pan_id: 0x0000,
            src_endpoint,
            cluster_id: cluster,
            tsn,
            options: TransmitOptions::default(),
            radius: REQUEST_RADIUS,
            data: LongBytes(data.to_vec()),
        });

        match self.data_request_with_confirm(stack, frame, src_endpoint, tsn).await? {
            Status::Success => Ok(()),
            status => Err(ControllerError::Delivery { status }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_unicast(
        &self,
        stack: &Stack,
        dst_nwk: u16,
        dst_ieee: Option<Eui64>,
        dst_endpoint: u8,
        src_endpoint: u8,
        cluster: u16,
        tsn: u8,
        data: &[u8],
        prefer_ieee: bool,
    ) -> Result<(), ControllerError> {
        let _permit = stack
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let mut use_ieee = prefer_ieee && dst_ieee.is_some();
        let relays = self.relays.get(&dst_nwk).map(|entry| entry.clone());
        let mut try_source_route = relays.is_some() && !use_ieee;
        let mut removed_assoc: Option<(Eui64, NodeRelation)> = None;
        let mut assoc_supported = true;

        let mut outcome: Result<(), ControllerError> = Err(ControllerError::Delivery {
            status: Status::MacNoAck,
        });

        for attempt in 0..REQUEST_MAX_ATTEMPTS {
            let frame = if try_source_route {
                OutgoingFrame::SrcRtg(af::DataRequestSrcRtg {
                    dst_addr: dst_nwk,
                    dst_endpoint,
                    src_endpoint,
                    cluster_id: cluster,
                    tsn,
                    options: TransmitOptions::SUPPRESS_ROUTE_DISC,
                    radius: REQUEST_RADIUS,
                    source_route: ShortList(relays.clone().unwrap_or_default()),
                    data: ShortBytes(data.to_vec()),
                })
            } else {
                let dst_addr = match dst_ieee {
                    Some(ieee) if use_ieee => Address::Ieee(ieee),
                    _ => Address::Nwk(dst_nwk),
                };
                OutgoingFrame::Ext(af::DataRequestExt {
                    dst_addr,
                    dst_endpoint,
                    dst_pan_id: 0x0000,
                    src_endpoint,
                    cluster_id: cluster,
                    tsn,
                    options: TransmitOptions::SUPPRESS_ROUTE_DISC,
                    radius: REQUEST_RADIUS,
                    data: LongBytes(data.to_vec()),
                })
            };

            match self
                .data_request_with_confirm(stack, frame, src_endpoint, tsn)
                .await
            {
                Ok(Status::Success) => {
                    outcome = Ok(());
                    break;
                }
                Ok(status) => {
                    tracing::warn!(
                        attempt,
                        ?status,
                        dst = %format_args!("{dst_nwk:#06X}"),
                        "delivery failed"
                    );
                    outcome = Err(ControllerError::Delivery { status });

                    if try_source_route {
                        // One source-routed attempt, then back to normal
                        // unicast
                        try_source_route = false;
                        continue;
                    }

                    match status {
                        Status::NwkNoRoute => {
                            self.discover_route(stack, dst_nwk).await;
                        }
                        Status::MacTransactionExpired
                            if assoc_supported && removed_assoc.is_none() =>
                        {
                            if let Some(ieee) = dst_ieee {
                                match self
                                    .remove_stale_association(stack, ieee, dst_nwk)
                                    .await
                                {
                                    Ok(Some(relation)) => {
                                        removed_assoc = Some((ieee, relation));
                                    }
                                    Ok(None) => {}
                                    Err(ControllerError::Protocol(
                                        ProtocolError::CommandNotRecognized { .. },
                                    )) => {
                                        // Stock firmware has no association
                                        // proxies; skip this rung entirely
                                        assoc_supported = false;
                                    }
                                    Err(error) => {
                                        tracing::warn!(%error, "association lookup failed");
                                    }
                                }
                            }
                        }
                        Status::MacNoAck | Status::ApsNoAck => {
                            if dst_ieee.is_some() {
                                use_ieee = true;
                            }
                        }
                        _ => {}
                    }
                }
                Err(ControllerError::Protocol(ProtocolError::Timeout)) => {
                    tracing::warn!(attempt, "data confirm timed out");
                    outcome = Err(ControllerError::Protocol(ProtocolError::Timeout));

                    if try_source_route {
                        try_source_route = false;
                        continue;
                    }
                    self.discover_route(stack, dst_nwk).await;
                }
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
        }

        if let Some((ieee, relation)) = removed_assoc {
            self.restore_association(stack, dst_nwk, ieee, relation).await;
        }

        outcome
    }

    /// Issue a data request and wait for its delivery confirmation
    ///
    /// The confirm wait runs in its own task so an upstream cancellation
    /// cannot leave a dangling listener that would consume a later
    /// unrelated confirm; the task bounds itself with the data-confirm
    /// timeout.
    async fn data_request_with_confirm(
        &self,
        stack: &Stack,
        frame: OutgoingFrame,
        src_endpoint: u8,
        tsn: u8,
    ) -> Result<Status, ControllerError> {
        let znp = stack.znp.clone();
        let deadline = self.config.effective_data_confirm_timeout();
        let confirm = af::DataConfirmPattern {
            endpoint: Some(src_endpoint),
            tsn: Some(tsn),
            ..Default::default()
        };

        let task = tokio::spawn(async move {
            let wait = async {
                match frame {
                    OutgoingFrame::Ext(request) => {
                        znp.request_callback_rsp(
                            request,
                            af::DataRequestExtRspPattern {
                                status: Some(Status::Success),
                            },
                            confirm,
                        )
                        .await
                    }
                    OutgoingFrame::SrcRtg(request) => {
                        znp.request_callback_rsp(
                            request,
                            af::DataRequestSrcRtgRspPattern {
                                status: Some(Status::Success),
                            },
                            confirm,
                        )
                        .await
                    }
                }
            };

            tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| ProtocolError::Timeout)?
        });

        let confirm = task
            .await
            .map_err(|_| ControllerError::Startup("data request task failed".into()))??;
        Ok(confirm.status)
    }

    /// Trigger route discovery, coalescing concurrent discoveries to the
    /// same destination into one in-flight request
    async fn discover_route(&self, stack: &Stack, dst_nwk: u16) {
        use dashmap::mapref::entry::Entry;

        let mut done = match self.route_discovery.entry(dst_nwk) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(slot) => {
                let (tx, rx) = broadcast::channel(1);
                slot.insert(tx.clone());

                let znp = stack.znp.clone();
                let discoveries = self.route_discovery.clone();
                tokio::spawn(async move {
                    tracing::debug!(
                        dst = %format_args!("{dst_nwk:#06X}"),
                        "starting route discovery"
                    );
                    let result = znp
                        .request(
                            zdo_cmd::ExtRouteDisc {
                                dst: dst_nwk,
                                options: zdo_cmd::RouteDiscoveryOptions::Unicast,
                                radius: REQUEST_RADIUS,
                            },
                            zdo_cmd::ExtRouteDiscRspPattern {
                                status: Some(Status::Success),
                            },
                        )
                        .await;

                    if let Err(error) = &result {
                        tracing::warn!(%error, "route discovery failed");
                    }
                    discoveries.remove(&dst_nwk);
                    let _ = tx.send(result.is_ok());
                });
                rx
            }
        };

        let _ = done.recv().await;
    }

    async fn remove_stale_association(
        &self,
        stack: &Stack,
        ieee: Eui64,
        nwk: u16,
    ) -> Result<Option<NodeRelation>, ControllerError> {
        let rsp = stack
            .znp
            .request(
                util::AssocGetWithAddress { ieee, nwk },
                util::AssocGetWithAddressRspPattern::default(),
            )
            .await?;

        let device = rsp.device;
        if device.is_empty() || device.node_relation == NodeRelation::NotUsed {
            return Ok(None);
        }

        tracing::info!(
            nwk = %format_args!("{nwk:#06X}"),
            relation = ?device.node_relation,
            "removing stale child association"
        );
        let removed = stack
            .znp
            .request(
                util::AssocRemove { ieee },
                util::AssocRemoveRspPattern::default(),
            )
            .await?;

        if removed.status == Status::Success {
            Ok(Some(device.node_relation))
        } else {
            Ok(None)
        }
    }

    async fn restore_association(
        &self,
        stack: &Stack,
        nwk: u16,
        ieee: Eui64,
        relation: NodeRelation,
    ) {
        if let Err(error) = stack
            .znp
            .request(
                util::AssocAdd {
                    nwk,
                    ieee,
                    node_relation: relation,
                },
                util::AssocAddRspPattern {
                    status: Some(Status::Success),
                },
            )
            .await
        {
            tracing::warn!(%error, "failed to restore the association");
        }
    }

    /// Open the join window network-wide
    ///
    /// Broadcast permit-join must go through `ZDO.MgmtPermitJoinReq`;
    /// sent as a raw AF broadcast the coordinator would not hand out the
    /// network key during the window.
    pub async fn permit_join(&self, duration: u8) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;

        let rsp = stack
            .znp
            .request_callback_rsp(
                zdo_cmd::MgmtPermitJoinReq {
                    addr_mode: AddrMode::Broadcast,
                    dst: BROADCAST_ROUTERS,
                    duration,
                    tc_significance: 0,
                },
                zdo_cmd::MgmtPermitJoinReqRspPattern {
                    status: Some(Status::Success),
                },
                zdo_cmd::MgmtPermitJoinRspPattern::default(),
            )
            .await?;

        if rsp.status != Status::Success {
            return Err(ControllerError::Delivery { status: rsp.status });
        }
        Ok(())
    }

    /// Forcibly remove a device from the coprocessor's tables
    pub async fn force_remove(&self, nwk: u16, ieee: Eui64) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;
        stack
            .znp
            .request(
                zdo_cmd::MgmtLeaveReq {
                    dst_addr: nwk,
                    ieee,
                    options: znp_protocol::types::LeaveOptions::NONE,
                },
                zdo_cmd::MgmtLeaveReqRspPattern {
                    status: Some(Status::Success),
                },
            )
            .await?;
        Ok(())
    }

    /// Set the radio TX power
    pub async fn set_tx_power(&self, dbm: i8) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;
        apply_tx_power(&stack.znp, stack.generation, dbm).await
    }

    /// Read the coprocessor's addresses and state
    pub async fn device_info(&self) -> Result<util::GetDeviceInfoRsp, ControllerError> {
        let stack = self.stack_handle().await?;
        Ok(stack
            .znp
            .request(
                util::GetDeviceInfo {},
                util::GetDeviceInfoRspPattern {
                    status: Some(Status::Success),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Capture the full network state for a later restore
    pub async fn backup(&self) -> Result<NetworkBackup, ControllerError> {
        let stack = self.stack_handle().await?;

        let (tclk_seed, devices) =
            security::read_devices(&stack.nvram, stack.generation).await?;
        let tc_frame_counter =
            security::read_tc_frame_counter(&stack.nvram, stack.generation, &stack.network)
                .await?;

        Ok(NetworkBackup {
            network: stack.network.clone(),
            tc_frame_counter,
            tclk_seed,
            devices,
        })
    }

    /// Restore a previously captured network
    ///
    /// Forms a network with the backup's identity, writes the device and
    /// key tables, and advances the trust center frame counter by a
    /// safety margin so post-restore transmissions are accepted as fresh.
    pub async fn restore(&self, backup: &NetworkBackup) -> Result<(), ControllerError> {
        let stack = self.stack_handle().await?;

        let params = FormParams {
            pan_id: backup.network.pan_id,
            extended_pan_id: backup.network.extended_pan_id,
            network_key: backup.network.network_key,
            channels: Channels::from_channel_list([backup.network.channel]),
            ieee: Some(backup.network.ieee),
        };
        self.form_network(&stack.znp, &stack.nvram, stack.generation, &params)
            .await?;

        security::write_devices(
            &stack.nvram,
            stack.generation,
            &backup.devices,
            TC_COUNTER_INCREMENT,
            backup.tclk_seed,
        )
        .await?;

        let network = network::load_network_info(&stack.nvram, stack.generation).await?;
        security::write_tc_frame_counter(
            &stack.nvram,
            stack.generation,
            &network,
            backup.tc_frame_counter + TC_COUNTER_INCREMENT,
        )
        .await?;

        self.reset(&stack.znp).await?;

        let network = network::load_network_info(&stack.nvram, stack.generation).await?;
        if let Some(live) = self.stack.write().await.as_mut() {
            live.network = network;
        }
        Ok(())
    }
}

async fn apply_tx_power(
    znp: &Arc<Znp>,
    generation: FirmwareGeneration,
    dbm: i8,
) -> Result<(), ControllerError> {
    let rsp = znp
        .request(
            sys::SetTxPower { tx_power: dbm },
            sys::SetTxPowerRspPattern::default(),
        )
        .await?;

    // The SRSP byte changed meaning between generations: a status on
    // 3.30+, the applied dBm value before that
    if generation == FirmwareGeneration::ZStack330 {
        let status = Status::from_u8(rsp.status_or_power);
        if status != Status::Success {
            return Err(ControllerError::Startup(format!(
                "TX power change rejected: {status:?}"
            )));
        }
    } else {
        let applied = rsp.status_or_power as i8;
        if applied != dbm {
            tracing::warn!(requested = dbm, applied, "TX power was clipped by the radio");
        }
    }
    Ok(())
}

/// Endpoints registered at startup. ZHA endpoints cover the profile the
/// upstream stack speaks; the ZLL endpoint sits on endpoint 2 on older
/// builds and endpoint 1 on newer ones.
fn endpoint_table(build_id: Option<u32>) -> &'static [(u8, u16)] {
    const OLD_LAYOUT: [(u8, u16); 7] = [
        (1, ZHA_PROFILE),
        (2, ZLL_PROFILE),
        (8, ZHA_PROFILE),
        (11, ZHA_PROFILE),
        (12, ZHA_PROFILE),
        (47, ZHA_PROFILE),
        (100, ZLL_PROFILE),
    ];
    const NEW_LAYOUT: [(u8, u16); 7] = [
        (1, ZLL_PROFILE),
        (2, ZHA_PROFILE),
        (8, ZHA_PROFILE),
        (11, ZHA_PROFILE),
        (12, ZHA_PROFILE),
        (47, ZHA_PROFILE),
        (100, ZLL_PROFILE),
    ];

    match build_id {
        Some(build) if build >= NEW_ENDPOINT_LAYOUT_MIN_BUILD => &NEW_LAYOUT,
        Some(build) => {
            tracing::debug!(build, "using the pre-move endpoint layout");
            &OLD_LAYOUT
        }
        None => &OLD_LAYOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use znp_protocol::commands::MtCommand;
    use znp_protocol::frame::GeneralFrame;
    use znp_protocol::ZnpConfig;

    #[test]
    fn test_endpoint_layout_selection() {
        // Old and unreported builds keep the ZLL endpoint on endpoint 2
        assert_eq!(endpoint_table(None)[1], (2, ZLL_PROFILE));
        assert_eq!(endpoint_table(Some(20201026))[0], (1, ZHA_PROFILE));

        // Newer builds move it to endpoint 1
        assert_eq!(endpoint_table(Some(20210708))[0], (1, ZLL_PROFILE));
        assert_eq!(endpoint_table(Some(20220219))[1], (2, ZHA_PROFILE));
    }

    fn test_stack(znp: Arc<Znp>) -> Stack {
        Stack {
            nvram: Nvram::new(znp.clone(), MtCapabilities::SYS, Alignment::Aligned),
            znp,
            capabilities: MtCapabilities::SYS,
            generation: FirmwareGeneration::ZStack330,
            build_id: Some(20220219),
            network: NetworkInfo {
                ieee: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
                nwk: 0x0000,
                channel: 15,
                channel_mask: Channels::from_channel_list([15]),
                pan_id: 0xA162,
                extended_pan_id: Eui64([0xDD; 8]),
                nwk_update_id: 0,
                security_level: 5,
                network_key: KeyData([0x42; 16]),
                network_key_seq: 0,
            },
            semaphore: Arc::new(Semaphore::new(16)),
        }
    }

    fn test_controller(znp: Arc<Znp>) -> Arc<Controller> {
        let (event_tx, _) = broadcast::channel(16);
        Arc::new(Controller {
            config: ControllerConfig::new("test"),
            stack: RwLock::new(Some(test_stack(znp))),
            event_tx,
            route_discovery: Arc::new(DashMap::new()),
            relays: Arc::new(DashMap::new()),
        })
    }

    /// Answers data requests with a scripted sequence of confirm statuses
    /// and accepts route discoveries
    fn spawn_radio(
        znp: Arc<Znp>,
        mut writes: mpsc::Receiver<GeneralFrame>,
        confirm_statuses: Vec<Status>,
    ) -> Arc<std::sync::Mutex<Vec<GeneralFrame>>> {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut confirms = confirm_statuses.into_iter();
            while let Some(frame) = writes.recv().await {
                log.lock().unwrap().push(frame.clone());

                if frame.header == <af::DataRequestExt as MtCommand>::HEADER {
                    let mut buf = frame.payload.as_slice();
                    let req = af::DataRequestExt::decode_payload(&mut buf).unwrap();
                    znp.frame_received(
                        &af::DataRequestExtRsp {
                            status: Status::Success,
                        }
                        .to_frame(),
                    );
                    znp.frame_received(
                        &af::DataConfirm {
                            status: confirms.next().unwrap_or(Status::Success),
                            endpoint: req.src_endpoint,
                            tsn: req.tsn,
                        }
                        .to_frame(),
                    );
                } else if frame.header == <zdo_cmd::ExtRouteDisc as MtCommand>::HEADER {
                    znp.frame_received(
                        &zdo_cmd::ExtRouteDiscRsp {
                            status: Status::Success,
                        }
                        .to_frame(),
                    );
                } else {
                    panic!("radio got an unexpected frame: {:?}", frame.header);
                }
            }
        });

        seen
    }

    #[tokio::test]
    async fn test_unicast_success() {
        let (znp, writes) = Znp::detached(ZnpConfig::default());
        let controller = test_controller(znp.clone());
        let seen = spawn_radio(znp, writes, vec![Status::Success]);

        controller
            .request(0x1234, None, 1, 1, 0x0006, 0x42, &[0x01, 0x02], false)
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_route_triggers_route_discovery_then_retries() {
        let (znp, writes) = Znp::detached(ZnpConfig::default());
        let controller = test_controller(znp.clone());
        let seen = spawn_radio(znp, writes, vec![Status::NwkNoRoute, Status::Success]);

        controller
            .request(0x1234, None, 1, 1, 0x0006, 0x42, &[0x01], false)
            .await
            .unwrap();

        let frames = seen.lock().unwrap();
        let headers: Vec<_> = frames.iter().map(|f| f.header).collect();
        assert_eq!(
            headers,
            [
                <af::DataRequestExt as MtCommand>::HEADER,
                <zdo_cmd::ExtRouteDisc as MtCommand>::HEADER,
                <af::DataRequestExt as MtCommand>::HEADER,
            ]
        );
    }

    #[tokio::test]
    async fn test_persistent_mac_no_ack_switches_to_ieee() {
        let (znp, writes) = Znp::detached(ZnpConfig::default());
        let controller = test_controller(znp.clone());
        let seen = spawn_radio(znp, writes, vec![Status::MacNoAck, Status::Success]);

        let ieee = Eui64([0x11; 8]);
        controller
            .request(0x1234, Some(ieee), 1, 1, 0x0006, 0x42, &[0x01], false)
            .await
            .unwrap();

        let frames = seen.lock().unwrap();
        assert_eq!(frames.len(), 2);

        let mut buf = frames[1].payload.as_slice();
        let retried = af::DataRequestExt::decode_payload(&mut buf).unwrap();
        assert_eq!(retried.dst_addr, Address::Ieee(ieee));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_status() {
        let (znp, writes) = Znp::detached(ZnpConfig::default());
        let controller = test_controller(znp.clone());
        let _seen = spawn_radio(znp, writes, vec![Status::ApsNoAck; REQUEST_MAX_ATTEMPTS]);

        let result = controller
            .request(0x1234, None, 1, 1, 0x0006, 0x42, &[0x01], false)
            .await;

        assert!(matches!(
            result,
            Err(ControllerError::Delivery {
                status: Status::ApsNoAck
            })
        ));
    }

    #[tokio::test]
    async fn test_zdo_response_is_injected_upstream() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());
        let controller = test_controller(znp.clone());
        let mut events = controller.subscribe();

        let responder = async {
            let _req = writes.recv().await.unwrap();
            znp.frame_received(
                &zdo_cmd::ActiveEpReqRsp {
                    status: Status::Success,
                }
                .to_frame(),
            );
            znp.frame_received(
                &zdo_cmd::ActiveEpRsp {
                    src: 0x1234,
                    status: Status::Success,
                    nwk: 0x1234,
                    active_endpoints: ShortList(vec![1]),
                }
                .to_frame(),
            );
        };

        let request = controller.request(
            0x1234,
            None,
            zdo::ZDO_ENDPOINT,
            zdo::ZDO_ENDPOINT,
            zdo::cluster::ACTIVE_EP_REQ,
            0x77,
            &[0x77, 0x34, 0x12],
            false,
        );

        let (result, ()) = tokio::join!(request, responder);
        result.unwrap();

        let event = events.recv().await.unwrap();
        match event {
            ControllerEvent::ApsMessage(message) => {
                assert_eq!(message.src, 0x1234);
                assert_eq!(message.cluster, 0x8005);
                assert_eq!(message.dst_endpoint, zdo::ZDO_ENDPOINT);
                assert_eq!(message.data[0], 0x77);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
