//! ZDO request rewriting
//!
//! The firmware intercepts ZDO traffic: requests must be issued as MT
//! `ZDO.*` commands and replies come back as MT callbacks instead of AF
//! messages. This module translates between the over-the-air ZDO frame
//! representation used upstream and the MT command set, so the upstream
//! stack sees an ordinary ZDO endpoint.

use std::sync::Arc;

use znp_protocol::codec::Codec;
use znp_protocol::commands::zdo;
use znp_protocol::types::{
    AddrMode, BindAddress, Channels, Eui64, LeaveOptions, Status,
};
use znp_protocol::Znp;

use crate::error::ControllerError;

/// ZDO management plane endpoint
pub const ZDO_ENDPOINT: u8 = 0;

/// ZDO profile id
pub const ZDO_PROFILE: u16 = 0x0000;

/// ZDO cluster ids the rewriter understands
pub mod cluster {
    pub const NODE_DESC_REQ: u16 = 0x0002;
    pub const SIMPLE_DESC_REQ: u16 = 0x0004;
    pub const ACTIVE_EP_REQ: u16 = 0x0005;
    pub const BIND_REQ: u16 = 0x0021;
    pub const MGMT_LQI_REQ: u16 = 0x0031;
    pub const MGMT_RTG_REQ: u16 = 0x0032;
    pub const MGMT_LEAVE_REQ: u16 = 0x0034;
    pub const MGMT_PERMIT_JOINING_REQ: u16 = 0x0036;
    pub const MGMT_NWK_UPDATE_REQ: u16 = 0x0038;

    /// A response cluster is its request cluster with the high bit set
    pub const RESPONSE_FLAG: u16 = 0x8000;
}

/// True for the NWK broadcast address range
#[must_use]
pub fn is_broadcast(nwk: u16) -> bool {
    nwk >= 0xFFF8
}

/// Whether the rewriter handles this ZDO cluster
#[must_use]
pub fn is_supported_cluster(cluster_id: u16) -> bool {
    matches!(
        cluster_id,
        cluster::NODE_DESC_REQ
            | cluster::SIMPLE_DESC_REQ
            | cluster::ACTIVE_EP_REQ
            | cluster::BIND_REQ
            | cluster::MGMT_LQI_REQ
            | cluster::MGMT_RTG_REQ
            | cluster::MGMT_LEAVE_REQ
            | cluster::MGMT_PERMIT_JOINING_REQ
            | cluster::MGMT_NWK_UPDATE_REQ
    )
}

/// A synthesized ZDO response, ready to be injected upstream as if it had
/// arrived as an AF message from the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZdoResponse {
    pub cluster: u16,
    /// TSN followed by the response fields, serialized per the ZDO spec
    pub payload: Vec<u8>,
}

struct Cursor<'a> {
    cluster: u16,
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take<T: Codec>(&mut self) -> Result<T, ControllerError> {
        T::decode(&mut self.buf).map_err(|_| ControllerError::MalformedZdoRequest {
            cluster: self.cluster,
        })
    }
}

/// Issue the MT equivalent of a ZDO request and synthesize its response
///
/// `asdu` is the over-the-air ZDO frame: the TSN byte followed by the
/// request fields. The returned payload carries the caller's TSN so the
/// upstream transaction matching keeps working.
pub async fn rewrite_request(
    znp: &Arc<Znp>,
    dst: u16,
    cluster_id: u16,
    asdu: &[u8],
) -> Result<ZdoResponse, ControllerError> {
    let (&tsn, fields) = asdu
        .split_first()
        .ok_or(ControllerError::MalformedZdoRequest { cluster: cluster_id })?;
    let mut cursor = Cursor {
        cluster: cluster_id,
        buf: fields,
    };

    tracing::debug!(dst, cluster = cluster_id, tsn, "rewriting ZDO request");

    let mut payload = vec![tsn];
    match cluster_id {
        cluster::NODE_DESC_REQ => {
            let nwk_addr_of_interest: u16 = cursor.take()?;
            let rsp = znp
                .request_callback_rsp(
                    zdo::NodeDescReq {
                        dst_addr: dst,
                        nwk_addr_of_interest,
                    },
                    zdo::NodeDescReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::NodeDescRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.nwk.encode(&mut payload);
            rsp.descriptor.encode(&mut payload);
        }

        cluster::ACTIVE_EP_REQ => {
            let nwk_addr_of_interest: u16 = cursor.take()?;
            let rsp = znp
                .request_callback_rsp(
                    zdo::ActiveEpReq {
                        dst_addr: dst,
                        nwk_addr_of_interest,
                    },
                    zdo::ActiveEpReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::ActiveEpRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.nwk.encode(&mut payload);
            rsp.active_endpoints.encode(&mut payload);
        }

        cluster::SIMPLE_DESC_REQ => {
            let nwk_addr_of_interest: u16 = cursor.take()?;
            let endpoint: u8 = cursor.take()?;
            let rsp = znp
                .request_callback_rsp(
                    zdo::SimpleDescReq {
                        dst_addr: dst,
                        nwk_addr_of_interest,
                        endpoint,
                    },
                    zdo::SimpleDescReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::SimpleDescRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.nwk.encode(&mut payload);
            rsp.descriptor.encode(&mut payload);
        }

        cluster::BIND_REQ => {
            let src: Eui64 = cursor.take()?;
            let src_endpoint: u8 = cursor.take()?;
            let bind_cluster: u16 = cursor.take()?;
            let address: BindAddress = cursor.take()?;

            let rsp = znp
                .request_callback_rsp(
                    zdo::BindReq {
                        dst,
                        src,
                        src_endpoint,
                        cluster_id: bind_cluster,
                        address,
                    },
                    zdo::BindReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::BindRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
        }

        cluster::MGMT_LQI_REQ => {
            let start_index: u8 = cursor.take()?;
            let rsp = znp
                .request_callback_rsp(
                    zdo::MgmtLqiReq { dst, start_index },
                    zdo::MgmtLqiReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::MgmtLqiRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.neighbors.encode(&mut payload);
        }

        cluster::MGMT_RTG_REQ => {
            let start_index: u8 = cursor.take()?;
            let rsp = znp
                .request_callback_rsp(
                    zdo::MgmtRtgReq { dst, start_index },
                    zdo::MgmtRtgReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::MgmtRtgRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.routes.encode(&mut payload);
        }

        cluster::MGMT_LEAVE_REQ => {
            let ieee: Eui64 = cursor.take()?;
            let flags: u8 = cursor.take()?;

            let mut options = LeaveOptions::NONE;
            if flags & 0x40 != 0 {
                options |= LeaveOptions::REMOVE_CHILDREN;
            }
            if flags & 0x80 != 0 {
                options |= LeaveOptions::REJOIN;
            }

            let rsp = znp
                .request_callback_rsp(
                    zdo::MgmtLeaveReq {
                        dst_addr: dst,
                        ieee,
                        options,
                    },
                    zdo::MgmtLeaveReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::MgmtLeaveRspPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
        }

        cluster::MGMT_PERMIT_JOINING_REQ => {
            let duration: u8 = cursor.take()?;
            let tc_significance: u8 = cursor.take()?;

            let broadcast = is_broadcast(dst);
            let rsp = znp
                .request_callback_rsp(
                    zdo::MgmtPermitJoinReq {
                        addr_mode: if broadcast {
                            AddrMode::Broadcast
                        } else {
                            AddrMode::Nwk
                        },
                        dst,
                        duration,
                        tc_significance,
                    },
                    zdo::MgmtPermitJoinReqRspPattern {
                        status: Some(Status::Success),
                    },
                    // Broadcasts are answered by the coordinator itself,
                    // not the nominal destination
                    zdo::MgmtPermitJoinRspPattern {
                        src: if broadcast { None } else { Some(dst) },
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
        }

        cluster::MGMT_NWK_UPDATE_REQ => {
            let channels: Channels = cursor.take()?;
            let scan_duration: u8 = cursor.take()?;
            let scan_count: Option<u8> = cursor.take()?;

            let rsp = znp
                .request_callback_rsp(
                    zdo::MgmtNwkUpdateReq {
                        dst,
                        dst_addr_mode: AddrMode::Nwk,
                        channels,
                        scan_duration,
                        scan_count: scan_count.unwrap_or(1),
                        nwk_manager_addr: 0x0000,
                    },
                    zdo::MgmtNwkUpdateReqRspPattern {
                        status: Some(Status::Success),
                    },
                    zdo::MgmtNwkUpdateNotifyPattern {
                        src: Some(dst),
                        ..Default::default()
                    },
                )
                .await?;

            rsp.status.encode(&mut payload);
            rsp.scanned_channels.encode(&mut payload);
            rsp.total_transmissions.encode(&mut payload);
            rsp.transmission_failures.encode(&mut payload);
            rsp.energy_values.encode(&mut payload);
        }

        other => return Err(ControllerError::UnsupportedZdoCluster { cluster: other }),
    }

    Ok(ZdoResponse {
        cluster: cluster_id | cluster::RESPONSE_FLAG,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use znp_protocol::codec::{ShortBytes, ShortList};
    use znp_protocol::commands::MtCommand;
    use znp_protocol::frame::GeneralFrame;
    use znp_protocol::{Znp, ZnpConfig};

    async fn respond(
        znp: &Arc<Znp>,
        writes: &mut mpsc::Receiver<GeneralFrame>,
        srsp: impl MtCommand,
        callback: impl MtCommand,
    ) -> GeneralFrame {
        let request = writes.recv().await.unwrap();
        znp.frame_received(&srsp.to_frame());
        znp.frame_received(&callback.to_frame());
        request
    }

    #[tokio::test]
    async fn test_active_ep_request_rewrite() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        // TSN 0x15, NWKAddrOfInterest 0x1234
        let rewrite = rewrite_request(&znp, 0x1234, cluster::ACTIVE_EP_REQ, &[0x15, 0x34, 0x12]);

        let responder = respond(
            &znp,
            &mut writes,
            zdo::ActiveEpReqRsp {
                status: Status::Success,
            },
            zdo::ActiveEpRsp {
                src: 0x1234,
                status: Status::Success,
                nwk: 0x1234,
                active_endpoints: ShortList(vec![8, 1]),
            },
        );

        let (response, request) = tokio::join!(rewrite, responder);
        assert_eq!(
            request,
            zdo::ActiveEpReq {
                dst_addr: 0x1234,
                nwk_addr_of_interest: 0x1234,
            }
            .to_frame()
        );

        let response = response.unwrap();
        assert_eq!(response.cluster, 0x8005);
        // TSN, status, nwk, endpoint count, endpoints
        assert_eq!(response.payload, [0x15, 0x00, 0x34, 0x12, 0x02, 0x08, 0x01]);
    }

    #[tokio::test]
    async fn test_simple_desc_request_rewrite() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let rewrite = rewrite_request(
            &znp,
            0x5678,
            cluster::SIMPLE_DESC_REQ,
            &[0x20, 0x78, 0x56, 0x08],
        );

        let responder = respond(
            &znp,
            &mut writes,
            zdo::SimpleDescReqRsp {
                status: Status::Success,
            },
            zdo::SimpleDescRsp {
                src: 0x5678,
                status: Status::Success,
                nwk: 0x5678,
                descriptor: ShortBytes(vec![0x08, 0x04, 0x01, 0x00, 0x01]),
            },
        );

        let (response, request) = tokio::join!(rewrite, responder);
        assert_eq!(
            request,
            zdo::SimpleDescReq {
                dst_addr: 0x5678,
                nwk_addr_of_interest: 0x5678,
                endpoint: 0x08,
            }
            .to_frame()
        );

        let response = response.unwrap();
        assert_eq!(response.cluster, 0x8004);
        assert_eq!(
            response.payload,
            [0x20, 0x00, 0x78, 0x56, 0x05, 0x08, 0x04, 0x01, 0x00, 0x01]
        );
    }

    #[tokio::test]
    async fn test_permit_join_broadcast_uses_mt_command() {
        let (znp, mut writes) = Znp::detached(ZnpConfig::default());

        let rewrite = rewrite_request(
            &znp,
            0xFFFC,
            cluster::MGMT_PERMIT_JOINING_REQ,
            &[0x33, 0x3C, 0x00],
        );

        let responder = respond(
            &znp,
            &mut writes,
            zdo::MgmtPermitJoinReqRsp {
                status: Status::Success,
            },
            zdo::MgmtPermitJoinRsp {
                src: 0x0000,
                status: Status::Success,
            },
        );

        let (response, request) = tokio::join!(rewrite, responder);
        assert_eq!(
            request,
            zdo::MgmtPermitJoinReq {
                addr_mode: AddrMode::Broadcast,
                dst: 0xFFFC,
                duration: 0x3C,
                tc_significance: 0x00,
            }
            .to_frame()
        );
        assert_eq!(response.unwrap().payload, [0x33, 0x00]);
    }

    #[tokio::test]
    async fn test_unsupported_cluster() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());
        let result = rewrite_request(&znp, 0x1234, 0x0013, &[0x01]).await;
        assert!(matches!(
            result,
            Err(ControllerError::UnsupportedZdoCluster { cluster: 0x0013 })
        ));
    }

    #[tokio::test]
    async fn test_malformed_request_payload() {
        let (znp, _writes) = Znp::detached(ZnpConfig::default());
        let result = rewrite_request(&znp, 0x1234, cluster::ACTIVE_EP_REQ, &[0x15]).await;
        assert!(matches!(
            result,
            Err(ControllerError::MalformedZdoRequest { .. })
        ));
    }
}
