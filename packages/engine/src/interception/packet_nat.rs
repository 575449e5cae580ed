// packages/engine/src/interception/packet_nat.rs
//! Packet-level translation for pods whose traffic bypasses socket hooks
//!
//! Runs on traffic-control ingress and egress of a pod interface. The first
//! packet of a flow records the original destination; every packet then has
//! its ports (and for DNS, addresses) rewritten with incremental checksum
//! patches.
//!
//! ```text
//! egress  10.0.0.5:51000 → bridge:8080     ──► bridge:15001
//!         svc_nat[{bridge:15001, 10.0.0.5:51000}] = bridge:8080   (SYN only)
//! ingress bridge:15001 → 10.0.0.5:51000    ──► bridge:8080 → 10.0.0.5:51000
//!
//! egress  10.0.0.5:40000 → 8.8.8.8:53      ──► bridge:15053
//!         dns_nat[{bridge:15053, 10.0.0.5:40000}] = 8.8.8.8:53
//! ingress bridge:15053 → 10.0.0.5:40000    ──► 8.8.8.8:53 → 10.0.0.5:40000
//! ```
//!
//! Frames are parsed as Ethernet → IPv4 → (one optional IP-in-IP layer) →
//! TCP/UDP. Truncation of the outer layers or the transport header drops the
//! frame; anything not understood is passed untouched.

use crate::interception::{record_outcome, record_update_failure};
use crate::packet::buffer::{CsumFlags, FieldChange, PacketBuf, PacketError};
use crate::packet::headers::{
    ethertype, HeaderError, Ipv4View, TcpView, UdpView, ETH_HLEN, ETH_P_IP, IPPROTO_IPIP,
};
use crate::packet::checksum::{IPPROTO_TCP, IPPROTO_UDP};
use crate::state::flow::{Endpoint, FlowKey, OriginRecord};
use crate::state::store::{StoreError, UpdateFlag};
use crate::state::tables::{DatapathTables, FlowTable};
use crate::utils::config::DatapathConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Traffic-control attachment side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    /// Leaving the pod
    Egress,

    /// Entering the pod
    Ingress,
}

impl TrafficDirection {
    fn hook(&self) -> &'static str {
        match self {
            TrafficDirection::Egress => "tc_egress",
            TrafficDirection::Ingress => "tc_ingress",
        }
    }
}

/// Classifier action handed back to traffic control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TcAction {
    Ok,
    Shot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    NotIpv4,
    InnerTruncated,
    InnerBadIhl,
    OtherProtocol(u8),
    /// Addresses or ports outside the intercepted set
    NotIntercepted,
    /// Reply for a flow with no recorded origin
    NoRecord,
    /// Origin could not be recorded; left untranslated
    StoreFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    EthernetTruncated,
    Ipv4Truncated,
    Ipv4BadIhl,
    TransportTruncated,
    RewriteFailed,
}

/// What the translator did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PacketDisposition {
    Translated {
        /// `{source, destination}` as received
        before: FlowKey,
        /// `{source, destination}` as emitted
        after: FlowKey,
        /// A new origin record was created by this packet
        recorded: bool,
        /// The origin record was released by this packet
        released: bool,
    },

    Passed { reason: PassReason },

    Dropped { reason: DropReason },
}

impl PacketDisposition {
    pub fn action(&self) -> TcAction {
        match self {
            PacketDisposition::Dropped { .. } => TcAction::Shot,
            _ => TcAction::Ok,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            PacketDisposition::Translated { .. } => "translated",
            PacketDisposition::Passed { .. } => "passed",
            PacketDisposition::Dropped { .. } => "dropped",
        }
    }

    fn passed(reason: PassReason) -> Self {
        PacketDisposition::Passed { reason }
    }

    fn dropped(reason: DropReason) -> Self {
        PacketDisposition::Dropped { reason }
    }
}

enum Transport {
    Tcp(TcpView),
    Udp(UdpView),
}

pub struct PacketLevelTranslator {
    bridge_ip: Ipv4Addr,
    proxy_port: u16,
    dns_proxy_port: u16,
    dns_capture_port: u16,
    svc_nat: FlowTable,
    dns_nat: FlowTable,
}

impl PacketLevelTranslator {
    pub fn new(config: DatapathConfig, tables: &DatapathTables) -> Self {
        Self {
            bridge_ip: config.bridge_ip,
            proxy_port: config.proxy_port,
            dns_proxy_port: config.dns_proxy_port,
            dns_capture_port: config.dns_capture_port,
            svc_nat: tables.svc_nat.clone(),
            dns_nat: tables.dns_nat.clone(),
        }
    }

    pub fn on_egress(&self, pkt: &mut PacketBuf) -> PacketDisposition {
        self.process(pkt, TrafficDirection::Egress)
    }

    pub fn on_ingress(&self, pkt: &mut PacketBuf) -> PacketDisposition {
        self.process(pkt, TrafficDirection::Ingress)
    }

    pub fn process(&self, pkt: &mut PacketBuf, direction: TrafficDirection) -> PacketDisposition {
        let disposition = match locate(pkt) {
            Ok((ip, Transport::Tcp(tcp))) => match direction {
                TrafficDirection::Egress => self.egress_tcp(pkt, &ip, &tcp),
                TrafficDirection::Ingress => self.ingress_tcp(pkt, &ip, &tcp),
            },
            Ok((ip, Transport::Udp(udp))) => match direction {
                TrafficDirection::Egress => self.egress_udp(pkt, &ip, &udp),
                TrafficDirection::Ingress => self.ingress_udp(pkt, &ip, &udp),
            },
            Err(disposition) => disposition,
        };

        if let PacketDisposition::Dropped { reason } = disposition {
            debug!(?direction, ?reason, len = pkt.len(), "Frame dropped");
        }

        record_outcome(direction.hook(), disposition.outcome());
        disposition
    }

    fn egress_tcp(&self, pkt: &mut PacketBuf, ip: &Ipv4View, tcp: &TcpView) -> PacketDisposition {
        if ip.daddr != self.bridge_ip || tcp.dport == self.proxy_port {
            return PacketDisposition::passed(PassReason::NotIntercepted);
        }

        let client = Endpoint::new(ip.saddr, tcp.sport);
        let origin = OriginRecord::new(ip.daddr, tcp.dport);

        let mut recorded = false;
        if tcp.flags.is_initial_syn() {
            let key = FlowKey::new(Endpoint::new(self.bridge_ip, self.proxy_port), client);
            match record_first(&self.svc_nat, key, origin) {
                Ok(created) => recorded = created,
                Err(()) => return PacketDisposition::passed(PassReason::StoreFailure),
            }
        }

        let result = rewrite_port(
            pkt,
            tcp.dport_offset(),
            tcp.check_offset(),
            tcp.dport,
            self.proxy_port,
            CsumFlags::TCP,
        );
        if let Err(e) = result {
            return rewrite_failed(e);
        }

        let before = FlowKey::new(client, origin.endpoint());
        let after = FlowKey::new(client, Endpoint::new(ip.daddr, self.proxy_port));
        debug!(%before, %after, recorded, "TCP egress DNAT");

        PacketDisposition::Translated {
            before,
            after,
            recorded,
            released: false,
        }
    }

    fn egress_udp(&self, pkt: &mut PacketBuf, ip: &Ipv4View, udp: &UdpView) -> PacketDisposition {
        if udp.dport != self.dns_capture_port || ip.daddr == self.bridge_ip {
            return PacketDisposition::passed(PassReason::NotIntercepted);
        }

        let client = Endpoint::new(ip.saddr, udp.sport);
        let origin = OriginRecord::new(ip.daddr, udp.dport);
        let proxy = Endpoint::new(self.bridge_ip, self.dns_proxy_port);

        let key = FlowKey::new(proxy, client);
        let recorded = match record_first(&self.dns_nat, key, origin) {
            Ok(created) => created,
            Err(()) => return PacketDisposition::passed(PassReason::StoreFailure),
        };

        let result = rewrite_port(
            pkt,
            udp.dport_offset(),
            udp.check_offset(),
            udp.dport,
            proxy.port,
            CsumFlags::UDP,
        )
        .and_then(|_| {
            rewrite_addr(
                pkt,
                ip,
                ip.daddr_offset(),
                udp.check_offset(),
                ip.daddr,
                proxy.ip,
                CsumFlags::UDP,
            )
        });
        if let Err(e) = result {
            return rewrite_failed(e);
        }

        let before = FlowKey::new(client, origin.endpoint());
        let after = FlowKey::new(client, proxy);
        debug!(%before, %after, recorded, "DNS egress DNAT");

        PacketDisposition::Translated {
            before,
            after,
            recorded,
            released: false,
        }
    }

    fn ingress_tcp(&self, pkt: &mut PacketBuf, ip: &Ipv4View, tcp: &TcpView) -> PacketDisposition {
        if ip.saddr != self.bridge_ip || tcp.sport != self.proxy_port {
            return PacketDisposition::passed(PassReason::NotIntercepted);
        }

        let key = FlowKey::new(
            Endpoint::new(ip.saddr, tcp.sport),
            Endpoint::new(ip.daddr, tcp.dport),
        );
        let origin = match self.svc_nat.lookup(&key) {
            Some(origin) => origin,
            None => return PacketDisposition::passed(PassReason::NoRecord),
        };

        let released = tcp.flags.is_fin_ack();
        if released {
            match self.svc_nat.delete(&key) {
                // Already gone: evicted, or a retransmitted FIN
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => {
                    debug!(%key, error = %e, "Failed to release packet-level flow");
                    record_update_failure(self.svc_nat.name());
                }
            }
        }

        let mut result = rewrite_port(
            pkt,
            tcp.sport_offset(),
            tcp.check_offset(),
            tcp.sport,
            origin.port,
            CsumFlags::TCP,
        );
        if origin.ip != ip.saddr {
            result = result.and_then(|_| {
                rewrite_addr(
                    pkt,
                    ip,
                    ip.saddr_offset(),
                    tcp.check_offset(),
                    ip.saddr,
                    origin.ip,
                    CsumFlags::TCP,
                )
            });
        }
        if let Err(e) = result {
            return rewrite_failed(e);
        }

        let after = FlowKey::new(origin.endpoint(), key.dst);
        debug!(before = %key, %after, released, "TCP ingress SNAT");

        PacketDisposition::Translated {
            before: key,
            after,
            recorded: false,
            released,
        }
    }

    fn ingress_udp(&self, pkt: &mut PacketBuf, ip: &Ipv4View, udp: &UdpView) -> PacketDisposition {
        if udp.sport != self.dns_proxy_port || ip.saddr != self.bridge_ip {
            return PacketDisposition::passed(PassReason::NotIntercepted);
        }

        let key = FlowKey::new(
            Endpoint::new(ip.saddr, udp.sport),
            Endpoint::new(ip.daddr, udp.dport),
        );
        let origin = match self.dns_nat.lookup(&key) {
            Some(origin) => origin,
            None => return PacketDisposition::passed(PassReason::NoRecord),
        };

        let result = rewrite_port(
            pkt,
            udp.sport_offset(),
            udp.check_offset(),
            udp.sport,
            origin.port,
            CsumFlags::UDP,
        )
        .and_then(|_| {
            rewrite_addr(
                pkt,
                ip,
                ip.saddr_offset(),
                udp.check_offset(),
                ip.saddr,
                origin.ip,
                CsumFlags::UDP,
            )
        });
        if let Err(e) = result {
            return rewrite_failed(e);
        }

        let after = FlowKey::new(origin.endpoint(), key.dst);
        debug!(before = %key, %after, "DNS ingress SNAT");

        PacketDisposition::Translated {
            before: key,
            after,
            recorded: false,
            released: false,
        }
    }
}

/// Walk the frame down to its transport header
fn locate(pkt: &PacketBuf) -> Result<(Ipv4View, Transport), PacketDisposition> {
    match ethertype(pkt) {
        Ok(ETH_P_IP) => {}
        Ok(_) => return Err(PacketDisposition::passed(PassReason::NotIpv4)),
        Err(_) => return Err(PacketDisposition::dropped(DropReason::EthernetTruncated)),
    }

    let mut ip = Ipv4View::parse(pkt, ETH_HLEN).map_err(|e| match e {
        HeaderError::Truncated => PacketDisposition::dropped(DropReason::Ipv4Truncated),
        HeaderError::BadIhl(_) => PacketDisposition::dropped(DropReason::Ipv4BadIhl),
    })?;

    if ip.protocol == IPPROTO_IPIP {
        ip = Ipv4View::parse(pkt, ip.payload_offset()).map_err(|e| {
            let reason = match e {
                HeaderError::Truncated => PassReason::InnerTruncated,
                HeaderError::BadIhl(_) => PassReason::InnerBadIhl,
            };
            PacketDisposition::passed(reason)
        })?;
    }

    let offset = ip.payload_offset();
    let truncated = |_| PacketDisposition::dropped(DropReason::TransportTruncated);
    let transport = match ip.protocol {
        IPPROTO_TCP => Transport::Tcp(TcpView::parse(pkt, offset).map_err(truncated)?),
        IPPROTO_UDP => Transport::Udp(UdpView::parse(pkt, offset).map_err(truncated)?),
        other => return Err(PacketDisposition::passed(PassReason::OtherProtocol(other))),
    };

    Ok((ip, transport))
}

/// Insert-if-absent; `Ok(false)` when the flow was already recorded
fn record_first(table: &FlowTable, key: FlowKey, origin: OriginRecord) -> Result<bool, ()> {
    match table.update(key, origin, UpdateFlag::NoExist) {
        Ok(()) => Ok(true),
        Err(StoreError::KeyExists) => Ok(false),
        Err(e) => {
            warn!(
                table = table.name(),
                %key,
                %origin,
                error = %e,
                "Failed to record packet flow origin, passing untranslated"
            );
            record_update_failure(table.name());
            Err(())
        }
    }
}

fn rewrite_port(
    pkt: &mut PacketBuf,
    port_offset: usize,
    check_offset: usize,
    old: u16,
    new: u16,
    flags: CsumFlags,
) -> Result<(), PacketError> {
    pkt.l4_csum_replace(check_offset, FieldChange::U16 { old, new }, flags)?;
    pkt.write_u16(port_offset, new)
}

fn rewrite_addr(
    pkt: &mut PacketBuf,
    ip: &Ipv4View,
    addr_offset: usize,
    check_offset: usize,
    old: Ipv4Addr,
    new: Ipv4Addr,
    flags: CsumFlags,
) -> Result<(), PacketError> {
    let change = FieldChange::U32 {
        old: u32::from(old),
        new: u32::from(new),
    };
    pkt.l4_csum_replace(check_offset, change, flags.pseudo())?;
    pkt.l3_csum_replace(ip.check_offset(), change)?;
    pkt.write_u32(addr_offset, u32::from(new))
}

fn rewrite_failed(err: PacketError) -> PacketDisposition {
    warn!(error = %err, "Packet rewrite failed");
    PacketDisposition::dropped(DropReason::RewriteFailed)
}
