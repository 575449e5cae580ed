// packages/engine/src/replay.rs
//! Scenario replay
//!
//! Drives a [`Datapath`] through a scripted sequence of hook events and
//! reports what each hook decided. Scenarios are YAML:
//!
//! ```yaml
//! name: outbound-https
//! events:
//!   - connect: { dst: "93.184.216.34:443", uid: 1000, cookie: 42 }
//!   - established: { local: "10.0.0.5:51000", remote: "10.0.0.1:15001", cookie: 42, socket: 1 }
//!   - getsockopt: { src: "10.0.0.1:15001", dst: "10.0.0.5:51000" }
//! ```
//!
//! Reports serialize to JSON.

use crate::datapath::Datapath;
use crate::interception::context::AF_INET;
use crate::interception::sockopt::SO_ORIGINAL_DST;
use crate::interception::{
    ConnectDisposition, DnsDisposition, MsgDisposition, PacketDisposition, PairDisposition,
    Protocol, SkMsg, SockAddrCtx, SockOp, SockOpsCtx, SockOptCtx, SockOptDisposition, SockView,
    TcAction, TrafficDirection,
};
use crate::packet::builder::{checksums_valid, FrameBuilder, Transport};
use crate::packet::headers::TcpFlags;
use crate::state::flow::{Cookie, Endpoint, FlowKey, FlowState, SocketHandle};
use crate::state::tables::TableSizes;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_UID: u32 = 1000;

/// A named sequence of hook events
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub events: Vec<Event>,
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    Connect(ConnectEvent),
    Established(EstablishedEvent),
    Getsockopt(GetsockoptEvent),
    Sendmsg(SendmsgEvent),
    DnsSend(DnsEvent),
    DnsRecv(DnsEvent),
    Packet(PacketEvent),
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Connect(_) => "connect",
            Event::Established(_) => "established",
            Event::Getsockopt(_) => "getsockopt",
            Event::Sendmsg(_) => "sendmsg",
            Event::DnsSend(_) => "dns_send",
            Event::DnsRecv(_) => "dns_recv",
            Event::Packet(_) => "packet",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectEvent {
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub dst: Endpoint,
    #[serde(default = "default_uid")]
    pub uid: u32,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstablishedEvent {
    #[serde(default = "default_op")]
    pub op: SockOp,
    #[serde(default = "default_family")]
    pub family: u16,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub cookie: Cookie,
    pub socket: SocketHandle,
}

/// getsockopt issued on a socket whose local side is `src` and peer `dst`
#[derive(Debug, Clone, Deserialize)]
pub struct GetsockoptEvent {
    pub src: Endpoint,
    pub dst: Endpoint,
    #[serde(default = "default_optname")]
    pub optname: i32,
    #[serde(default = "default_optlen")]
    pub optlen: usize,
    #[serde(default = "default_family")]
    pub family: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendmsgEvent {
    pub local: Endpoint,
    pub remote: Endpoint,
    #[serde(default)]
    pub size: usize,
}

/// `addr` is the destination on send and the apparent sender on receive
#[derive(Debug, Clone, Deserialize)]
pub struct DnsEvent {
    pub addr: Endpoint,
    #[serde(default = "default_uid")]
    pub uid: u32,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpipOuter {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketEvent {
    pub direction: TrafficDirection,
    pub protocol: PacketProtocol,
    pub src: Endpoint,
    pub dst: Endpoint,
    #[serde(default)]
    pub flags: TcpFlags,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub ipip: Option<IpipOuter>,
    #[serde(default = "default_true")]
    pub udp_checksum: bool,
}

impl PacketEvent {
    fn frame(&self) -> FrameBuilder {
        let transport = match self.protocol {
            PacketProtocol::Tcp => Transport::Tcp { flags: self.flags },
            PacketProtocol::Udp => Transport::Udp {
                checksum: self.udp_checksum,
            },
        };

        let builder =
            FrameBuilder::new(self.src, self.dst, transport).payload(self.payload.as_bytes());
        match &self.ipip {
            Some(outer) => builder.ipip(outer.src, outer.dst),
            None => builder,
        }
    }
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_uid() -> u32 {
    DEFAULT_UID
}

fn default_op() -> SockOp {
    SockOp::ActiveEstablished
}

fn default_family() -> u16 {
    AF_INET
}

fn default_optname() -> i32 {
    SO_ORIGINAL_DST
}

fn default_optlen() -> usize {
    16
}

fn default_true() -> bool {
    true
}

/// Result of one replayed event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepOutcome {
    Connect {
        disposition: ConnectDisposition,
        /// Destination the connect proceeds with
        destination: Endpoint,
    },
    Established {
        disposition: PairDisposition,
        state: FlowState,
    },
    Getsockopt {
        disposition: SockOptDisposition,
        optlen: usize,
        retval: i32,
    },
    Sendmsg {
        disposition: MsgDisposition,
    },
    DnsSend {
        disposition: DnsDisposition,
        destination: Endpoint,
    },
    DnsRecv {
        disposition: DnsDisposition,
        /// Sender the application observes
        source: Endpoint,
    },
    Packet {
        disposition: PacketDisposition,
        action: TcAction,
        checksums_valid: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub scenario: String,
    pub steps: Vec<StepReport>,
    /// Table occupancy after the last event
    pub tables: TableSizes,
}

impl ReplayReport {
    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }
}

/// Replay every event of `scenario` in order against `datapath`
pub fn run(datapath: &Datapath, scenario: &Scenario) -> Result<ReplayReport> {
    if scenario.events.is_empty() {
        return Err(EngineError::ReplayFailed(format!(
            "scenario '{}' has no events",
            scenario.name
        )));
    }

    info!(scenario = %scenario.name, events = scenario.events.len(), "Replaying scenario");

    let steps = scenario
        .events
        .iter()
        .enumerate()
        .map(|(step, event)| {
            let outcome = replay_event(datapath, event);
            debug!(step, kind = event.kind(), ?outcome, "Replayed event");
            StepReport { step, outcome }
        })
        .collect();

    Ok(ReplayReport {
        scenario: scenario.name.clone(),
        steps,
        tables: datapath.table_sizes(),
    })
}

fn replay_event(datapath: &Datapath, event: &Event) -> StepOutcome {
    match event {
        Event::Connect(e) => {
            let mut ctx = SockAddrCtx::new(e.protocol, e.dst, e.uid, e.cookie);
            let disposition = datapath.connect(&mut ctx);
            StepOutcome::Connect {
                disposition,
                destination: ctx.user_endpoint(),
            }
        }
        Event::Established(e) => {
            let ctx = SockOpsCtx {
                op: e.op,
                family: e.family,
                local: e.local,
                remote: e.remote,
                cookie: e.cookie,
                socket: e.socket,
            };
            let disposition = datapath.established(&ctx);
            StepOutcome::Established {
                disposition,
                state: datapath.flow_state(e.cookie, &FlowKey::new(e.local, e.remote)),
            }
        }
        Event::Getsockopt(e) => {
            let sk = SockView {
                family: e.family,
                src: e.src,
                dst: e.dst,
            };
            let mut ctx = SockOptCtx::new(libc::SOL_IP, e.optname, e.optlen, sk);
            let disposition = datapath.getsockopt(&mut ctx);
            StepOutcome::Getsockopt {
                disposition,
                optlen: ctx.optlen,
                retval: ctx.retval,
            }
        }
        Event::Sendmsg(e) => {
            let mut msg = SkMsg::ipv4(e.local, e.remote, e.size);
            StepOutcome::Sendmsg {
                disposition: datapath.sendmsg_redirect(&mut msg),
            }
        }
        Event::DnsSend(e) => {
            let mut ctx = SockAddrCtx::udp(e.addr, e.uid, e.cookie);
            let disposition = datapath.dns_sendmsg(&mut ctx);
            StepOutcome::DnsSend {
                disposition,
                destination: ctx.user_endpoint(),
            }
        }
        Event::DnsRecv(e) => {
            let mut ctx = SockAddrCtx::udp(e.addr, e.uid, e.cookie);
            let disposition = datapath.dns_recvmsg(&mut ctx);
            StepOutcome::DnsRecv {
                disposition,
                source: ctx.user_endpoint(),
            }
        }
        Event::Packet(e) => {
            let mut pkt = e.frame().build();
            let disposition = datapath.packet(&mut pkt, e.direction);
            StepOutcome::Packet {
                disposition,
                action: disposition.action(),
                checksums_valid: checksums_valid(&pkt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::sockopt::OriginSource;
    use crate::state::flow::OriginRecord;
    use crate::utils::config::EngineConfig;

    const HTTPS: &str = r#"
name: outbound-https
events:
  - connect: { dst: "93.184.216.34:443", uid: 1000, cookie: 42 }
  - established: { local: "10.0.0.5:51000", remote: "10.0.0.1:15001", cookie: 42, socket: 1 }
  - established: { op: passive_established, local: "10.0.0.1:15001", remote: "10.0.0.5:51000", cookie: 900, socket: 2 }
  - getsockopt: { src: "10.0.0.1:15001", dst: "10.0.0.5:51000" }
  - sendmsg: { local: "10.0.0.1:15001", remote: "10.0.0.5:51000", size: 128 }
"#;

    fn datapath() -> Datapath {
        Datapath::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_replay_https_scenario() {
        let scenario = Scenario::from_yaml(HTTPS).unwrap();
        let dp = datapath();
        let report = run(&dp, &scenario).unwrap();

        assert_eq!(report.scenario, "outbound-https");
        assert_eq!(report.steps.len(), 5);

        match &report.steps[0].outcome {
            StepOutcome::Connect { destination, .. } => {
                assert_eq!(destination.to_string(), "10.0.0.1:15001");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        match &report.steps[1].outcome {
            StepOutcome::Established { state, .. } => assert_eq!(*state, FlowState::Redirected),
            other => panic!("unexpected outcome {:?}", other),
        }

        match &report.steps[3].outcome {
            StepOutcome::Getsockopt {
                disposition,
                optlen,
                retval,
            } => {
                assert_eq!(
                    *disposition,
                    SockOptDisposition::Answered {
                        origin: OriginRecord::new(Ipv4Addr::new(93, 184, 216, 34), 443),
                        source: OriginSource::PairDest,
                    }
                );
                assert_eq!(*optlen, 16);
                assert_eq!(*retval, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        match &report.steps[4].outcome {
            StepOutcome::Sendmsg { disposition } => {
                assert!(matches!(disposition, MsgDisposition::Redirected { .. }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(report.tables.sock_pair, 2);
        assert_eq!(report.tables.pair_dest, 1);
    }

    #[test]
    fn test_replay_packet_and_dns_events() {
        let yaml = r#"
name: packet-path
events:
  - packet: { direction: egress, protocol: tcp, src: "10.0.0.5:51000", dst: "10.0.0.1:8080", flags: { syn: true } }
  - packet: { direction: ingress, protocol: tcp, src: "10.0.0.1:15001", dst: "10.0.0.5:51000", flags: { fin: true, ack: true } }
  - dns_send: { addr: "8.8.8.8:53", cookie: 7 }
  - dns_recv: { addr: "10.0.0.1:15053", cookie: 7 }
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let dp = datapath();
        let report = run(&dp, &scenario).unwrap();

        for step in &report.steps[..2] {
            match &step.outcome {
                StepOutcome::Packet {
                    disposition,
                    action,
                    checksums_valid,
                } => {
                    assert!(matches!(disposition, PacketDisposition::Translated { .. }));
                    assert_eq!(*action, TcAction::Ok);
                    assert!(checksums_valid);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        match &report.steps[3].outcome {
            StepOutcome::DnsRecv { source, .. } => assert_eq!(source.to_string(), "8.8.8.8:53"),
            other => panic!("unexpected outcome {:?}", other),
        }

        // FIN+ACK released the TCP entry
        assert_eq!(report.tables.svc_nat, 0);
        assert_eq!(report.tables.dns_session_dest, 1);
    }

    #[test]
    fn test_report_json_shape() {
        let scenario = Scenario::from_yaml(HTTPS).unwrap();
        let report = run(&datapath(), &scenario).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&report.to_json(false).unwrap()).unwrap();

        assert_eq!(json["steps"][0]["event"], "connect");
        assert_eq!(json["steps"][0]["step"], 0);
        assert_eq!(json["steps"][0]["disposition"]["outcome"], "redirected");
        assert_eq!(json["steps"][0]["disposition"]["origin"], "93.184.216.34:443");
        assert_eq!(json["tables"]["sock_pair"], 2);
    }

    #[test]
    fn test_empty_scenario_rejected() {
        let scenario = Scenario::from_yaml("name: empty\nevents: []\n").unwrap();
        let result = run(&datapath(), &scenario);
        assert!(matches!(result, Err(EngineError::ReplayFailed(_))));
    }

    #[test]
    fn test_malformed_scenario() {
        let result = Scenario::from_yaml("name: bad\nevents:\n  - teleport: {}\n");
        assert!(matches!(result, Err(EngineError::Serialization(_))));
    }
}
