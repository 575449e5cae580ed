// packages/engine/src/datapath.rs
//! Datapath assembly
//!
//! Builds the shared tables from configuration and wires every hook to them.
//! The [`Datapath`] is what an embedding program (or the replay driver) calls
//! into when the corresponding kernel event fires.

use crate::interception::{
    ConnectDisposition, ConnectInterceptor, DnsDisposition, DnsQueryCapture, EstablishedPairer,
    MessageRedirector, MsgDisposition, OriginalDestinationResolver, PacketDisposition,
    PacketLevelTranslator, PairDisposition, SkMsg, SockAddrCtx, SockOpsCtx, SockOptCtx,
    SockOptDisposition, TrafficDirection,
};
use crate::packet::buffer::PacketBuf;
use crate::state::flow::{Cookie, FlowKey, FlowState};
use crate::state::tables::{DatapathTables, TableSizes};
use crate::utils::config::{DatapathConfig, EngineConfig};
use crate::utils::errors::Result;
use tracing::info;

pub struct Datapath {
    config: DatapathConfig,
    tables: DatapathTables,
    connect: ConnectInterceptor,
    pairer: EstablishedPairer,
    resolver: OriginalDestinationResolver,
    redirector: MessageRedirector,
    dns: DnsQueryCapture,
    nat: PacketLevelTranslator,
}

impl Datapath {
    /// Validate configuration and build tables and hooks
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let tables = DatapathTables::new(&config.tables)?;
        Ok(Self::with_tables(config.datapath, tables))
    }

    /// Wire hooks onto existing tables
    pub fn with_tables(config: DatapathConfig, tables: DatapathTables) -> Self {
        info!(
            bridge = %config.bridge_ip,
            proxy_port = config.proxy_port,
            dns_proxy_port = config.dns_proxy_port,
            scope = ?config.connect_scope,
            "Datapath ready"
        );

        Self {
            connect: ConnectInterceptor::new(config, &tables),
            pairer: EstablishedPairer::new(config, &tables),
            resolver: OriginalDestinationResolver::new(config, &tables),
            redirector: MessageRedirector::new(&tables),
            dns: DnsQueryCapture::new(config, &tables),
            nat: PacketLevelTranslator::new(config, &tables),
            config,
            tables,
        }
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    pub fn tables(&self) -> &DatapathTables {
        &self.tables
    }

    pub fn connect(&self, ctx: &mut SockAddrCtx) -> ConnectDisposition {
        self.connect.on_connect(ctx)
    }

    pub fn established(&self, ctx: &SockOpsCtx) -> PairDisposition {
        self.pairer.on_sock_ops(ctx)
    }

    pub fn getsockopt(&self, ctx: &mut SockOptCtx) -> SockOptDisposition {
        self.resolver.on_getsockopt(ctx)
    }

    pub fn sendmsg_redirect(&self, msg: &mut SkMsg) -> MsgDisposition {
        self.redirector.on_msg(msg)
    }

    pub fn dns_sendmsg(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        self.dns.on_sendmsg(ctx)
    }

    pub fn dns_recvmsg(&self, ctx: &mut SockAddrCtx) -> DnsDisposition {
        self.dns.on_recvmsg(ctx)
    }

    pub fn packet(&self, pkt: &mut PacketBuf, direction: TrafficDirection) -> PacketDisposition {
        self.nat.process(pkt, direction)
    }

    /// Lifecycle position of a socket-level flow, read without touching recency
    ///
    /// `cookie` is the connecting socket's cookie and `key` its
    /// `{local, remote}` as registered at establishment.
    pub fn flow_state(&self, cookie: Cookie, key: &FlowKey) -> FlowState {
        if self.tables.pair_dest.peek(key).is_some() {
            if self.tables.sock_pair.table().peek(key).is_some() {
                FlowState::Redirected
            } else {
                FlowState::Paired
            }
        } else if self.tables.session_dest.peek(&cookie).is_some() {
            FlowState::Captured
        } else {
            FlowState::Closed
        }
    }

    pub fn table_sizes(&self) -> TableSizes {
        self.tables.sizes()
    }
}
