// packages/engine/src/interception/redirmsg.rs
//! Socket-to-socket message splicing
//!
//! A message sent on one end of a local connection is handed straight to the
//! receive queue of the peer socket, skipping the stack. The peer registered
//! itself under `{its local, its remote}`, which from the sender's side is
//! `{remote, local}`.

use crate::interception::context::{MsgRedirect, RedirectDirection, SkAction, SkMsg, AF_INET};
use crate::interception::record_outcome;
use crate::state::flow::FlowKey;
use crate::state::tables::{DatapathTables, SockHash};
use serde::Serialize;
use tracing::debug;

const HOOK: &str = "sk_msg";

/// What the message hook did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MsgDisposition {
    /// Spliced into a registered socket
    Redirected { redirect: MsgRedirect },

    /// No socket registered for the peer key; normal delivery
    NoPeer,

    /// Not an IPv4 message
    Skipped,
}

impl MsgDisposition {
    /// Messages are never dropped here
    pub fn action(&self) -> SkAction {
        SkAction::Pass
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            MsgDisposition::Redirected { .. } => "redirected",
            MsgDisposition::NoPeer => "no_peer",
            MsgDisposition::Skipped => "skipped",
        }
    }
}

pub struct MessageRedirector {
    sock_pair: SockHash,
}

impl MessageRedirector {
    pub fn new(tables: &DatapathTables) -> Self {
        Self {
            sock_pair: tables.sock_pair.clone(),
        }
    }

    pub fn on_msg(&self, msg: &mut SkMsg) -> MsgDisposition {
        let disposition = self.redirect(msg);
        record_outcome(HOOK, disposition.outcome());
        disposition
    }

    fn redirect(&self, msg: &mut SkMsg) -> MsgDisposition {
        if msg.family != AF_INET {
            return MsgDisposition::Skipped;
        }

        let key = FlowKey::new(msg.remote, msg.local);
        let redirected = self
            .sock_pair
            .redirect_msg(msg, &key, RedirectDirection::Ingress);

        match redirected.then_some(msg.redirect).flatten() {
            Some(redirect) => {
                debug!(
                    %key,
                    size = msg.size,
                    target = ?redirect.target,
                    "Message redirected to peer socket"
                );
                MsgDisposition::Redirected { redirect }
            }
            None => MsgDisposition::NoPeer,
        }
    }
}
