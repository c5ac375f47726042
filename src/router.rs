//! Turns accepted sessions into redirect decisions

use crate::activity::ActivityTracker;
use crate::address::{RouteTable, RoutingTarget};
use crate::error::RejectReason;
use crate::registry::{BackendRegistry, Resolution};
use crate::session::Session;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the router did with a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Redirected { port: u16 },
    Rejected(RejectReason),
}

pub struct Router {
    table: RouteTable,
    registry: Arc<BackendRegistry>,
    tracker: Arc<ActivityTracker>,
    redirect_host: String,
}

impl Router {
    pub fn new(
        table: RouteTable,
        registry: Arc<BackendRegistry>,
        tracker: Arc<ActivityTracker>,
        redirect_host: impl Into<String>,
    ) -> Self {
        Self {
            table,
            registry,
            tracker,
            redirect_host: redirect_host.into(),
        }
    }

    /// Route one session. Every failure ends here; none escapes to the caller.
    pub async fn route<S>(&self, session: &mut S) -> RouteOutcome
    where
        S: Session + ?Sized,
    {
        if let Err(e) = session.complete_handshake().await {
            warn!(error = %e, "Session handshake failed");
            return reject(session, RejectReason::HandshakeFailed).await;
        }

        let address = session.requested_address().to_string();
        let port = match self.table.resolve_address(&address) {
            RoutingTarget::Invalid => {
                info!(address = %address, "Invalid server address");
                return reject(session, RejectReason::InvalidAddress).await;
            }
            RoutingTarget::Fixed { port } => port,
            RoutingTarget::Dynamic { identifier } => {
                match self.registry.resolve(&identifier).await {
                    Ok(Resolution::Ready(port)) => {
                        self.tracker.touch(&identifier);
                        port
                    }
                    Ok(Resolution::NotProvisioned) => {
                        info!(identifier = %identifier, "No artifact for identifier");
                        return reject(session, RejectReason::UnknownIdentifier).await;
                    }
                    Err(e) => {
                        error!(identifier = %identifier, error = %e, "Failed to prepare backend");
                        return reject(session, RejectReason::BackendUnavailable).await;
                    }
                }
            }
        };

        info!(address = %address, target_port = port, "Redirecting connection");
        if let Err(e) = session.send_redirect(&self.redirect_host, port).await {
            warn!(address = %address, target_port = port, error = %e, "Failed to send redirect");
        }
        RouteOutcome::Redirected { port }
    }
}

async fn reject<S>(session: &mut S, reason: RejectReason) -> RouteOutcome
where
    S: Session + ?Sized,
{
    if let Err(e) = session.reject(reason).await {
        debug!(reason = reason.as_header_value(), error = %e, "Failed to reject session");
    }
    RouteOutcome::Rejected(reason)
}
