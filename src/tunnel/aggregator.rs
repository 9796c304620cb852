//! Collapse per-backend statuses into one authoritative status

use super::{ConnectionState, PerKind, TunnelKind};

/// Status reported by each backend, joined from one round of queries
pub type StatusByKind = PerKind<ConnectionState>;

/// Pick the tunnel in use and its status.
///
/// The first kind in priority order (IPsec, OpenVPN, WireGuard) whose status
/// is Connecting, Connected or Disconnecting wins. When none is, the selected
/// kind's own status is returned.
pub fn aggregate(selected: TunnelKind, statuses: &StatusByKind) -> (TunnelKind, ConnectionState) {
    TunnelKind::ALL
        .iter()
        .copied()
        .find(|kind| statuses.get(*kind).is_meaningful())
        .map(|kind| (kind, *statuses.get(kind)))
        .unwrap_or((selected, *statuses.get(selected)))
}
