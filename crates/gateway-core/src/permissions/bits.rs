//! Named permission bits referenced by the resolver and the Hub's
//! channel-scoped dispatch filter. The full set is owned by the REST tier;
//! only the bits the gateway itself tests against are named here.

pub const VIEW_CHANNELS: u64 = 1 << 0;
pub const SEND_MESSAGES: u64 = 1 << 1;
pub const MANAGE_SERVER: u64 = 1 << 20;

/// Returned by `Resolve` for owners and `ManageServer` holders: every bit
/// set, so any `HasPermission` check against it is true.
pub const ALL: u64 = u64::MAX;
