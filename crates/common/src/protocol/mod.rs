pub mod ws;

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Normal closure, also used for server shutdown and superseded connections.
    pub const NORMAL: u16 = 1000;
    /// Capacity or policy rejection during admission.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// The connection stopped answering heartbeats.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
}
