// beacon-common: wire protocol and event types shared by the gateway and its clients

pub mod protocol;
pub mod types;
