mod handle;
mod reconnect;
mod shutdown;
mod startup;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use handle::{ActivityGuard, Instance, InstanceBuilder};
pub use types::{instance_id, Identity, InstanceInfo, ShutdownReason};
