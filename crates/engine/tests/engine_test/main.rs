/// Engine tests over the in-memory store and the fake control plane: cluster
/// lifecycle, scheduled runs and timeouts, the service facade and driver ticks.

mod lifecycle;
mod scheduler;
mod service;
