pub mod collective;
pub mod config;
pub mod fabric;
pub mod forward;
pub mod net;
pub mod region;

#[cfg(test)]
pub(crate) mod testkit;

// The fabric runs three execution contexts per instance: a control loop that
// owns the channel and routing tables and dispatches every inbound link
// event, a forwarder that drives relay pipelines, and a single commandeer
// helper that drains drip-prepare work and may steal exactly one stalled
// relay at a time. Control handlers never block; they update state and
// return. Anything that waits (a client blocked on chunk readiness, the
// barrier, a drained-forwarder check) polls atomic flags at the configured
// interval against a wall-clock budget, observing the owning region's
// interrupt flag before every iteration.

// Hot per-chunk and per-relay state is atomic so the data path never takes a
// table lock; the bookkeeping tables themselves sit behind short-held locks
// taken in a fixed order (channels, router, regions, forwarder core). Chunk
// ready flags only ever go false to true on the completion path and true to
// false through an explicit hold, so readers may check them lock-free.
