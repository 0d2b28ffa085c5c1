//! Backend access: the client pool with retry and circuit breaking, the HTTP
//! Responses backend, and a scripted mock for tests.

pub mod breaker;
pub mod pool;
pub mod responses;
pub mod retry;

pub mod mock;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use mock::{MockBackend, MockResponse};
pub use pool::{BreakerStat, ClientPool, PoolConfig, PoolError, PoolStats, SlotLease};
pub use responses::{ResponsesBackend, ResponsesConfig};
pub use retry::RetryPolicy;
