//! Request handling: routing, handler invocation and the governor pipeline.
//!
//! 1. **Routing** (`router`): `(method, path)` -> handler plus path parameters
//! 2. **Handlers** (`handler`): the `RouteHandler` seam and its context
//! 3. **Middleware** (`middleware`): Tower layers (admission, timeout, metrics)
//! 4. **Governor** (`governor`): the assembled pipeline and its counters

pub mod governor;
pub mod handler;
pub mod middleware;
pub mod request;
pub mod router;

pub use governor::{GovernorConfig, HandlerInvoker, Invocation, RequestGovernor};
pub use handler::{HandlerContext, RouteHandler, SharedHandler};
pub use request::{DispatchError, HandlerError, HostRequest, HostResponse};
pub use router::{
    PathParams, ResolvedRoute, RouteError, RouteGroup, RouteInfo, RoutePattern, RouteRegistry,
};
