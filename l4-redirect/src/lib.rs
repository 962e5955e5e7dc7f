//! Userspace side of the L4 redirect dataplane: the policy tables, route
//! persistence, the control plane tying them together and the loader for
//! the TC classifier.

pub mod config;
pub mod controller;
pub mod dataplane;
pub mod routes;
pub mod simulate;
pub mod stats;
pub mod table;

pub use controller::Controller;
pub use routes::{Backend, Route, RouteError, RouteStore};
pub use table::{PolicyControl, PolicyError, PolicyTable};
