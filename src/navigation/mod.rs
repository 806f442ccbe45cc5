// Navigation module
// Route table and the guard that runs before every route transition

mod guard;
mod table;

pub use guard::{GuardPhase, Location, NavigationGuard, Resolution};
pub use table::{RouteDef, RouteMatch, RouteTable};
