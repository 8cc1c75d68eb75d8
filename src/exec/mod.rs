pub mod machine;
pub mod order_sm;
pub mod reconcile;
pub mod retry;
pub mod venue;

pub use machine::{ExecConfig, ExecutionStateMachine};
pub use order_sm::{Event, Order, OrderSpec, OrderState, Side, VenueStatus};
pub use reconcile::{reconcile_once, OrphanPolicy, ReconcileMode, ReconcileReport};
pub use retry::RetryConfig;
pub use venue::{OrderRequest, PaperVenue, Scripted, VenueAdapter, VenueOrder};
