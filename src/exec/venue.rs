use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VenueError;

use super::order_sm::{OrderSpec, VenueStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub spec: OrderSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub venue_order_id: String,
    pub symbol: String,
    pub status: VenueStatus,
    pub qty: f64,
    pub filled_qty: f64,
}

/// Broker boundary. Every call is keyed by `client_order_id`, and `submit`
/// must be idempotent on it.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn submit(&self, req: &OrderRequest) -> Result<VenueOrder, VenueError>;
    async fn query_order(&self, client_order_id: &str) -> Result<VenueOrder, VenueError>;
    async fn cancel(&self, client_order_id: &str) -> Result<(), VenueError>;
    async fn list_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError>;
}

/// Scripted failure for the next call of a given kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    /// Fail without recording the order.
    Fail(VenueError),
    /// Record the order but answer with a timeout.
    AcceptThenTimeout,
}

#[derive(Debug, Default)]
struct PaperBook {
    orders: BTreeMap<String, VenueOrder>,
    next_id: u64,
    submit_script: VecDeque<Scripted>,
    query_script: VecDeque<VenueError>,
    cancel_script: VecDeque<VenueError>,
    submit_calls: HashMap<String, u32>,
    fill_on_submit: bool,
    down: bool,
}

/// In-memory venue. Idempotent by `client_order_id` and scriptable for tests
/// and dry runs.
#[derive(Debug, Default)]
pub struct PaperVenue {
    book: Mutex<PaperBook>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders fill completely on acceptance.
    pub fn filling() -> Self {
        let venue = Self::default();
        venue.with_book(|b| b.fill_on_submit = true);
        venue
    }

    fn with_book<R>(&self, f: impl FnOnce(&mut PaperBook) -> R) -> R {
        match self.book.lock() {
            Ok(mut b) => f(&mut b),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn script_submit(&self, step: Scripted) {
        self.with_book(|b| b.submit_script.push_back(step));
    }

    pub fn script_query(&self, err: VenueError) {
        self.with_book(|b| b.query_script.push_back(err));
    }

    pub fn script_cancel(&self, err: VenueError) {
        self.with_book(|b| b.cancel_script.push_back(err));
    }

    /// While down every call answers `Unavailable`.
    pub fn set_down(&self, down: bool) {
        self.with_book(|b| b.down = down);
    }

    /// How many times `submit` was called for this id, including retries.
    pub fn submit_calls(&self, client_order_id: &str) -> u32 {
        self.with_book(|b| b.submit_calls.get(client_order_id).copied().unwrap_or(0))
    }

    /// Distinct orders the venue holds for this id. Never more than one.
    pub fn order_count(&self, client_order_id: &str) -> usize {
        self.with_book(|b| usize::from(b.orders.contains_key(client_order_id)))
    }

    pub fn fill(&self, client_order_id: &str, qty: f64) -> Option<VenueOrder> {
        self.with_book(|b| {
            let o = b.orders.get_mut(client_order_id)?;
            o.filled_qty = (o.filled_qty + qty).min(o.qty);
            o.status = if o.filled_qty + 1e-9 >= o.qty { VenueStatus::Filled } else { VenueStatus::PartiallyFilled };
            Some(o.clone())
        })
    }

    /// An order the venue holds that we have no record of.
    pub fn inject_orphan(&self, client_order_id: &str, symbol: &str, qty: f64) {
        self.with_book(|b| {
            b.next_id += 1;
            let id = format!("paper-{}", b.next_id);
            b.orders.insert(
                client_order_id.to_string(),
                VenueOrder {
                    client_order_id: client_order_id.to_string(),
                    venue_order_id: id,
                    symbol: symbol.to_string(),
                    status: VenueStatus::Open,
                    qty,
                    filled_qty: 0.0,
                },
            );
        });
    }

    fn accept(b: &mut PaperBook, req: &OrderRequest) -> VenueOrder {
        if let Some(existing) = b.orders.get(&req.client_order_id) {
            return existing.clone();
        }
        b.next_id += 1;
        let (status, filled_qty) = if b.fill_on_submit {
            (VenueStatus::Filled, req.spec.qty)
        } else {
            (VenueStatus::Open, 0.0)
        };
        let order = VenueOrder {
            client_order_id: req.client_order_id.clone(),
            venue_order_id: format!("paper-{}", b.next_id),
            symbol: req.spec.symbol.clone(),
            status,
            qty: req.spec.qty,
            filled_qty,
        };
        b.orders.insert(req.client_order_id.clone(), order.clone());
        order
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    async fn submit(&self, req: &OrderRequest) -> Result<VenueOrder, VenueError> {
        self.with_book(|b| {
            *b.submit_calls.entry(req.client_order_id.clone()).or_insert(0) += 1;
            if b.down {
                return Err(VenueError::Unavailable("paper venue down".to_string()));
            }
            match b.submit_script.pop_front() {
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::AcceptThenTimeout) => {
                    Self::accept(b, req);
                    Err(VenueError::Timeout)
                }
                None => {
                    if !(req.spec.qty.is_finite() && req.spec.qty > 0.0) {
                        return Err(VenueError::Rejected("qty must be positive".to_string()));
                    }
                    Ok(Self::accept(b, req))
                }
            }
        })
    }

    async fn query_order(&self, client_order_id: &str) -> Result<VenueOrder, VenueError> {
        self.with_book(|b| {
            if b.down {
                return Err(VenueError::Unavailable("paper venue down".to_string()));
            }
            if let Some(e) = b.query_script.pop_front() {
                return Err(e);
            }
            b.orders.get(client_order_id).cloned().ok_or(VenueError::NotFound)
        })
    }

    async fn cancel(&self, client_order_id: &str) -> Result<(), VenueError> {
        self.with_book(|b| {
            if b.down {
                return Err(VenueError::Unavailable("paper venue down".to_string()));
            }
            if let Some(e) = b.cancel_script.pop_front() {
                return Err(e);
            }
            let o = b.orders.get_mut(client_order_id).ok_or(VenueError::NotFound)?;
            match o.status {
                VenueStatus::Open | VenueStatus::PartiallyFilled => {
                    o.status = VenueStatus::Canceled;
                    Ok(())
                }
                VenueStatus::Canceled => Ok(()),
                VenueStatus::Filled => Err(VenueError::NotCancelable("FILLED".to_string())),
            }
        })
    }

    async fn list_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        self.with_book(|b| {
            if b.down {
                return Err(VenueError::Unavailable("paper venue down".to_string()));
            }
            Ok(b.orders
                .values()
                .filter(|o| matches!(o.status, VenueStatus::Open | VenueStatus::PartiallyFilled))
                .cloned()
                .collect())
        })
    }
}
