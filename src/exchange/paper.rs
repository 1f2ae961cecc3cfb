//! In-process venue for the demo runner and tests.
//!
//! Fills at the reference price plus slippage. Faults are either scripted
//! (one per call, in order) or drawn from a `FaultProfile`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{CloseRequest, CloseStatus, Execution, OrderHandle, OrderRequest, OrderStatus};
use crate::market::Side;

/// Per-call fault rates in 0..1.
#[derive(Debug, Clone, Default)]
pub struct FaultProfile {
    pub reject_rate: f64,
    pub hang_rate: f64,
    pub pending_rate: f64,
    pub close_fail_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self::default()
    }
}

pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed % 10_000) as f64 / 10_000.0;
    v < rate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFault {
    Reject,
    /// The order never reaches the book and the call never returns
    Hang,
    /// The order fills but the acknowledgement never arrives
    LateAck,
    /// Accepted, never filled
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseFault {
    Reject,
    Hang,
    Pending,
    Error,
    /// The position is flattened but the acknowledgement never arrives
    LateAck,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    handle: OrderHandle,
    side: Side,
    status: OrderStatus,
}

#[derive(Debug, Default)]
struct PaperBook {
    next_id: u64,
    orders: HashMap<String, PaperOrder>,
    entry_faults: VecDeque<EntryFault>,
    close_faults: VecDeque<CloseFault>,
    close_calls: usize,
}

pub struct PaperExecution {
    slip_rate: f64,
    profile: FaultProfile,
    book: Mutex<PaperBook>,
}

impl PaperExecution {
    pub fn new(slip_rate: f64) -> Self {
        Self::with_faults(slip_rate, FaultProfile::disabled())
    }

    pub fn with_faults(slip_rate: f64, profile: FaultProfile) -> Self {
        Self {
            slip_rate,
            profile,
            book: Mutex::new(PaperBook::default()),
        }
    }

    fn book(&self) -> Result<std::sync::MutexGuard<'_, PaperBook>> {
        self.book.lock().map_err(|_| anyhow!("paper book poisoned"))
    }

    pub fn script_entry(&self, fault: EntryFault) -> Result<()> {
        self.book()?.entry_faults.push_back(fault);
        Ok(())
    }

    pub fn script_close(&self, fault: CloseFault) -> Result<()> {
        self.book()?.close_faults.push_back(fault);
        Ok(())
    }

    /// Filled entries that have not been closed.
    pub fn open_orders(&self) -> usize {
        self.book
            .lock()
            .map(|b| {
                b.orders
                    .values()
                    .filter(|o| matches!(o.status, OrderStatus::Filled { .. }))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Close calls received, including ones that hung or failed.
    pub fn close_calls(&self) -> usize {
        self.book.lock().map(|b| b.close_calls).unwrap_or(0)
    }

    pub fn order_count(&self) -> usize {
        self.book.lock().map(|b| b.orders.len()).unwrap_or(0)
    }

    fn slipped(&self, price: f64, side: Side, entering: bool) -> f64 {
        // Entries pay the slip in the trade direction, exits pay it against.
        let dir = if entering { side.sign() } else { -side.sign() };
        price * (1.0 + self.slip_rate * dir)
    }

    fn draw_entry_fault(&self, book: &mut PaperBook) -> Option<EntryFault> {
        if let Some(f) = book.entry_faults.pop_front() {
            return Some(f);
        }
        let seed: u64 = rand::thread_rng().gen();
        if should_fault(seed, self.profile.reject_rate) {
            Some(EntryFault::Reject)
        } else if should_fault(seed / 10_000, self.profile.hang_rate) {
            Some(EntryFault::Hang)
        } else if should_fault(seed / 100_000_000, self.profile.pending_rate) {
            Some(EntryFault::Pending)
        } else {
            None
        }
    }

    fn draw_close_fault(&self, book: &mut PaperBook) -> Option<CloseFault> {
        if let Some(f) = book.close_faults.pop_front() {
            return Some(f);
        }
        let seed: u64 = rand::thread_rng().gen();
        if should_fault(seed, self.profile.close_fail_rate) {
            Some(CloseFault::Error)
        } else {
            None
        }
    }
}

#[async_trait]
impl Execution for PaperExecution {
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderHandle> {
        let (handle, hang) = {
            let mut book = self.book()?;
            let fault = self.draw_entry_fault(&mut book);
            if fault == Some(EntryFault::Hang) {
                (None, true)
            } else {
                book.next_id += 1;
                let handle = OrderHandle {
                    order_id: format!("paper-{}", book.next_id),
                    client_order_id: req.client_order_id.clone(),
                };
                let status = match fault {
                    Some(EntryFault::Reject) => OrderStatus::Rejected { reason: "paper reject".into() },
                    Some(EntryFault::Pending) => OrderStatus::Pending,
                    _ => OrderStatus::Filled { price: self.slipped(req.reference_price, req.side, true) },
                };
                book.orders.insert(
                    req.client_order_id.clone(),
                    PaperOrder { handle: handle.clone(), side: req.side, status },
                );
                (Some(handle), fault == Some(EntryFault::LateAck))
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        handle.ok_or_else(|| anyhow!("paper order {} lost", req.client_order_id))
    }

    async fn confirm_order(&self, handle: &OrderHandle) -> Result<OrderStatus> {
        let book = self.book()?;
        book.orders
            .get(&handle.client_order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| anyhow!("unknown order {}", handle.client_order_id))
    }

    async fn close_order(&self, req: &CloseRequest) -> Result<CloseStatus> {
        let outcome = {
            let mut book = self.book()?;
            book.close_calls += 1;
            let fault = self.draw_close_fault(&mut book);
            let order = book
                .orders
                .get_mut(&req.handle.client_order_id)
                .ok_or_else(|| anyhow!("unknown order {}", req.handle.client_order_id))?;
            match fault {
                Some(CloseFault::Hang) => None,
                Some(CloseFault::Error) => return Err(anyhow!("paper close failed for {}", req.symbol)),
                Some(CloseFault::Reject) => Some(CloseStatus::Rejected { reason: "paper reject".into() }),
                Some(CloseFault::Pending) => Some(CloseStatus::Pending),
                Some(CloseFault::LateAck) => {
                    if let OrderStatus::Filled { .. } = order.status {
                        let price = self.slipped(req.reference_price, order.side, false);
                        order.status = OrderStatus::Closed { price };
                    }
                    None
                }
                None => match order.status {
                    OrderStatus::Pending => {
                        order.status = OrderStatus::Rejected { reason: "cancelled".into() };
                        Some(CloseStatus::Rejected { reason: "cancelled before fill".into() })
                    }
                    OrderStatus::Rejected { .. } => {
                        Some(CloseStatus::Rejected { reason: "nothing to close".into() })
                    }
                    OrderStatus::Filled { .. } => {
                        let price = self.slipped(req.reference_price, order.side, false);
                        order.status = OrderStatus::Closed { price };
                        Some(CloseStatus::Closed { price })
                    }
                    OrderStatus::Closed { .. } => Some(CloseStatus::Rejected { reason: "already closed".into() }),
                },
            }
        };
        match outcome {
            Some(status) => Ok(status),
            None => {
                std::future::pending::<()>().await;
                Err(anyhow!("paper close hung"))
            }
        }
    }

    async fn query_order(&self, _symbol: &str, client_order_id: &str) -> Result<Option<(OrderHandle, OrderStatus)>> {
        let book = self.book()?;
        Ok(book
            .orders
            .get(client_order_id)
            .map(|o| (o.handle.clone(), o.status.clone())))
    }
}
