//! Bracket (entry / take-profit / stop-loss) linkage.
//!
//! A bracket is advanced from the rows it references, so the same
//! [`BracketManager::advance`] call serves fill callbacks from the scheduler
//! and the reconciliation engine's periodic pass:
//!
//! ```text
//! created ──entry filled, legs live──▶ active ──leg executed, sibling gone──▶ closed
//!    │                                   │
//!    └─entry never filled──▶ aborted     └─sibling cancel failed──▶ orphaned ──▶ closed
//! ```
//!
//! Every bracket transition is a conditional update; when the scheduler and
//! the reconciliation engine advance the same bracket concurrently only one
//! of them wins each step.

use super::events::{EngineEvent, EventJournal};
use super::model::{
    client_order_id, BracketLink, BracketStatus, NewScheduledOrder, OrderLeg, OrderStatus,
    ScheduledOrder,
};
use super::retry::RetryPolicy;
use super::submitter::{OrderSubmitter, SubmitError};
use crate::exchange::{ExchangeError, OrderKind, OrderSide};
use crate::persistence::OrderStore;
use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct BracketManager {
    store: Arc<OrderStore>,
    journal: EventJournal,
    submitter: Arc<OrderSubmitter>,
    cancel_policy: RetryPolicy,
}

impl BracketManager {
    pub fn new(
        store: Arc<OrderStore>,
        journal: EventJournal,
        submitter: Arc<OrderSubmitter>,
        cancel_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            journal,
            submitter,
            cancel_policy,
        }
    }

    /// Create the bracket for a bracket-enabled entry before it is submitted.
    ///
    /// Returns `None` if the symbol already has an open bracket.
    pub fn register(&self, entry: &ScheduledOrder) -> Result<Option<BracketLink>> {
        if entry.bracket.is_none() {
            return Err(anyhow!(
                "order {} is not bracket-enabled",
                entry.client_order_id
            ));
        }
        let tp = client_order_id(&entry.strategy_id, entry.sequence, OrderLeg::TakeProfit);
        let sl = client_order_id(&entry.strategy_id, entry.sequence, OrderLeg::StopLoss);

        let link = self.store.insert_bracket(
            entry.execution_id,
            &entry.symbol,
            &entry.client_order_id,
            &tp,
            &sl,
        )?;
        if let Some(link) = &link {
            debug!(bracket_id = link.id, symbol = %link.symbol, "Bracket registered");
        }
        Ok(link)
    }

    /// Entry reached a status worth acting on.
    pub async fn on_entry_resolved(&self, entry: &ScheduledOrder) -> Result<()> {
        if let Some(link) = self.store.bracket_by_entry(&entry.client_order_id)? {
            self.advance(&link).await?;
        }
        Ok(())
    }

    /// A TP or SL leg changed status.
    pub async fn on_leg_resolved(&self, leg: &ScheduledOrder) -> Result<()> {
        if let Some(link) = self.store.bracket_for_leg(&leg.client_order_id)? {
            self.advance(&link).await?;
        }
        Ok(())
    }

    /// Dispatch a status change of any order to the bracket it affects.
    pub async fn on_order_resolved(&self, order: &ScheduledOrder) -> Result<()> {
        match order.leg {
            OrderLeg::Entry if order.bracket.is_some() => self.on_entry_resolved(order).await,
            OrderLeg::TakeProfit | OrderLeg::StopLoss => self.on_leg_resolved(order).await,
            OrderLeg::Exit if order.status == OrderStatus::Filled => {
                self.close_for_symbol(order).await.map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Drive a bracket as far as current order states allow.
    pub async fn advance(&self, link: &BracketLink) -> Result<BracketStatus> {
        let link = self.reload(link)?;
        if link.status.is_terminal() {
            return Ok(link.status);
        }
        let entry = self.order(&link.entry_client_id)?;

        if link.status == BracketStatus::Created {
            let entry_filled = entry.status == OrderStatus::Filled
                || (entry.status.is_terminal() && entry.executed_qty > Decimal::ZERO);
            if !entry.status.is_terminal() {
                return Ok(BracketStatus::Created);
            }
            if !entry_filled {
                if self.store.transition_bracket(
                    link.id,
                    &[BracketStatus::Created],
                    BracketStatus::Aborted,
                    None,
                )? {
                    info!(bracket_id = link.id, entry_status = %entry.status, "Entry never filled, bracket aborted");
                }
                return Ok(self.reload(&link)?.status);
            }
            if !self.place_legs(&link, &entry).await? {
                return Ok(self.reload(&link)?.status);
            }
        }

        self.resolve_legs(&self.reload(&link)?, &entry).await
    }

    /// Create and submit TP/SL legs. Returns true once the bracket is active.
    async fn place_legs(&self, link: &BracketLink, entry: &ScheduledOrder) -> Result<bool> {
        let Some(spec) = entry.bracket else {
            return Err(anyhow!("entry {} lost its bracket spec", entry.client_order_id));
        };
        let Some(fill_price) = entry.avg_fill_price.or(entry.price) else {
            return Err(anyhow!("entry {} has no fill price", entry.client_order_id));
        };
        let quantity = if entry.executed_qty > Decimal::ZERO {
            entry.executed_qty
        } else {
            entry.order_qty()
        };

        let (tp_price, sl_price) = trigger_prices(entry.side, fill_price, spec.tp_percent, spec.sl_percent);
        let legs = [
            (OrderLeg::TakeProfit, OrderKind::TakeProfit, &link.tp_client_id, tp_price),
            (OrderLeg::StopLoss, OrderKind::StopLoss, &link.sl_client_id, sl_price),
        ];

        let mut rows = Vec::with_capacity(2);
        for (leg, kind, leg_client_id, trigger) in legs {
            let (row, created) = self.store.insert_order(&NewScheduledOrder {
                client_order_id: leg_client_id.clone(),
                execution_id: entry.execution_id,
                strategy_id: entry.strategy_id.clone(),
                sequence: entry.sequence,
                leg,
                symbol: entry.symbol.clone(),
                side: entry.side.opposite(),
                kind,
                requested_qty: quantity,
                price: Some(fill_price),
                trigger_price: Some(trigger),
                leverage: entry.leverage,
                intended_margin: None,
                reduce_only: true,
                bracket: None,
                parent_order_id: Some(entry.id),
            })?;
            if created {
                info!(
                    bracket_id = link.id,
                    client_order_id = %row.client_order_id,
                    trigger = %trigger,
                    quantity = %quantity,
                    "Bracket leg scheduled"
                );
            }
            rows.push(row);
        }

        for row in &rows {
            match self.submitter.submit(row, None).await {
                Ok(_) => {}
                Err(SubmitError::Fatal(e)) => {
                    error!(client_order_id = %row.client_order_id, error = %e, "Bracket leg submission failed fatally");
                    return Err(anyhow::Error::new(e).context(format!(
                        "bracket {} leg {} not placed",
                        link.id, row.client_order_id
                    )));
                }
                Err(SubmitError::Store(e)) => return Err(e),
            }
        }

        let tp = self.order(&link.tp_client_id)?;
        let sl = self.order(&link.sl_client_id)?;
        if let Some(rejected) = [&tp, &sl]
            .into_iter()
            .find(|leg| leg.status == OrderStatus::Rejected)
        {
            self.abort_on_leg_failure(link, rejected).await?;
            return Ok(false);
        }
        if tp.status == OrderStatus::Pending || sl.status == OrderStatus::Pending {
            warn!(bracket_id = link.id, "Bracket leg outcome unknown, bracket stays created");
            return Ok(false);
        }

        if self.store.transition_bracket(
            link.id,
            &[BracketStatus::Created],
            BracketStatus::Active,
            None,
        )? {
            info!(bracket_id = link.id, symbol = %link.symbol, "Bracket active");
        }
        Ok(true)
    }

    /// Enforce TP/SL mutual exclusivity on an active or orphaned bracket.
    async fn resolve_legs(&self, link: &BracketLink, entry: &ScheduledOrder) -> Result<BracketStatus> {
        if link.status.is_terminal() || link.status == BracketStatus::Created {
            return Ok(link.status);
        }
        let tp = self.order(&link.tp_client_id)?;
        let sl = self.order(&link.sl_client_id)?;

        let executed = match (tp.status == OrderStatus::Filled, sl.status == OrderStatus::Filled) {
            (true, true) => {
                error!(bracket_id = link.id, symbol = %link.symbol, "Both bracket legs executed");
                self.journal.emit(EngineEvent::BothLegsExecuted {
                    bracket_id: link.id,
                    symbol: link.symbol.clone(),
                });
                return self.close(link, realized_pnl(entry, &tp));
            }
            (true, false) => Some((&tp, &sl)),
            (false, true) => Some((&sl, &tp)),
            (false, false) => None,
        };

        let Some((filled, sibling)) = executed else {
            return self.resolve_unexecuted(link, tp, sl).await;
        };

        info!(
            bracket_id = link.id,
            executed = %filled.client_order_id,
            sibling = %sibling.client_order_id,
            "Bracket leg executed, cancelling sibling"
        );
        match self.cancel_leg(&sibling).await {
            Ok(OrderStatus::Filled) => {
                error!(bracket_id = link.id, "Sibling executed before it could be cancelled");
                self.journal.emit(EngineEvent::BothLegsExecuted {
                    bracket_id: link.id,
                    symbol: link.symbol.clone(),
                });
                self.close(link, realized_pnl(entry, &filled))
            }
            Ok(_) => self.close(link, realized_pnl(entry, &filled)),
            Err(e) => {
                self.orphan(link, &sibling, &e)?;
                Ok(self.reload(link)?.status)
            }
        }
    }

    /// No leg executed: handle legs that died on their own, and finish
    /// orphaned brackets whose legs can now be cancelled.
    async fn resolve_unexecuted(
        &self,
        link: &BracketLink,
        tp: ScheduledOrder,
        sl: ScheduledOrder,
    ) -> Result<BracketStatus> {
        let dead = [&tp, &sl].into_iter().find(|leg| leg.status.is_terminal());

        match (link.status, dead) {
            (BracketStatus::Active, Some(dead)) => {
                self.abort_on_leg_failure(link, dead).await?;
            }
            (BracketStatus::Orphaned, _) => {
                for leg in [&tp, &sl] {
                    if let Err(e) = self.cancel_leg(leg).await {
                        warn!(bracket_id = link.id, leg = %leg.client_order_id, error = %e, "Orphaned leg still live");
                        return Ok(link.status);
                    }
                }
                self.close(link, None)?;
            }
            _ => {}
        }
        Ok(self.reload(link)?.status)
    }

    /// One leg was refused or died without executing: cancel the other and
    /// abort the bracket.
    async fn abort_on_leg_failure(&self, link: &BracketLink, dead: &ScheduledOrder) -> Result<()> {
        let reason = dead
            .last_error
            .clone()
            .unwrap_or_else(|| format!("leg {} on exchange", dead.status));
        error!(
            bracket_id = link.id,
            leg = %dead.client_order_id,
            %reason,
            "Bracket leg failed, aborting bracket"
        );

        if let Some(sibling_id) = link.sibling_of(&dead.client_order_id) {
            if let Some(sibling) = self.store.get_order_by_client_id(sibling_id)? {
                if let Err(e) = self.cancel_leg(&sibling).await {
                    self.orphan(link, &sibling, &e)?;
                    return Ok(());
                }
            }
        }

        if self.store.transition_bracket(
            link.id,
            &[BracketStatus::Created, BracketStatus::Active],
            BracketStatus::Aborted,
            None,
        )? {
            self.journal.emit(EngineEvent::BracketLegRejected {
                bracket_id: link.id,
                symbol: link.symbol.clone(),
                leg_client_id: dead.client_order_id.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// A position-closing order filled: cancel the symbol's live legs and
    /// close its bracket.
    pub async fn close_for_symbol(&self, exit: &ScheduledOrder) -> Result<Option<BracketStatus>> {
        let Some(link) = self.store.open_bracket_for_symbol(&exit.symbol)? else {
            return Ok(None);
        };
        let entry = self.order(&link.entry_client_id)?;

        if link.status == BracketStatus::Created {
            // Legs were never placed; the entry is the only live order
            if let Err(e) = self.cancel_leg(&entry).await {
                warn!(bracket_id = link.id, error = %e, "Could not cancel unfilled entry on close");
            }
            return Ok(Some(self.advance(&link).await?));
        }

        for leg_id in [&link.tp_client_id, &link.sl_client_id] {
            let leg = self.order(leg_id)?;
            if let Err(e) = self.cancel_leg(&leg).await {
                self.orphan(&link, &leg, &e)?;
                return Ok(Some(self.reload(&link)?.status));
            }
        }

        let pnl = exit
            .avg_fill_price
            .zip(entry.avg_fill_price)
            .map(|(exit_price, entry_price)| {
                pnl_between(entry.side, entry_price, exit_price, exit.executed_qty)
            });
        Ok(Some(self.close(&link, pnl)?))
    }

    /// Cancel a leg with bounded retries. Terminal legs are returned as is.
    async fn cancel_leg(&self, leg: &ScheduledOrder) -> Result<OrderStatus, ExchangeError> {
        if leg.status.is_terminal() {
            return Ok(leg.status);
        }
        self.cancel_policy
            .run("cancel_bracket_leg", || self.submitter.cancel(leg))
            .await
    }

    fn close(&self, link: &BracketLink, pnl: Option<Decimal>) -> Result<BracketStatus> {
        if self.store.transition_bracket(
            link.id,
            &[BracketStatus::Active, BracketStatus::Orphaned],
            BracketStatus::Closed,
            pnl,
        )? {
            info!(bracket_id = link.id, symbol = %link.symbol, pnl = ?pnl, "Bracket closed");
            if let Some(pnl) = pnl {
                self.store.add_realized_pnl(link.execution_id, pnl)?;
            }
        }
        Ok(self.reload(link)?.status)
    }

    fn orphan(&self, link: &BracketLink, sibling: &ScheduledOrder, err: &ExchangeError) -> Result<()> {
        if self.store.transition_bracket(
            link.id,
            &[BracketStatus::Created, BracketStatus::Active],
            BracketStatus::Orphaned,
            None,
        )? {
            error!(
                bracket_id = link.id,
                sibling = %sibling.client_order_id,
                error = %err,
                "Sibling leg cancel failed, bracket orphaned"
            );
            self.journal.emit(EngineEvent::BracketOrphaned {
                bracket_id: link.id,
                symbol: link.symbol.clone(),
                sibling_client_id: sibling.client_order_id.clone(),
                error: err.to_string(),
            });
        }
        Ok(())
    }

    fn reload(&self, link: &BracketLink) -> Result<BracketLink> {
        self.store
            .get_bracket(link.id)?
            .ok_or_else(|| anyhow!("bracket {} missing", link.id))
    }

    fn order(&self, client_order_id: &str) -> Result<ScheduledOrder> {
        self.store
            .get_order_by_client_id(client_order_id)?
            .ok_or_else(|| anyhow!("bracket order {client_order_id} missing"))
    }
}

/// Take-profit and stop-loss trigger prices for a position opened on `side`.
pub fn trigger_prices(
    side: OrderSide,
    fill_price: Decimal,
    tp_percent: Decimal,
    sl_percent: Decimal,
) -> (Decimal, Decimal) {
    let tp = tp_percent / dec!(100);
    let sl = sl_percent / dec!(100);
    match side {
        OrderSide::Buy => (fill_price * (Decimal::ONE + tp), fill_price * (Decimal::ONE - sl)),
        OrderSide::Sell => (fill_price * (Decimal::ONE - tp), fill_price * (Decimal::ONE + sl)),
    }
}

fn pnl_between(side: OrderSide, entry: Decimal, exit: Decimal, quantity: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => (exit - entry) * quantity,
        OrderSide::Sell => (entry - exit) * quantity,
    }
}

fn realized_pnl(entry: &ScheduledOrder, leg: &ScheduledOrder) -> Option<Decimal> {
    let entry_price = entry.avg_fill_price?;
    let exit_price = leg.avg_fill_price?;
    Some(pnl_between(entry.side, entry_price, exit_price, leg.executed_qty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_prices_long() {
        let (tp, sl) = trigger_prices(OrderSide::Buy, dec!(100), dec!(2), dec!(1));
        assert_eq!(tp, dec!(102));
        assert_eq!(sl, dec!(99));
    }

    #[test]
    fn test_trigger_prices_short() {
        let (tp, sl) = trigger_prices(OrderSide::Sell, dec!(100), dec!(2), dec!(1));
        assert_eq!(tp, dec!(98));
        assert_eq!(sl, dec!(101));
    }

    #[test]
    fn test_pnl_direction() {
        assert_eq!(pnl_between(OrderSide::Buy, dec!(100), dec!(102), dec!(2)), dec!(4));
        assert_eq!(pnl_between(OrderSide::Sell, dec!(100), dec!(102), dec!(2)), dec!(-4));
    }
}
