//! Quantity and price normalization against exchange trading filters.
//!
//! Entry quantities are only ever raised: first to the minimum quantity,
//! then until `quantity × price ≥ min_notional`, then up to the next step
//! multiple. Reduce-only quantities are rounded down instead, since they must
//! never exceed the position they close.

use crate::exchange::SymbolFilters;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("quantity {required} needed for min notional exceeds max quantity {max}")]
    AboveMaxQuantity { required: Decimal, max: Decimal },

    #[error("reduce-only quantity {0} rounds below the minimum quantity")]
    BelowMinQuantity(Decimal),
}

/// Result of normalizing a requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedQuantity {
    pub requested: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
}

impl NormalizedQuantity {
    pub fn was_adjusted(&self) -> bool {
        self.quantity != self.requested
    }
}

/// Raise `requested` until it satisfies the symbol's filters at `price`.
pub fn normalize_quantity(
    requested: Decimal,
    price: Decimal,
    filters: &SymbolFilters,
) -> Result<NormalizedQuantity, NormalizeError> {
    if price <= Decimal::ZERO {
        return Err(NormalizeError::InvalidPrice(price));
    }
    if requested <= Decimal::ZERO {
        return Err(NormalizeError::InvalidQuantity(requested));
    }

    let mut quantity = requested.max(filters.min_qty);
    if quantity * price < filters.min_notional {
        quantity = filters.min_notional / price;
    }
    quantity = round_up_to_step(quantity, filters.step_size);

    if filters.max_qty > Decimal::ZERO && quantity > filters.max_qty {
        return Err(NormalizeError::AboveMaxQuantity {
            required: quantity,
            max: filters.max_qty,
        });
    }

    Ok(NormalizedQuantity {
        requested,
        quantity: quantity.normalize(),
        notional: quantity * price,
    })
}

/// Round a closing quantity down to the step size.
pub fn normalize_reduce_only(
    quantity: Decimal,
    filters: &SymbolFilters,
) -> Result<Decimal, NormalizeError> {
    if quantity <= Decimal::ZERO {
        return Err(NormalizeError::InvalidQuantity(quantity));
    }
    let mut rounded = round_down_to_step(quantity, filters.step_size);
    if filters.max_qty > Decimal::ZERO {
        rounded = rounded.min(filters.max_qty);
    }
    if rounded <= Decimal::ZERO || rounded < filters.min_qty {
        return Err(NormalizeError::BelowMinQuantity(quantity));
    }
    Ok(rounded.normalize())
}

/// Margin actually committed by `quantity` at `price`.
pub fn effective_margin(quantity: Decimal, price: Decimal, leverage: u32) -> Decimal {
    quantity * price / Decimal::from(leverage.max(1))
}

/// Round to the nearest tick (e.g. 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    ((value / tick_size).round() * tick_size).normalize()
}

fn round_up_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}
