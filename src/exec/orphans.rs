// =============================================================================
// Orphan-order cleanup
// =============================================================================
//
// A conditional exit whose position no longer exists must be garbage-
// collected before a new entry, otherwise a stale SL/TP can flatten the
// fresh position. Both order channels are enumerated and every order is
// cancelled through the channel it came from. Cancellation is best-effort:
// a failed cancel is logged and the rest proceed.
// =============================================================================

use tracing::{debug, warn};

use crate::venue::{OrderChannel, VenueClient, VenueResult};

/// Cancel orphaned SL/TP orders for `symbol` if no position is open.
/// Returns the number of orders cancelled.
pub async fn cancel_orphan_exits(
    venue: &dyn VenueClient,
    symbol: &str,
    user_id: &str,
) -> VenueResult<usize> {
    let positions = venue.positions(Some(symbol)).await?;
    if positions.iter().any(|p| p.is_open()) {
        debug!(symbol, user_id, "position open, exit orders are not orphans");
        return Ok(0);
    }

    cancel_all_exits(venue, symbol, user_id).await
}

/// Cancel every resting SL/TP order for `symbol` on both channels,
/// regardless of position state. Used after a confirmed flatten.
pub async fn cancel_all_exits(
    venue: &dyn VenueClient,
    symbol: &str,
    user_id: &str,
) -> VenueResult<usize> {
    let mut orders = venue.open_orders(symbol).await?;
    match venue.open_conditional_orders(symbol).await {
        Ok(mut conditional) => orders.append(&mut conditional),
        Err(e) => warn!(symbol, user_id, error = %e, "conditional order listing failed"),
    }

    let mut cancelled = 0usize;
    for order in orders.iter().filter(|o| o.is_stop() || o.is_take_profit()) {
        let result = match order.channel {
            OrderChannel::Classic => venue.cancel_order(symbol, order.id).await,
            OrderChannel::Algo => venue.cancel_conditional(symbol, order.id).await,
        };
        match result {
            Ok(()) => {
                cancelled += 1;
                debug!(symbol, order_id = order.id, order_type = %order.order_type, "exit order cancelled");
            }
            Err(e) => {
                warn!(symbol, user_id, order_id = order.id, error = %e, "could not cancel exit order");
            }
        }
    }

    Ok(cancelled)
}
