//! Sending and forwarding payments over routes.

use tracing::{debug, info, instrument};

use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChannelId, HtlcDirection, HtlcId, NodeId, PaymentHash};

use crate::graph::Route;
use crate::manager::ChannelManager;

impl ChannelManager {
    /// Offers the first hop of `route`, locking the amount plus every
    /// downstream fee.
    ///
    /// # Errors
    /// `ValidationError` if the route's first channel does not lead to the
    /// hop's node.
    pub async fn send_payment(&self, route: &Route, payment_hash: PaymentHash) -> Result<HtlcId> {
        let hop = route
            .first_hop()
            .ok_or_else(|| KestrelError::ValidationError("route has no hops".into()))?;
        let counterparty = self.channel(&hop.channel_id).await?.counterparty;
        if counterparty != hop.node {
            return Err(KestrelError::ValidationError(format!(
                "channel {} does not lead to {}",
                hop.channel_id, hop.node
            )));
        }

        let htlc_id = self
            .add_htlc(hop.channel_id, payment_hash, hop.amount, hop.expiry)
            .await?;
        info!(
            htlc = %htlc_id,
            hops = route.hops.len(),
            amount = route.amount,
            fee = route.total_fee,
            "Payment sent"
        );
        Ok(htlc_id)
    }

    /// Routes `amount` to `target` and sends it.
    ///
    /// The final hop expires `min_final_cltv` blocks from now, never less
    /// than the configured minimum.
    #[instrument(skip_all, fields(target = %target, amount = amount))]
    pub async fn pay(
        &self,
        target: NodeId,
        amount: u64,
        payment_hash: PaymentHash,
        min_final_cltv: u32,
    ) -> Result<(Route, HtlcId)> {
        let height = self.chain().get_block_height().await?;
        let delta = min_final_cltv.max(self.config().min_final_cltv);
        let route = self.find_route(target, amount, height.saturating_add(delta))?;
        let htlc_id = self.send_payment(&route, payment_hash).await?;
        Ok((route, htlc_id))
    }

    /// Forwards a received HTLC onto `outgoing_channel`.
    ///
    /// The incoming HTLC must cover `amount` plus our relay fee and expire at
    /// least the relay delta after `expiry`. Settling or failing the outgoing
    /// HTLC settles or fails the incoming one.
    ///
    /// Both channels are locked in id order.
    #[instrument(skip_all, fields(incoming = %incoming, outgoing = %outgoing_channel, amount = amount))]
    pub async fn forward_htlc(
        &self,
        incoming: HtlcId,
        outgoing_channel: ChannelId,
        amount: u64,
        expiry: u32,
    ) -> Result<HtlcId> {
        if incoming.channel_id == outgoing_channel {
            return Err(KestrelError::ValidationError(
                "cannot forward onto the incoming channel".into(),
            ));
        }
        let height = self.chain().get_block_height().await?;
        let incoming_entry = self.entry(&incoming.channel_id)?;
        let outgoing_entry = self.entry(&outgoing_channel)?;

        let (incoming_guard, mut outgoing_guard) = if incoming.channel_id < outgoing_channel {
            let a = incoming_entry.lock().await;
            let b = outgoing_entry.lock().await;
            (a, b)
        } else {
            let b = outgoing_entry.lock().await;
            let a = incoming_entry.lock().await;
            (a, b)
        };

        let htlc = incoming_guard
            .record
            .pending_htlc(incoming.index)
            .ok_or_else(|| KestrelError::not_found("htlc", incoming))?;
        if htlc.direction != HtlcDirection::Received {
            return Err(KestrelError::ValidationError(format!(
                "HTLC {} was not received",
                incoming
            )));
        }

        let relay = self.config().relay;
        let fee = relay.fee_for(amount).ok_or(KestrelError::AmountOverflow)?;
        let required = amount.checked_add(fee).ok_or(KestrelError::AmountOverflow)?;
        if htlc.amount < required {
            return Err(KestrelError::ValidationError(format!(
                "incoming HTLC carries {} but forwarding {} needs {}",
                htlc.amount, amount, required
            )));
        }
        if u64::from(htlc.expiry) < u64::from(expiry) + u64::from(relay.cltv_delta) {
            return Err(KestrelError::HtlcExpiryTooSoon {
                expiry: htlc.expiry,
                height: expiry.saturating_add(relay.cltv_delta),
            });
        }
        let payment_hash = htlc.payment_hash;

        let outgoing = self
            .add_locked(
                &mut outgoing_guard,
                HtlcDirection::Offered,
                payment_hash,
                amount,
                expiry,
                height,
                Some(incoming),
            )
            .await?;
        drop(incoming_guard);
        self.forwards.insert(outgoing, incoming);
        debug!(outgoing = %outgoing, fee = fee, "HTLC forwarded");
        Ok(outgoing)
    }

    /// Number of forwarded HTLCs still awaiting resolution.
    pub fn pending_forwards(&self) -> usize {
        self.forwards.len()
    }
}
