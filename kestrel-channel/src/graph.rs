//! Channel graph and route finding.
//!
//! Routes are searched backwards from the payee so each hop's amount already
//! includes the fees of every hop after it. Cost is the cumulative fee; ties
//! go to the shorter route.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kestrel_core::constants::MAX_ROUTE_HOPS;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChannelId, NodeId};

use crate::config::RelayPolicy;

/// One direction of a known channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEdge {
    /// Channel id
    pub channel_id: ChannelId,
    /// Forwarding node
    pub from: NodeId,
    /// Receiving node
    pub to: NodeId,
    /// Largest amount the edge carries
    pub capacity: u64,
    /// Fees `from` charges for forwarding over this edge
    pub policy: RelayPolicy,
    /// Disabled edges are never routed through
    pub enabled: bool,
}

/// One hop of a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Channel carrying the hop
    pub channel_id: ChannelId,
    /// Node receiving the HTLC
    pub node: NodeId,
    /// HTLC amount on this channel
    pub amount: u64,
    /// HTLC expiry on this channel
    pub expiry: u32,
}

/// A path from the payer to the payee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Hops in payment order
    pub hops: Vec<RouteHop>,
    /// Amount delivered to the payee
    pub amount: u64,
    /// Routing fees paid to intermediate nodes
    pub total_fee: u64,
}

impl Route {
    /// Amount the payer offers on the first hop.
    pub fn total_amount(&self) -> u64 {
        self.amount + self.total_fee
    }

    /// First hop, offered by the payer.
    pub fn first_hop(&self) -> Option<&RouteHop> {
        self.hops.first()
    }
}

/// Directed graph of channels we know about.
#[derive(Clone, Debug, Default)]
pub struct ChannelGraph {
    /// Edges keyed by their receiving node
    incoming: HashMap<NodeId, Vec<ChannelEdge>>,
}

#[derive(Clone, Copy)]
struct Label {
    fee: u64,
    hops: usize,
    /// Amount on the edge arriving at this node
    amount: u64,
    /// Expiry on the edge arriving at this node
    expiry: u32,
    /// Edge leaving this node towards the payee
    next: Option<ChannelEdge>,
}

impl ChannelGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one direction of a channel.
    pub fn add_edge(&mut self, edge: ChannelEdge) {
        let edges = self.incoming.entry(edge.to).or_default();
        edges.retain(|e| !(e.channel_id == edge.channel_id && e.from == edge.from));
        edges.push(edge);
    }

    /// Adds both directions of a channel with the same policy.
    pub fn add_channel(&mut self, channel_id: ChannelId, a: NodeId, b: NodeId, capacity: u64, policy: RelayPolicy) {
        for (from, to) in [(a, b), (b, a)] {
            self.add_edge(ChannelEdge {
                channel_id,
                from,
                to,
                capacity,
                policy,
                enabled: true,
            });
        }
    }

    /// Removes both directions of a channel. Returns the number of edges removed.
    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> usize {
        let mut removed = 0;
        for edges in self.incoming.values_mut() {
            let before = edges.len();
            edges.retain(|e| e.channel_id != *channel_id);
            removed += before - edges.len();
        }
        self.incoming.retain(|_, edges| !edges.is_empty());
        removed
    }

    /// Enables or disables both directions of a channel.
    pub fn set_enabled(&mut self, channel_id: &ChannelId, enabled: bool) {
        for edge in self.incoming.values_mut().flatten() {
            if edge.channel_id == *channel_id {
                edge.enabled = enabled;
            }
        }
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.incoming.values().map(Vec::len).sum()
    }

    /// Cheapest route delivering `amount` to `target` with `final_expiry` on
    /// the last hop.
    ///
    /// # Errors
    /// - `ValidationError` if `source == target` or `amount` is zero
    /// - `NoRouteFound` if no path within [`MAX_ROUTE_HOPS`] can carry the amount
    pub fn find_route(&self, source: NodeId, target: NodeId, amount: u64, final_expiry: u32) -> Result<Route> {
        if source == target {
            return Err(KestrelError::ValidationError("cannot route to ourselves".into()));
        }
        if amount == 0 {
            return Err(KestrelError::ValidationError("route amount must be positive".into()));
        }

        let mut labels: HashMap<NodeId, Label> = HashMap::new();
        let mut heap = BinaryHeap::new();
        labels.insert(
            target,
            Label {
                fee: 0,
                hops: 0,
                amount,
                expiry: final_expiry,
                next: None,
            },
        );
        heap.push(Reverse((0u64, 0usize, target)));

        while let Some(Reverse((fee, hops, node))) = heap.pop() {
            let label = labels[&node];
            if (fee, hops) > (label.fee, label.hops) {
                continue;
            }
            if node == source {
                return Ok(Self::assemble(&labels, source, target, amount));
            }
            if hops >= MAX_ROUTE_HOPS {
                continue;
            }

            for edge in self.incoming.get(&node).into_iter().flatten() {
                if !edge.enabled || edge.capacity < label.amount || edge.from == node {
                    continue;
                }
                // The payer forwards nothing, so it charges no fee and adds no delta.
                let (hop_fee, delta) = if edge.from == source {
                    (0, 0)
                } else {
                    match edge.policy.fee_for(label.amount) {
                        Some(f) => (f, edge.policy.cltv_delta),
                        None => continue,
                    }
                };
                let (Some(next_fee), Some(next_amount), Some(next_expiry)) = (
                    label.fee.checked_add(hop_fee),
                    label.amount.checked_add(hop_fee),
                    label.expiry.checked_add(delta),
                ) else {
                    continue;
                };

                let candidate = Label {
                    fee: next_fee,
                    hops: hops + 1,
                    amount: next_amount,
                    expiry: next_expiry,
                    next: Some(*edge),
                };
                let better = match labels.get(&edge.from) {
                    Some(existing) => (candidate.fee, candidate.hops) < (existing.fee, existing.hops),
                    None => true,
                };
                if better {
                    labels.insert(edge.from, candidate);
                    heap.push(Reverse((candidate.fee, candidate.hops, edge.from)));
                }
            }
        }

        debug!(%source, %target, amount, "No route");
        Err(KestrelError::NoRouteFound(format!(
            "{} sats from {} to {}",
            amount, source, target
        )))
    }

    fn assemble(labels: &HashMap<NodeId, Label>, source: NodeId, target: NodeId, amount: u64) -> Route {
        let mut hops = Vec::new();
        let mut node = source;
        while node != target {
            let Some(edge) = labels[&node].next else { break };
            let arriving = labels[&edge.to];
            hops.push(RouteHop {
                channel_id: edge.channel_id,
                node: edge.to,
                amount: arriving.amount,
                expiry: arriving.expiry,
            });
            node = edge.to;
        }
        Route {
            hops,
            amount,
            total_fee: labels[&source].fee,
        }
    }
}
