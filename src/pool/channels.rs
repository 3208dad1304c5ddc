//! The lazily-declared channel cache shared by all producer connections.
//!
//! The cache is global across connections rather than per-connection: the
//! key already encodes the connection index, so one map under one lock
//! serves the whole pool.

use crate::amqp::topology::{channel_key, declare_topology, Topology};
use crate::errors::{ErrorCode, RabbitMqError};
use crate::pool::{ConnectionSlot, RabbitPool};
use std::collections::HashMap;
use std::sync::Arc;

/// A cached broker channel. Consumer workers never land here: their
/// channels are per-worker and die with the worker.
pub(crate) struct CachedChannel {
    pub(crate) channel: lapin::Channel,
}

impl CachedChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

impl RabbitPool {
    /// Fetch the cached channel for `(slot, topology)`, declaring the
    /// topology on a fresh channel when no usable entry exists.
    ///
    /// With `reset_if_closed`, an entry whose channel has gone down is
    /// evicted first; callers set this after a reconnect, when any cached
    /// channel is known to belong to the dead connection.
    pub(crate) async fn get_or_declare_channel(
        &self,
        channels: &mut HashMap<u64, CachedChannel>,
        slot: &Arc<ConnectionSlot>,
        topology: &Topology,
        reset_if_closed: bool,
    ) -> Result<lapin::Channel, RabbitMqError> {
        let key = channel_key(self.role(), slot.index, topology);

        if reset_if_closed && channels.get(&key).is_some_and(|c| !c.is_open()) {
            self.evict_channel(channels, slot.index, topology).await;
        }
        if let Some(cached) = channels.get(&key) {
            return Ok(cached.channel.clone());
        }

        let guard = slot.conn.read().await;
        let connection = guard.as_ref().ok_or_else(|| {
            RabbitMqError::new(
                ErrorCode::GetChannel,
                format!("connection slot {} holds no connection", slot.index),
                "",
            )
        })?;
        let channel = connection.create_channel().await.map_err(|e| {
            RabbitMqError::new(
                ErrorCode::ChannelCreate,
                "failed to open a channel",
                e.to_string(),
            )
        })?;
        declare_topology(&channel, topology, None).await?;

        channels.insert(
            key,
            CachedChannel {
                channel: channel.clone(),
            },
        );
        Ok(channel)
    }
}
