//! Startup driver tying the durable pieces together.

use std::sync::Arc;

use tracing::info;

use crate::config::ChannelConfig;
use crate::error::ReplayError;
use crate::oracle::SequenceOracle;
use crate::queue::IndexQueue;
use crate::replay::{collect_log_files, ReplayEngine, ReplayStats};

/// The durable core of a file-backed channel: the index queue plus the two
/// sequence oracles, opened and replayed to a consistent state.
///
/// `open` performs the whole startup sequence — load the checkpoint,
/// enumerate the log directories, replay everything newer than the
/// checkpoint — after which the queue is live and the transaction layer
/// may drive it.
#[derive(Debug)]
pub struct ChannelCore {
    queue: IndexQueue,
    transaction_ids: Arc<SequenceOracle>,
    write_orders: Arc<SequenceOracle>,
}

impl ChannelCore {
    /// Opens the checkpoint and replays the configured log directories.
    ///
    /// # Errors
    ///
    /// Returns an error when the checkpoint is rejected (corrupt, wrong
    /// capacity or version) or replay fails; see [`ReplayError`].
    pub fn open(config: &ChannelConfig) -> Result<(Self, ReplayStats), ReplayError> {
        let transaction_ids = Arc::new(SequenceOracle::new());
        let write_orders = Arc::new(SequenceOracle::new());

        let queue = IndexQueue::open(config, Arc::clone(&write_orders))?;
        let logs = collect_log_files(&config.log_dirs)?;
        info!(
            channel = %config.name,
            checkpoint = queue.log_write_order_id(),
            logs = logs.len(),
            "replaying channel"
        );

        let mut engine = ReplayEngine::new(&queue, &transaction_ids, &write_orders);
        let stats = if config.use_legacy_replay {
            #[allow(deprecated)]
            let stats = engine.replay_legacy(&logs)?;
            stats
        } else {
            engine.replay(&logs)?
        };
        drop(engine);

        info!(
            channel = %config.name,
            size = queue.size(),
            applied = stats.applied,
            "channel is live"
        );
        Ok((
            Self {
                queue,
                transaction_ids,
                write_orders,
            },
            stats,
        ))
    }

    /// The live index queue.
    #[must_use]
    pub fn queue(&self) -> &IndexQueue {
        &self.queue
    }

    /// Oracle issuing transaction IDs.
    #[must_use]
    pub fn transaction_ids(&self) -> &Arc<SequenceOracle> {
        &self.transaction_ids
    }

    /// Oracle issuing write-order IDs, shared with the queue's checkpoint
    /// stamping.
    #[must_use]
    pub fn write_orders(&self) -> &Arc<SequenceOracle> {
        &self.write_orders
    }
}
