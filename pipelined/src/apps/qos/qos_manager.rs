use super::{IdManager, QosBackend};
use crate::data::{AggregatedMaximumBitrate, IdRange, QosInformation, Store};
use crate::datapath::registers::Direction;
use anyhow::Result;
use async_std::sync::Mutex;
use openflow::Action;
use slog::{Logger, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Rule number under which a subscriber's APN-AMBR parent queue is stored.  Real rule
/// numbers start at 1.
const AMBR_RULE_NUM: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QosKey {
    pub imsi: String,
    pub rule_num: u32,
    pub direction: Direction,
}

impl QosKey {
    fn new(imsi: &str, rule_num: u32, direction: Direction) -> Self {
        QosKey {
            imsi: imsi.to_string(),
            rule_num,
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub qid: u32,
    pub parent: Option<u32>,
}

pub struct QosManager {
    backend: Arc<dyn QosBackend>,
    // Also serialises every operation of the manager.
    ids: Mutex<IdManager>,
    store: Arc<dyn Store<QosKey, QueueEntry>>,
    range: IdRange,
    max_rate: u64,
    logger: Logger,
}

impl QosManager {
    pub fn new(
        backend: Arc<dyn QosBackend>,
        store: Arc<dyn Store<QosKey, QueueEntry>>,
        range: IdRange,
        max_rate: u64,
        logger: &Logger,
    ) -> Self {
        QosManager {
            backend,
            ids: Mutex::new(IdManager::new(range.min_idx, range.max_idx, logger)),
            store,
            range,
            max_rate,
            logger: logger.clone(),
        }
    }

    /// Bring the backend in line with the store after a (re)start.  A clean restart wipes
    /// every programmed queue.  Otherwise store entries whose queue has vanished are purged,
    /// queues that no entry references are deleted, and the id allocator resumes from the
    /// survivors.
    pub async fn startup(&self, clean_restart: bool) -> Result<()> {
        let mut ids = self.ids.lock().await;
        self.backend.setup().await?;
        let programmed = self.backend.read_all().await?;

        if clean_restart {
            for (qid, _, direction) in programmed {
                if let Err(e) = self.backend.delete(qid, direction).await {
                    warn!(self.logger, "Failed to delete qid {qid} - {e}");
                }
            }
            self.store.clear();
            *ids = IdManager::new(self.range.min_idx, self.range.max_idx, &self.logger);
            return Ok(());
        }

        let programmed_ids: HashSet<u32> = programmed.iter().map(|(qid, _, _)| *qid).collect();
        let mut referenced = HashSet::new();
        for (key, entry) in self.store.entries() {
            if programmed_ids.contains(&entry.qid) {
                referenced.insert(entry.qid);
            } else {
                info!(
                    self.logger,
                    "Purging qid {} of {} rule_num {} - not programmed", entry.qid, key.imsi, key.rule_num
                );
                self.store.remove(&key);
            }
        }
        for (qid, _, direction) in programmed.iter() {
            if !referenced.contains(qid) {
                info!(self.logger, "Deleting unreferenced qid {qid}");
                if let Err(e) = self.backend.delete(*qid, *direction).await {
                    warn!(self.logger, "Failed to delete qid {qid} - {e}");
                }
            }
        }
        let surviving: Vec<u32> = referenced.into_iter().collect();
        ids.restore_state(&surviving);
        Ok(())
    }

    /// Create the queue for one rule of a subscriber in one direction, under the
    /// subscriber's AMBR queue when an AMBR is given.  Returns the flow actions that use
    /// the queue.  Repeating the call for a known rule returns the existing queue.
    pub async fn add_subscriber_qos(
        &self,
        imsi: &str,
        rule_num: u32,
        direction: Direction,
        qos: &QosInformation,
        apn_ambr: Option<&AggregatedMaximumBitrate>,
    ) -> Result<Vec<Action>> {
        let mut ids = self.ids.lock().await;
        let key = QosKey::new(imsi, rule_num, direction);
        if let Some(entry) = self.store.get(&key) {
            return Ok(self.backend.actions(entry.qid));
        }

        let (mbr, gbr) = match direction {
            Direction::Out => (qos.max_req_bw_ul, qos.gbr_ul),
            Direction::In => (qos.max_req_bw_dl, qos.gbr_dl),
        };
        let mbr = if mbr == 0 { self.max_rate } else { mbr };
        let ambr = apn_ambr
            .map(|a| match direction {
                Direction::Out => a.max_bandwidth_ul,
                Direction::In => a.max_bandwidth_dl,
            })
            .filter(|rate| *rate > 0);

        let parent = match ambr {
            Some(rate) => Some(self.ambr_queue(&mut ids, imsi, direction, rate).await?),
            None => None,
        };

        let qid = ids.allocate()?;
        if let Err(e) = self.backend.create(qid, direction, mbr, gbr, parent).await {
            ids.release(qid);
            return Err(e);
        }
        self.store.upsert(key, &mut |_| QueueEntry { qid, parent });
        info!(
            self.logger,
            "Created qid {qid} for {imsi} rule_num {rule_num} {direction:?} mbr {mbr}"
        );
        Ok(self.backend.actions(qid))
    }

    async fn ambr_queue(
        &self,
        ids: &mut IdManager,
        imsi: &str,
        direction: Direction,
        rate: u64,
    ) -> Result<u32> {
        let key = QosKey::new(imsi, AMBR_RULE_NUM, direction);
        if let Some(entry) = self.store.get(&key) {
            return Ok(entry.qid);
        }
        let qid = ids.allocate()?;
        if let Err(e) = self.backend.create(qid, direction, rate, rate, None).await {
            ids.release(qid);
            return Err(e);
        }
        self.store
            .upsert(key, &mut |_| QueueEntry { qid, parent: None });
        Ok(qid)
    }

    /// Remove the queues of one rule, of one subscriber, or (with no imsi) of everyone.
    /// An AMBR queue goes once none of the subscriber's rules use it.
    pub async fn remove_subscriber_qos(&self, imsi: Option<&str>, rule_num: Option<u32>) {
        let mut ids = self.ids.lock().await;
        let entries = self.store.entries();
        let mut doomed: Vec<(QosKey, QueueEntry)> = match (imsi, rule_num) {
            (None, _) => entries,
            (Some(imsi), None) => {
                let doomed: Vec<_> = entries.into_iter().filter(|(k, _)| k.imsi == imsi).collect();
                if doomed.is_empty() {
                    error!(self.logger, "unable to find imsi {imsi}");
                }
                doomed
            }
            (Some(imsi), Some(rule_num)) => {
                let (mut doomed, remaining): (Vec<_>, Vec<_>) = entries
                    .into_iter()
                    .filter(|(k, _)| k.imsi == imsi)
                    .partition(|(k, _)| k.rule_num == rule_num);
                if doomed.is_empty() {
                    error!(self.logger, "unable to find rule_num {rule_num} for imsi {imsi}");
                    return;
                }
                for direction in Direction::both() {
                    let still_used = remaining
                        .iter()
                        .any(|(k, _)| k.direction == direction && k.rule_num != AMBR_RULE_NUM);
                    if !still_used {
                        doomed.extend(remaining.iter().filter(|(k, _)| {
                            k.direction == direction && k.rule_num == AMBR_RULE_NUM
                        }).cloned());
                    }
                }
                doomed
            }
        };

        // Children before their parents.
        doomed.sort_by_key(|(k, _)| k.rule_num == AMBR_RULE_NUM);
        for (key, entry) in doomed {
            self.store.remove(&key);
            if let Err(e) = self.backend.delete(entry.qid, key.direction).await {
                warn!(self.logger, "Failed to delete qid {} - {e}", entry.qid);
            }
            ids.release(entry.qid);
        }
    }

    pub fn get_queue(&self, imsi: &str, rule_num: u32, direction: Direction) -> Option<QueueEntry> {
        self.store.get(&QosKey::new(imsi, rule_num, direction))
    }
}
