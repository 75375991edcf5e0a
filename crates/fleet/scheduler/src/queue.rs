//! Strict-priority FIFO buckets.

use std::collections::{HashMap, HashSet, VecDeque};

use fleet_types::JobId;

/// One FIFO queue per priority level; bucket 0 is always served first.
///
/// A job is a member of at most one bucket at a time.
#[derive(Debug, Clone)]
pub struct PriorityQueues {
    buckets: Vec<VecDeque<JobId>>,
    members: HashMap<JobId, u8>,
}

impl PriorityQueues {
    pub fn new(levels: u8) -> Self {
        Self {
            buckets: (0..levels.max(1)).map(|_| VecDeque::new()).collect(),
            members: HashMap::new(),
        }
    }

    pub fn levels(&self) -> u8 {
        self.buckets.len() as u8
    }

    /// Append to the back of a bucket. Returns `false` (and does nothing)
    /// when the job is already queued or the bucket does not exist.
    pub fn push(&mut self, priority: u8, job_id: JobId) -> bool {
        if self.members.contains_key(&job_id) {
            return false;
        }
        let Some(bucket) = self.buckets.get_mut(priority as usize) else {
            return false;
        };
        bucket.push_back(job_id);
        self.members.insert(job_id, priority);
        true
    }

    /// Front of the highest-priority non-empty bucket.
    pub fn peek(&self) -> Option<(u8, JobId)> {
        self.buckets
            .iter()
            .enumerate()
            .find_map(|(level, bucket)| bucket.front().map(|id| (level as u8, *id)))
    }

    pub fn pop(&mut self) -> Option<(u8, JobId)> {
        let level = self.buckets.iter().position(|b| !b.is_empty())?;
        let job_id = self.buckets[level].pop_front()?;
        self.members.remove(&job_id);
        Some((level as u8, job_id))
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        let Some(level) = self.members.remove(job_id) else {
            return false;
        };
        let bucket = &mut self.buckets[level as usize];
        if let Some(pos) = bucket.iter().position(|id| id == job_id) {
            bucket.remove(pos);
        }
        true
    }

    /// Remove every listed job in one pass per bucket.
    pub fn remove_all(&mut self, job_ids: &HashSet<JobId>) -> usize {
        let before = self.members.len();
        self.members.retain(|id, _| !job_ids.contains(id));
        for bucket in &mut self.buckets {
            bucket.retain(|id| !job_ids.contains(id));
        }
        before - self.members.len()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.members.contains_key(job_id)
    }

    pub fn priority_of(&self, job_id: &JobId) -> Option<u8> {
        self.members.get(job_id).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Queue depth per bucket.
    pub fn depths(&self) -> Vec<usize> {
        self.buckets.iter().map(VecDeque::len).collect()
    }
}
