//! Device history: per-student rolling fingerprint records plus the
//! reverse fingerprint index used for device-farm detection.
//!
//! ## Concurrency
//!
//! This is the only mutable shared state touched by concurrent
//! verifications. It is partitioned by student id (and, for the reverse
//! index, by fingerprint) so contention is limited to the rare case of the
//! same student submitting twice concurrently. A per-shard lock serializes
//! history updates per student, which preserves submission order without a
//! global lock.
//!
//! ## Bounds
//!
//! Per-student history is bounded to a maximum number of distinct
//! fingerprints and a retention window (policy-configurable, default 90
//! days) so storage never grows without bound.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use xxhash_rust::xxh64::xxh64;

use crate::policy::VerificationPolicyV1;
use crate::types::{CourseId, Decision, DeviceFingerprint, StudentId};

/// Number of lock shards for both partitions.
const SHARD_COUNT: usize = 16;

/// Capacity of the redemption-attempt window cache.
const ATTEMPT_CACHE_CAPACITY: usize = 4_096;

/// Historical context for one (student, fingerprint) pair at evaluation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceContext {
    /// The student has used this fingerprint before.
    pub known_to_student: bool,
    /// Distinct *other* students this fingerprint appeared for within the
    /// sharing window (any course).
    pub other_students_recent: usize,
    /// Distinct *other* students this fingerprint appeared for within the
    /// farm window, same course.
    pub farm_other_students: usize,
    /// This student's prior Flag/Reject verdict count.
    pub prior_flagged: u32,
}

#[derive(Debug, Clone)]
struct FingerprintRecord {
    fingerprint: DeviceFingerprint,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StudentRecord {
    fingerprints: Vec<FingerprintRecord>,
    flagged_verdicts: u32,
}

#[derive(Debug, Clone)]
struct IndexSighting {
    student_id: StudentId,
    course_id: CourseId,
    seen_at: DateTime<Utc>,
}

type StudentShard = HashMap<StudentId, StudentRecord>;
type FingerprintShard = HashMap<DeviceFingerprint, Vec<IndexSighting>>;

fn student_shard_index(student: &StudentId) -> usize {
    (xxh64(student.as_uuid().as_bytes(), 0) as usize) % SHARD_COUNT
}

fn fingerprint_shard_index(fingerprint: &DeviceFingerprint) -> usize {
    (xxh64(fingerprint.as_str().as_bytes(), 1) as usize) % SHARD_COUNT
}

/// Partitioned device history store.
#[derive(Debug)]
pub struct DeviceHistoryStore {
    students: Vec<RwLock<StudentShard>>,
    fingerprints: Vec<RwLock<FingerprintShard>>,
}

impl Default for DeviceHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            students: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            fingerprints: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    /// Snapshot the historical context for a submission.
    ///
    /// `at` is the evaluation reference time (the bundle's submission
    /// instant), so replaying a verification against unchanged history
    /// yields an identical context.
    pub fn device_context(
        &self,
        student_id: &StudentId,
        fingerprint: &DeviceFingerprint,
        course_id: &CourseId,
        at: DateTime<Utc>,
        policy: &VerificationPolicyV1,
    ) -> DeviceContext {
        let (known_to_student, prior_flagged) = {
            let shard = self.students[student_shard_index(student_id)].read();
            match shard.get(student_id) {
                Some(record) => (
                    record
                        .fingerprints
                        .iter()
                        .any(|r| &r.fingerprint == fingerprint),
                    record.flagged_verdicts,
                ),
                None => (false, 0),
            }
        };

        let sharing_cutoff = at - Duration::seconds(policy.sharing_window_secs);
        let farm_cutoff = at - Duration::seconds(policy.farm_window_secs);

        let (other_students_recent, farm_other_students) = {
            let shard = self.fingerprints[fingerprint_shard_index(fingerprint)].read();
            match shard.get(fingerprint) {
                Some(sightings) => {
                    let mut sharing: Vec<StudentId> = sightings
                        .iter()
                        .filter(|s| {
                            s.student_id != *student_id
                                && s.seen_at >= sharing_cutoff
                                && s.seen_at <= at
                        })
                        .map(|s| s.student_id)
                        .collect();
                    sharing.sort();
                    sharing.dedup();

                    let mut farm: Vec<StudentId> = sightings
                        .iter()
                        .filter(|s| {
                            s.student_id != *student_id
                                && s.course_id == *course_id
                                && s.seen_at >= farm_cutoff
                                && s.seen_at <= at
                        })
                        .map(|s| s.student_id)
                        .collect();
                    farm.sort();
                    farm.dedup();

                    (sharing.len(), farm.len())
                }
                None => (0, 0),
            }
        };

        DeviceContext {
            known_to_student,
            other_students_recent,
            farm_other_students,
            prior_flagged,
        }
    }

    /// Record a fingerprint sighting after an Accept/Flag verdict.
    ///
    /// Sightings are applied in submission order per student: a delayed
    /// earlier write never moves a fingerprint's `last_seen` backwards.
    pub fn record_sighting(
        &self,
        student_id: StudentId,
        fingerprint: DeviceFingerprint,
        course_id: CourseId,
        seen_at: DateTime<Utc>,
        policy: &VerificationPolicyV1,
    ) {
        let retention_cutoff = seen_at - Duration::days(policy.history_retention_days);

        {
            let mut shard = self.students[student_shard_index(&student_id)].write();
            let record = shard.entry(student_id).or_default();

            match record
                .fingerprints
                .iter_mut()
                .find(|r| r.fingerprint == fingerprint)
            {
                Some(existing) => {
                    if seen_at > existing.last_seen {
                        existing.last_seen = seen_at;
                    }
                }
                None => record.fingerprints.push(FingerprintRecord {
                    fingerprint: fingerprint.clone(),
                    last_seen: seen_at,
                }),
            }

            // Enforce the retention window, then the distinct-fingerprint cap
            // (oldest sighting evicted first).
            record.fingerprints.retain(|r| r.last_seen >= retention_cutoff);
            while record.fingerprints.len() > policy.history_max_fingerprints {
                if let Some(oldest) = record
                    .fingerprints
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.last_seen)
                    .map(|(i, _)| i)
                {
                    record.fingerprints.remove(oldest);
                }
            }
        }

        let index_cutoff =
            seen_at - Duration::seconds(policy.sharing_window_secs.max(policy.farm_window_secs));
        let mut shard = self.fingerprints[fingerprint_shard_index(&fingerprint)].write();
        let sightings = shard.entry(fingerprint).or_default();
        sightings.push(IndexSighting {
            student_id,
            course_id,
            seen_at,
        });
        sightings.retain(|s| s.seen_at >= index_cutoff);
    }

    /// Record a verdict outcome for the temporal channel's no-show prior.
    pub fn record_outcome(&self, student_id: StudentId, decision: Decision) {
        if matches!(decision, Decision::Flag | Decision::Reject) {
            let mut shard = self.students[student_shard_index(&student_id)].write();
            shard.entry(student_id).or_default().flagged_verdicts += 1;
        }
    }

    /// Distinct fingerprints currently retained for a student.
    pub fn fingerprint_count(&self, student_id: &StudentId) -> usize {
        self.students[student_shard_index(student_id)]
            .read()
            .get(student_id)
            .map(|r| r.fingerprints.len())
            .unwrap_or(0)
    }
}

/// Bounded per-student window of recent token-redemption attempts.
///
/// Fed by the issuer on every redemption (success or failure); read by the
/// temporal channel to spot scripted bursts.
#[derive(Debug)]
pub struct RedemptionAttempts {
    window: Mutex<LruCache<StudentId, Vec<DateTime<Utc>>>>,
}

impl Default for RedemptionAttempts {
    fn default() -> Self {
        Self::new()
    }
}

impl RedemptionAttempts {
    /// Create an empty attempt window.
    pub fn new() -> Self {
        let capacity =
            NonZeroUsize::new(ATTEMPT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            window: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one redemption attempt.
    pub fn record(&self, student_id: StudentId, at: DateTime<Utc>, retain_secs: i64) {
        let cutoff = at - Duration::seconds(retain_secs);
        let mut window = self.window.lock();
        let attempts = window.get_or_insert_mut(student_id, Vec::new);
        attempts.push(at);
        attempts.retain(|t| *t >= cutoff);
    }

    /// Number of attempts within `window_secs` ending at `at`.
    pub fn attempts_within(&self, student_id: &StudentId, at: DateTime<Utc>, window_secs: i64) -> usize {
        let cutoff = at - Duration::seconds(window_secs);
        let mut window = self.window.lock();
        window
            .get(student_id)
            .map(|attempts| {
                attempts
                    .iter()
                    .filter(|t| **t >= cutoff && **t <= at)
                    .count()
            })
            .unwrap_or(0)
    }
}
