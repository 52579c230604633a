//! Cluster-wide barrier bookkeeping.
//!
//! The coordinator tracks one barrier at a time: which participants the
//! broadcast went to, which have reached it, and who is waiting for the
//! release. Timeouts and participant loss are decided by the communicator;
//! the coordinator only keeps the sets straight.

use std::collections::HashSet;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::message::{BarrierStatus, ModuleId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Idle,
    /// Broadcast sent, no participant heard from yet.
    Requested,
    /// At least one participant reached the barrier.
    Waiting,
}

pub(crate) struct BarrierCoordinator {
    phase: BarrierPhase,
    uuid: Option<Uuid>,
    expected: HashSet<ModuleId>,
    reached: HashSet<ModuleId>,
    lost: bool,
    waiters: Vec<oneshot::Sender<BarrierStatus>>,
}

impl BarrierCoordinator {
    pub fn new() -> Self {
        Self {
            phase: BarrierPhase::Idle,
            uuid: None,
            expected: HashSet::new(),
            reached: HashSet::new(),
            lost: false,
            waiters: Vec::new(),
        }
    }

    pub fn phase(&self) -> BarrierPhase {
        self.phase
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    /// Start a barrier over `participants`. The returned receiver resolves
    /// when the last participant reaches it or the communicator gives up.
    pub fn begin(
        &mut self,
        uuid: Uuid,
        participants: impl IntoIterator<Item = ModuleId>,
    ) -> Result<oneshot::Receiver<BarrierStatus>> {
        if self.phase != BarrierPhase::Idle {
            return Err(Error::Protocol(format!(
                "barrier {uuid} requested while {:?} is still pending",
                self.uuid
            )));
        }
        self.phase = BarrierPhase::Requested;
        self.uuid = Some(uuid);
        self.expected = participants.into_iter().collect();
        self.reached.clear();
        self.lost = false;

        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);

        // Nobody to wait for: release immediately.
        if self.expected.is_empty() {
            self.release(BarrierStatus::Ok);
        }
        Ok(rx)
    }

    /// A participant reached the barrier. Returns the release status once
    /// everyone arrived.
    pub fn reached(&mut self, uuid: Uuid, module: ModuleId) -> Option<BarrierStatus> {
        if self.uuid != Some(uuid) || self.phase == BarrierPhase::Idle {
            tracing::debug!("stale barrier ack {uuid} from {module}");
            return None;
        }
        if !self.expected.contains(&module) {
            return None;
        }
        self.phase = BarrierPhase::Waiting;
        self.reached.insert(module);
        self.try_release()
    }

    /// A participant went away. During an active barrier it no longer
    /// counts, but the release is tainted.
    pub fn participant_lost(&mut self, module: ModuleId) -> Option<BarrierStatus> {
        if self.phase == BarrierPhase::Idle || !self.expected.remove(&module) {
            return None;
        }
        self.reached.remove(&module);
        self.lost = true;
        self.try_release()
    }

    /// Give up on the stragglers. Returns the participants that never
    /// reached the barrier; the coordinator releases with
    /// [`BarrierStatus::ParticipantLost`].
    pub fn timeout(&mut self) -> Vec<ModuleId> {
        if self.phase == BarrierPhase::Idle {
            return Vec::new();
        }
        let missing: Vec<ModuleId> = self.expected.difference(&self.reached).copied().collect();
        self.release(BarrierStatus::ParticipantLost);
        missing
    }

    fn try_release(&mut self) -> Option<BarrierStatus> {
        if !self.reached.is_superset(&self.expected) {
            return None;
        }
        let status = if self.lost {
            BarrierStatus::ParticipantLost
        } else {
            BarrierStatus::Ok
        };
        self.release(status);
        Some(status)
    }

    fn release(&mut self, status: BarrierStatus) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(status);
        }
        self.phase = BarrierPhase::Idle;
        self.uuid = None;
        self.expected.clear();
        self.reached.clear();
        self.lost = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_when_all_reached() {
        let mut coord = BarrierCoordinator::new();
        let uuid = Uuid::new_v4();
        let mut rx = coord
            .begin(uuid, [ModuleId(1), ModuleId(2), ModuleId(3)])
            .unwrap();
        assert_eq!(coord.phase(), BarrierPhase::Requested);

        assert!(coord.reached(uuid, ModuleId(1)).is_none());
        assert_eq!(coord.phase(), BarrierPhase::Waiting);
        assert!(coord.reached(uuid, ModuleId(2)).is_none());
        assert_eq!(coord.reached(uuid, ModuleId(3)), Some(BarrierStatus::Ok));

        assert_eq!(coord.phase(), BarrierPhase::Idle);
        assert_eq!(rx.try_recv().unwrap(), BarrierStatus::Ok);
    }

    #[test]
    fn lost_participant_taints_the_release() {
        let mut coord = BarrierCoordinator::new();
        let uuid = Uuid::new_v4();
        let mut rx = coord.begin(uuid, [ModuleId(1), ModuleId(2)]).unwrap();

        assert!(coord.reached(uuid, ModuleId(1)).is_none());
        assert_eq!(
            coord.participant_lost(ModuleId(2)),
            Some(BarrierStatus::ParticipantLost)
        );
        assert_eq!(rx.try_recv().unwrap(), BarrierStatus::ParticipantLost);
    }

    #[test]
    fn timeout_names_the_stragglers() {
        let mut coord = BarrierCoordinator::new();
        let uuid = Uuid::new_v4();
        let _rx = coord.begin(uuid, [ModuleId(1), ModuleId(2)]).unwrap();
        coord.reached(uuid, ModuleId(1));

        let missing = coord.timeout();
        assert_eq!(missing, vec![ModuleId(2)]);
        assert_eq!(coord.phase(), BarrierPhase::Idle);
    }

    #[test]
    fn rejects_overlapping_barriers_and_stale_acks() {
        let mut coord = BarrierCoordinator::new();
        let first = Uuid::new_v4();
        let _rx = coord.begin(first, [ModuleId(1)]).unwrap();
        assert!(coord.begin(Uuid::new_v4(), [ModuleId(1)]).is_err());

        // An ack for some other barrier does not advance this one.
        assert!(coord.reached(Uuid::new_v4(), ModuleId(1)).is_none());
        assert_eq!(coord.phase(), BarrierPhase::Requested);
    }

    #[test]
    fn empty_barrier_releases_immediately() {
        let mut coord = BarrierCoordinator::new();
        let mut rx = coord.begin(Uuid::new_v4(), []).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BarrierStatus::Ok);
    }
}
