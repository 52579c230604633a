//! Rank-local collectives for the ranks of one module instance.
//!
//! Gang scheduling needs rank-level agreement (everyone prepared, anyone
//! with more work, highest timestep seen) that is distinct from the
//! hub-level message barrier. `RankComm` abstracts those collectives: real
//! MPI behind the `mpi` cargo feature, an in-process group for tests and
//! single-node runs, and a trivial single-rank fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Collectives over the ranks of one module instance.
#[async_trait::async_trait]
pub trait RankComm: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    /// Block until every rank arrived.
    async fn barrier(&self);

    /// Logical AND over all ranks.
    async fn all_agree(&self, value: bool) -> bool;

    /// Logical OR over all ranks.
    async fn any_rank(&self, value: bool) -> bool;

    /// Maximum over all ranks.
    async fn max_i32(&self, value: i32) -> i32;
}

/// The no-op communicator of a single-rank module.
#[derive(Debug, Default)]
pub struct SingleRank;

#[async_trait::async_trait]
impl RankComm for SingleRank {
    fn rank(&self) -> i32 {
        0
    }

    fn size(&self) -> i32 {
        1
    }

    async fn barrier(&self) {}

    async fn all_agree(&self, value: bool) -> bool {
        value
    }

    async fn any_rank(&self, value: bool) -> bool {
        value
    }

    async fn max_i32(&self, value: i32) -> i32 {
        value
    }
}

struct GroupInner {
    size: i32,
    barrier: tokio::sync::Barrier,
    /// Double-buffered reduction slots: round r uses slots[r % 2]. A slot is
    /// only rewritten two rounds later, after every rank passed the barrier
    /// in between, so one barrier per collective suffices.
    slots: [Mutex<Vec<i64>>; 2],
}

/// One rank of an in-process rank group.
///
/// Models the ranks of an MPI module instance with tasks instead of
/// processes; the scheduling tests run M ranks on one runtime this way.
pub struct LocalRank {
    inner: Arc<GroupInner>,
    rank: i32,
    round: AtomicU64,
}

impl LocalRank {
    /// Create a connected group of `size` ranks.
    pub fn group(size: usize) -> Vec<LocalRank> {
        assert!(size > 0);
        let inner = Arc::new(GroupInner {
            size: size as i32,
            barrier: tokio::sync::Barrier::new(size),
            slots: [Mutex::new(vec![0; size]), Mutex::new(vec![0; size])],
        });
        (0..size)
            .map(|rank| LocalRank {
                inner: inner.clone(),
                rank: rank as i32,
                round: AtomicU64::new(0),
            })
            .collect()
    }

    async fn reduce(&self, value: i64, init: i64, op: fn(i64, i64) -> i64) -> i64 {
        let round = (self.round.fetch_add(1, Ordering::Relaxed) % 2) as usize;
        self.inner.slots[round].lock()[self.rank as usize] = value;
        self.inner.barrier.wait().await;
        let slots = self.inner.slots[round].lock();
        slots.iter().copied().fold(init, op)
    }
}

#[async_trait::async_trait]
impl RankComm for LocalRank {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.inner.size
    }

    async fn barrier(&self) {
        self.round.fetch_add(1, Ordering::Relaxed);
        self.inner.barrier.wait().await;
    }

    async fn all_agree(&self, value: bool) -> bool {
        self.reduce(value as i64, 1, |a, b| a & b).await != 0
    }

    async fn any_rank(&self, value: bool) -> bool {
        self.reduce(value as i64, 0, |a, b| a | b).await != 0
    }

    async fn max_i32(&self, value: i32) -> i32 {
        self.reduce(value as i64, i64::MIN, i64::max).await as i32
    }
}

#[cfg(feature = "mpi")]
pub use self::real::MpiRankComm;

#[cfg(feature = "mpi")]
mod real {
    use super::RankComm;
    use mpi::collective::SystemOperation;
    use mpi::topology::SystemCommunicator;
    use mpi::traits::*;

    /// Rank collectives over the process-level MPI world.
    pub struct MpiRankComm {
        world: SystemCommunicator,
        _universe: mpi::environment::Universe,
    }

    impl MpiRankComm {
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            Some(Self {
                world,
                _universe: universe,
            })
        }
    }

    #[async_trait::async_trait]
    impl RankComm for MpiRankComm {
        fn rank(&self) -> i32 {
            self.world.rank()
        }

        fn size(&self) -> i32 {
            self.world.size()
        }

        async fn barrier(&self) {
            self.world.barrier();
        }

        async fn all_agree(&self, value: bool) -> bool {
            let local = value as i32;
            let mut global = 0i32;
            self.world
                .all_reduce_into(&local, &mut global, SystemOperation::logical_and());
            global != 0
        }

        async fn any_rank(&self, value: bool) -> bool {
            let local = value as i32;
            let mut global = 0i32;
            self.world
                .all_reduce_into(&local, &mut global, SystemOperation::logical_or());
            global != 0
        }

        async fn max_i32(&self, value: i32) -> i32 {
            let mut global = i32::MIN;
            self.world
                .all_reduce_into(&value, &mut global, SystemOperation::max());
            global
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_rank_is_identity() {
        let comm = SingleRank;
        assert!(comm.all_agree(true).await);
        assert!(!comm.any_rank(false).await);
        assert_eq!(comm.max_i32(17).await, 17);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn group_reduces_across_ranks() {
        let ranks = LocalRank::group(4);
        let mut handles = Vec::new();
        for comm in ranks {
            handles.push(tokio::spawn(async move {
                let rank = comm.rank();
                let agree = comm.all_agree(rank != 2).await;
                let any = comm.any_rank(rank == 3).await;
                let max = comm.max_i32(rank * 10).await;
                (agree, any, max)
            }));
        }
        for handle in handles {
            let (agree, any, max) = handle.await.unwrap();
            assert!(!agree);
            assert!(any);
            assert_eq!(max, 30);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consecutive_collectives_do_not_interfere() {
        let ranks = LocalRank::group(3);
        let mut handles = Vec::new();
        for comm in ranks {
            handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                for round in 0..8 {
                    results.push(comm.max_i32(round * 100 + comm.rank()).await);
                }
                results
            }));
        }
        for handle in handles {
            let results = handle.await.unwrap();
            let expected: Vec<i32> = (0..8).map(|r| r * 100 + 2).collect();
            assert_eq!(results, expected);
        }
    }
}
