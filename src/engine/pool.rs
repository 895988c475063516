//! Virtual user pool.
//!
//! Live VUs form a stack: growth pushes freshly spawned VUs, shrinking pops
//! the most recently spawned ones and moves them to the draining list, where
//! they finish their current iteration before the task ends. Ids start at 1
//! and are never reused within a run.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::executor::{run_vu, VuContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Sleeping = 2,
    Retiring = 3,
}

impl VuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Sleeping,
            _ => Self::Retiring,
        }
    }
}

/// Pool-side view of a VU, shared with the VU's task.
#[derive(Debug)]
pub struct VuHandle {
    id: u64,
    state: AtomicU8,
    iterations: AtomicU64,
}

impl VuHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(VuState::Idle as u8),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Move to `next`. Returns false, leaving the state untouched, once the
    /// VU is retiring: retirement is terminal.
    pub fn set_state(&self, next: VuState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == VuState::Retiring as u8 {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }

    fn retire(&self) {
        self.state.store(VuState::Retiring as u8, Ordering::Release);
    }

    pub(crate) fn complete_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }
}

/// VU-owned side: identity plus the retirement signal.
pub struct VirtualUser {
    handle: Arc<VuHandle>,
    retire_rx: watch::Receiver<bool>,
}

impl VirtualUser {
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn handle(&self) -> &VuHandle {
        &self.handle
    }

    pub fn is_retiring(&self) -> bool {
        *self.retire_rx.borrow() || self.handle.state() == VuState::Retiring
    }

    /// Resolves once the pool retires this VU (or is dropped).
    pub async fn retired(&mut self) {
        let _ = self.retire_rx.wait_for(|retire| *retire).await;
    }
}

struct VuSlot {
    handle: Arc<VuHandle>,
    retire_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl VuSlot {
    fn retire(&self) {
        self.handle.retire();
        // The receiver is gone only if the task already ended
        let _ = self.retire_tx.send(true);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolDelta {
    pub spawned: usize,
    pub retired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub live: usize,
    pub draining: usize,
    pub idle: usize,
    pub running: usize,
    pub sleeping: usize,
    pub total_spawned: u64,
}

pub struct VuPool {
    ctx: Arc<VuContext>,
    live: Vec<VuSlot>,
    draining: Vec<VuSlot>,
    next_id: u64,
}

impl VuPool {
    pub fn new(ctx: Arc<VuContext>) -> Self {
        Self {
            ctx,
            live: Vec::new(),
            draining: Vec::new(),
            next_id: 1,
        }
    }

    /// Grow or shrink the live set to exactly `desired` VUs.
    pub fn reconcile(&mut self, desired: usize) -> PoolDelta {
        let mut delta = PoolDelta::default();
        while self.live.len() < desired {
            self.spawn();
            delta.spawned += 1;
        }
        while self.live.len() > desired {
            if let Some(slot) = self.live.pop() {
                slot.retire();
                self.draining.push(slot);
                delta.retired += 1;
            }
        }
        if delta != PoolDelta::default() {
            debug!(
                "Pool reconciled to {} VUs (+{} -{})",
                desired, delta.spawned, delta.retired
            );
        }
        delta
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let handle = Arc::new(VuHandle::new(id));
        let (retire_tx, retire_rx) = watch::channel(false);
        let vu = VirtualUser {
            handle: handle.clone(),
            retire_rx,
        };
        let task = tokio::spawn(run_vu(self.ctx.clone(), vu));
        self.live.push(VuSlot {
            handle,
            retire_tx,
            task,
        });
    }

    /// Mark every live VU as retiring.
    pub fn retire_all(&mut self) -> usize {
        let count = self.live.len();
        while let Some(slot) = self.live.pop() {
            slot.retire();
            self.draining.push(slot);
        }
        count
    }

    /// Drop VUs whose task has ended. A live VU whose task ended without
    /// being retired has crashed; it is removed so the next reconcile
    /// replaces it.
    pub fn reap(&mut self) -> usize {
        let before = self.draining.len();
        self.draining.retain(|slot| !slot.task.is_finished());
        let mut reaped = before - self.draining.len();

        let live_before = self.live.len();
        self.live.retain(|slot| {
            let ended = slot.task.is_finished();
            if ended {
                warn!("VU {} ended unexpectedly", slot.handle.id);
            }
            !ended
        });
        reaped += live_before - self.live.len();
        reaped
    }

    /// Retire everything and wait for in-flight iterations to finish.
    /// Tasks still running after `grace` are aborted; returns how many.
    pub async fn drain(&mut self, grace: Duration) -> usize {
        self.retire_all();
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut slot in std::mem::take(&mut self.draining) {
            match tokio::time::timeout_at(deadline, &mut slot.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("VU {} ended abnormally: {}", slot.handle.id, e),
                Err(_) => {
                    slot.task.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            warn!(
                "Graceful stop: {} VUs still busy after {:?} were aborted",
                aborted, grace
            );
        }
        aborted
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    pub fn total_spawned(&self) -> u64 {
        self.next_id - 1
    }

    /// Ids of live VUs, oldest first.
    pub fn live_ids(&self) -> Vec<u64> {
        self.live.iter().map(|s| s.handle.id).collect()
    }

    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            live: self.live.len(),
            draining: self.draining.len(),
            total_spawned: self.total_spawned(),
            ..PoolStatus::default()
        };
        for slot in &self.live {
            match slot.handle.state() {
                VuState::Idle => status.idle += 1,
                VuState::Running => status.running += 1,
                VuState::Sleeping => status.sleeping += 1,
                VuState::Retiring => {}
            }
        }
        status
    }
}

impl Drop for VuPool {
    fn drop(&mut self) {
        for slot in self.live.iter().chain(self.draining.iter()) {
            slot.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{vu_context, FakeTransport};

    #[test]
    fn test_handle_retiring_is_terminal() {
        let handle = VuHandle::new(1);
        assert_eq!(handle.state(), VuState::Idle);
        assert!(handle.set_state(VuState::Running));
        assert_eq!(handle.state(), VuState::Running);
        handle.retire();
        assert!(!handle.set_state(VuState::Sleeping));
        assert_eq!(handle.state(), VuState::Retiring);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_tracks_desired_with_lifo_retirement() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(20), 200));
        let mut pool = VuPool::new(vu_context(transport.clone(), Duration::from_millis(10)));

        assert_eq!(pool.reconcile(5), PoolDelta { spawned: 5, retired: 0 });
        assert_eq!(pool.live_count(), 5);
        assert_eq!(pool.live_ids(), vec![1, 2, 3, 4, 5]);

        assert_eq!(pool.reconcile(2), PoolDelta { spawned: 0, retired: 3 });
        assert_eq!(pool.live_ids(), vec![1, 2]);
        assert_eq!(pool.draining_count(), 3);

        // New VUs never reuse retired ids
        assert_eq!(pool.reconcile(4), PoolDelta { spawned: 2, retired: 0 });
        assert_eq!(pool.live_ids(), vec![1, 2, 6, 7]);
        assert_eq!(pool.total_spawned(), 7);

        assert_eq!(pool.reconcile(4), PoolDelta::default());
        assert_eq!(pool.live_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_vus_finish_and_are_reaped() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(50), 200));
        let mut pool = VuPool::new(vu_context(transport.clone(), Duration::from_millis(100)));
        pool.reconcile(3);
        tokio::time::sleep(Duration::from_millis(500)).await;

        pool.reconcile(0);
        assert_eq!(pool.live_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.reap(), 3);
        assert_eq!(pool.draining_count(), 0);
        assert_eq!(transport.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_requests() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(2), 200));
        let mut pool = VuPool::new(vu_context(transport.clone(), Duration::ZERO));
        pool.reconcile(4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.in_flight(), 4);

        assert_eq!(pool.drain(Duration::from_secs(10)).await, 0);
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.completed(), 4);
        assert_eq!(pool.status(), PoolStatus { total_spawned: 4, ..PoolStatus::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_after_grace() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(30), 200));
        let mut pool = VuPool::new(vu_context(transport.clone(), Duration::ZERO));
        pool.reconcile(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.drain(Duration::from_secs(1)).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_counts_states() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(1), 200));
        let mut pool = VuPool::new(vu_context(transport, Duration::ZERO));
        pool.reconcile(3);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = pool.status();
        assert_eq!(status.live, 3);
        assert_eq!(status.running, 3);
        assert_eq!(status.total_spawned, 3);
    }
}
