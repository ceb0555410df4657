use std::sync::{
    Mutex, MutexGuard, TryLockError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use nalgebra::Vector3;

use crate::shared::{Float, ParticleData};

/// One particle as handed to presentation: `x, y, z, mass`.
pub type PointVertex = [f32; 4];

fn to_f32<F: Float>(x: F) -> f32 {
    num_traits::cast::<F, f32>(x).unwrap_or(f32::NAN)
}

fn try_slot(slot: &Mutex<Vec<PointVertex>>) -> Option<MutexGuard<'_, Vec<PointVertex>>> {
    match slot.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Latest-value handoff of particle positions between the simulation and
/// one reader. Neither side ever blocks: a publish that finds its slot
/// busy is dropped, a read that finds the published slot busy is retried
/// on the next poll.
#[derive(Debug, Default)]
pub struct PositionSnapshot {
    slots: [Mutex<Vec<PointVertex>>; 2],
    published: AtomicUsize,
    generation: AtomicU64,
}

impl PositionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful publications so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Writes the positions into the unpublished slot and flips it live.
    /// Returns `false` when the slot was busy and nothing was published.
    pub fn publish<F: Float>(&self, positions: &[Vector3<F>], data: &[ParticleData<F>]) -> bool {
        let target = 1 - self.published.load(Ordering::Acquire);
        let Some(mut slot) = try_slot(&self.slots[target]) else {
            log::trace!("snapshot slot busy, publication skipped");
            return false;
        };
        slot.clear();
        slot.extend(
            positions
                .iter()
                .zip(data)
                .map(|(p, d)| [to_f32(p.x), to_f32(p.y), to_f32(p.z), to_f32(d.mass)]),
        );
        drop(slot);
        self.published.store(target, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Copies the published slot into `out` if it is newer than `seen`.
    pub fn read_if_newer(&self, seen: &mut u64, out: &mut Vec<PointVertex>) -> bool {
        let generation = self.generation();
        if generation <= *seen {
            return false;
        }
        let Some(slot) = try_slot(&self.slots[self.published.load(Ordering::Acquire)]) else {
            return false;
        };
        out.clear();
        out.extend_from_slice(&slot);
        *seen = generation;
        true
    }
}

/// Consumer side state: last generation seen and a private copy.
#[derive(Debug, Default)]
pub struct SnapshotReader {
    seen: u64,
    points: Vec<PointVertex>,
}

impl SnapshotReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh points if a newer snapshot was available.
    pub fn poll(&mut self, snapshot: &PositionSnapshot) -> Option<&[PointVertex]> {
        if snapshot.read_if_newer(&mut self.seen, &mut self.points) {
            Some(self.points.as_slice())
        } else {
            None
        }
    }

    pub fn points(&self) -> &[PointVertex] {
        &self.points
    }

    /// The current copy as raw bytes, ready for an upload.
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }

    pub fn generation(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(offset: f32, n: usize) -> (Vec<Vector3<f32>>, Vec<ParticleData<f32>>) {
        (
            (0..n).map(|i| Vector3::repeat(offset + i as f32)).collect(),
            vec![ParticleData::at_rest(2.0); n],
        )
    }

    #[test]
    fn reader_sees_only_the_latest_value() {
        let snapshot = PositionSnapshot::new();
        let mut reader = SnapshotReader::new();
        assert!(reader.poll(&snapshot).is_none());

        for offset in [0.0, 10.0, 20.0] {
            let (x, d) = cloud(offset, 3);
            assert!(snapshot.publish(&x, &d));
        }
        let points = reader.poll(&snapshot).unwrap();
        assert_eq!(points[0], [20.0f32, 20.0, 20.0, 2.0]);
        assert_eq!(reader.generation(), 3);
        // Nothing new: no copy.
        assert!(reader.poll(&snapshot).is_none());
        assert_eq!(reader.bytes().len(), 3 * 16);
    }

    #[test]
    fn busy_slot_skips_publication() {
        let snapshot = PositionSnapshot::new();
        let (x, d) = cloud(0.0, 2);
        assert!(snapshot.publish(&x, &d));
        // Slot 0 is now the target of the next publish; hold it.
        let guard = snapshot.slots[0].lock().unwrap();
        assert!(!snapshot.publish(&x, &d));
        assert_eq!(snapshot.generation(), 1);
        drop(guard);
        assert!(snapshot.publish(&x, &d));
        assert_eq!(snapshot.generation(), 2);
    }

    #[test]
    fn reader_never_blocks_on_a_busy_slot() {
        let snapshot = PositionSnapshot::new();
        let (x, d) = cloud(1.0, 1);
        snapshot.publish(&x, &d);
        let guard = snapshot.slots[1].lock().unwrap();
        let mut reader = SnapshotReader::new();
        assert!(reader.poll(&snapshot).is_none());
        drop(guard);
        assert_eq!(reader.poll(&snapshot).unwrap().to_vec(), vec![[1.0f32, 1.0, 1.0, 2.0]]);
    }

    #[test]
    fn handoff_across_threads() {
        let snapshot = std::sync::Arc::new(PositionSnapshot::new());
        let producer = {
            let snapshot = snapshot.clone();
            std::thread::spawn(move || {
                for step in 0..200 {
                    let (x, d) = cloud(step as f32, 64);
                    snapshot.publish(&x, &d);
                }
            })
        };
        let mut reader = SnapshotReader::new();
        let mut last = -1.0f32;
        while !producer.is_finished() {
            if let Some(points) = reader.poll(&snapshot) {
                assert_eq!(points.len(), 64);
                // Values only move forward and each copy is self-consistent.
                assert!(points[0][0] >= last);
                assert_eq!(points[63][0], points[0][0] + 63.0);
                last = points[0][0];
            }
        }
        producer.join().unwrap();
    }
}
