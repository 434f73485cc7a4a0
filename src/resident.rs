//! Scalars with explicit residency. Stream jobs write `DeviceScalar` and
//! `DeviceFlag` values; the host reads them only through
//! `copy_to_host`, which first waits on the event that orders the writes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::stream::Event;

const NO_ELEMENT: usize = usize::MAX;

/// A reduced `f64` written from stream jobs. Cloning shares the value.
///
#[derive(Clone, Debug)]
pub struct DeviceScalar {
    bits: Arc<AtomicU64>,
}

impl DeviceScalar {
    pub fn new(value: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(value.to_bits())) }
    }

    /// Reset from the host. Only call while no job that writes this scalar
    /// is in flight.
    pub fn reset(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::SeqCst)
    }

    /// Lower the stored value to `value` if it is smaller.
    pub fn fetch_min(&self, value: f64) {
        let mut current = self.bits.load(Ordering::SeqCst);

        while value < f64::from_bits(current) {
            match self.bits.compare_exchange_weak(current, value.to_bits(), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// An error flag written from stream jobs, holding the lowest offending
/// element index seen.
///
#[derive(Clone, Debug)]
pub struct DeviceFlag {
    element: Arc<AtomicUsize>,
}

impl Default for DeviceFlag {
    fn default() -> Self {
        Self { element: Arc::new(AtomicUsize::new(NO_ELEMENT)) }
    }
}

impl DeviceFlag {
    pub fn raise(&self, element: usize) {
        self.element.fetch_min(element, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.element.store(NO_ELEMENT, Ordering::SeqCst)
    }

    fn load(&self) -> Option<usize> {
        match self.element.load(Ordering::SeqCst) {
            NO_ELEMENT => None,
            e => Some(e),
        }
    }
}

/// Host copy of a device value, refreshed only by an explicit transfer.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostScalar<T> {
    value: T,
}

impl<T: Copy> HostScalar<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn get(&self) -> T {
        self.value
    }
}

impl HostScalar<f64> {
    pub fn copy_to_host(&mut self, device: &DeviceScalar, after: &Event) {
        after.wait();
        self.value = device.load();
    }
}

impl HostScalar<Option<usize>> {
    pub fn copy_to_host(&mut self, device: &DeviceFlag, after: &Event) {
        after.wait();
        self.value = device.load();
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::{DeviceFlag, DeviceScalar, HostScalar};
    use crate::stream::StreamPool;

    #[test]
    fn device_min_is_visible_after_the_event() {
        let pool = StreamPool::new(4).unwrap();
        let dt = DeviceScalar::new(1.0e20);

        for s in 0..4 {
            let dt = dt.clone();
            pool.submit(s, move || {
                for i in 0..1000 {
                    dt.fetch_min(1.0 + (s * 1000 + i) as f64);
                }
            });
        }
        let done = pool.join(&[0, 1, 2, 3]);
        let mut host: HostScalar<f64> = HostScalar::new(0.0);
        host.copy_to_host(&dt, &done);
        assert_eq!(host.get(), 1.0);
    }

    #[test]
    fn flag_keeps_the_lowest_element() {
        let pool = StreamPool::new(1).unwrap();
        let flag = DeviceFlag::default();
        let mut host: HostScalar<Option<usize>> = HostScalar::new(None);

        host.copy_to_host(&flag, &pool.record(0));
        assert_eq!(host.get(), None);

        let f = flag.clone();
        pool.submit(0, move || {
            f.raise(9);
            f.raise(4);
            f.raise(12);
        });
        host.copy_to_host(&flag, &pool.record(0));
        assert_eq!(host.get(), Some(4));

        flag.clear();
        host.copy_to_host(&flag, &pool.record(0));
        assert_eq!(host.get(), None);
    }
}
