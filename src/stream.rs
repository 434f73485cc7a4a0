use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use core_affinity::{get_core_ids, set_for_current};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, warn};

use crate::check_platform;
use crate::error::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job borrowing from the caller, run by [`StreamPool::run_scoped`].
pub type ScopedJob<'a> = Box<dyn FnOnce() + Send + 'a>;

struct Stream {
    handle: Option<thread::JoinHandle<()>>,
    sender: Option<Sender<Job>>,
    /// Set once a job on this stream has panicked. Sticky.
    failed: Arc<AtomicBool>,
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// A fixed set of asynchronous execution streams. Work submitted to one
/// stream runs in submission order; work on different streams is unordered
/// unless joined through an [`Event`]. Streams are pinned to CPU cores when
/// core ids are available, cycling through them if there are more streams
/// than cores. Jobs must be `'static`, except through `run_scoped`.
///
/// A job that panics does not take its stream down: the panic is logged,
/// the stream is marked failed, and every event recorded on it afterwards
/// reports the failure instead of completing cleanly.
///
pub struct StreamPool {
    streams: Vec<Stream>,
}

impl StreamPool {
    /// Acquire `num_streams` streams. They are released when the pool is
    /// dropped, after draining their queues.
    ///
    pub fn new(num_streams: usize) -> Result<Self, Error> {
        if num_streams == 0 {
            return Err(Error::NoStreams);
        }
        let cores = get_core_ids().unwrap_or_default();

        if cores.is_empty() {
            warn!("no core ids available; streams will not be pinned");
        }

        let streams = (0..num_streams)
            .map(|n| {
                let core_id = cores.get(n % cores.len().max(1)).cloned();
                let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
                let failed = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&failed);
                let handle = thread::spawn(move || {
                    if let Some(core_id) = core_id {
                        set_for_current(core_id);
                    }
                    for job in receiver {
                        if let Err(cause) = catch_unwind(AssertUnwindSafe(job)) {
                            error!("job on stream {} panicked: {}", n, panic_message(&*cause));
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                });
                Stream {
                    handle: Some(handle),
                    sender: Some(sender),
                    failed,
                }
            })
            .collect();

        debug!("acquired {} execution streams", num_streams);
        Ok(Self { streams })
    }

    /// Return the number of streams in the pool.
    ///
    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Submit a job to the given stream. It runs after everything submitted
    /// to that stream before it.
    ///
    pub fn submit<F>(&self, stream: usize, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.streams[stream].sender.as_ref();

        if let Some(sender) = sender {
            check_platform!(sender.send(Box::new(job)));
        }
    }

    /// Record an event on a stream. The event completes once all work
    /// submitted to that stream so far has run.
    ///
    pub fn record(&self, stream: usize) -> Event {
        self.join(&[stream])
    }

    /// Record a single event that completes only once every listed stream
    /// has run all the work submitted to it so far.
    ///
    pub fn join(&self, streams: &[usize]) -> Event {
        let mut streams = streams.to_vec();
        streams.sort_unstable();
        streams.dedup();

        let event = Event::pending(streams.len());

        for &s in &streams {
            let signal = event.clone();
            let failed = Arc::clone(&self.streams[s].failed);
            self.submit(s, move || signal.complete_one(s, failed.load(Ordering::SeqCst)));
        }
        event
    }

    /// Run jobs that borrow from the caller, each on its stream, and return
    /// once all of them have finished. Borrows handed to the jobs outlive
    /// every job because this call does not return before the join event
    /// completes, and a panicking job still completes it.
    ///
    pub fn run_scoped<'a>(&self, jobs: Vec<(usize, ScopedJob<'a>)>) -> Result<(), Error> {
        if let Some(&(stream, _)) = jobs.iter().find(|(s, _)| *s >= self.num_streams()) {
            return Err(Error::NoSuchStream(stream));
        }
        let mut used = Vec::with_capacity(jobs.len());

        for (stream, job) in jobs {
            // SAFETY: the join below waits for this job to run or unwind
            // before any borrow it holds can end.
            let job: Job = unsafe { std::mem::transmute::<ScopedJob<'a>, Job>(job) };
            self.submit(stream, job);
            used.push(stream);
        }
        self.join(&used).try_wait()
    }

    /// Block until every stream is idle. The time step path uses events
    /// instead; this is for teardown and tests.
    ///
    pub fn synchronize(&self) {
        let all: Vec<_> = (0..self.num_streams()).collect();
        self.join(&all).wait()
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        for stream in &mut self.streams {
            stream.sender.take();
        }
        for stream in &mut self.streams {
            if let Some(handle) = stream.handle.take() {
                if handle.join().is_err() {
                    warn!("an execution stream panicked");
                }
            }
        }
        debug!("released {} execution streams", self.streams.len());
    }
}

#[derive(Default)]
struct Progress {
    remaining: usize,
    failed_stream: Option<usize>,
}

struct EventState {
    progress: Mutex<Progress>,
    done: Condvar,
}

/// A completion marker recorded into one or more streams. Waiting on it
/// blocks only on the work it was recorded after, never on the whole pool.
///
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn pending(count: usize) -> Self {
        Self {
            state: Arc::new(EventState {
                progress: Mutex::new(Progress { remaining: count, failed_stream: None }),
                done: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete.
    pub fn completed() -> Self {
        Self::pending(0)
    }

    fn complete_one(&self, stream: usize, failed: bool) {
        let mut progress = self.state.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress.remaining = progress.remaining.saturating_sub(1);

        if failed {
            progress.failed_stream.get_or_insert(stream);
        }
        if progress.remaining == 0 {
            self.state.done.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.progress.lock().unwrap_or_else(|e| e.into_inner()).remaining == 0
    }

    /// Block until the event completes. Fails if a job on one of the
    /// recorded streams has panicked.
    pub fn try_wait(&self) -> Result<(), Error> {
        let mut progress = self.state.progress.lock().unwrap_or_else(|e| e.into_inner());

        while progress.remaining > 0 {
            progress = self.state.done.wait(progress).unwrap_or_else(|e| e.into_inner());
        }
        match progress.failed_stream {
            Some(stream) => Err(Error::StreamFailed { stream }),
            None => Ok(()),
        }
    }

    /// Block until the event completes. A failed stream is a platform
    /// failure and terminates the process.
    pub fn wait(&self) {
        check_platform!(self.try_wait())
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::bounded;

    use super::{Event, StreamPool};

    #[test]
    fn zero_streams_is_an_error() {
        assert!(StreamPool::new(0).is_err());
    }

    #[test]
    fn jobs_on_one_stream_run_in_order() {
        let pool = StreamPool::new(2).unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            pool.submit(1, move || log.lock().unwrap().push(i));
        }
        pool.record(1).wait();
        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn event_waits_only_for_its_own_stream() {
        let pool = StreamPool::new(2).unwrap();
        let (release, gate) = bounded::<()>(0);

        // stream 0 is blocked until we release it
        pool.submit(0, move || {
            gate.recv().unwrap();
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        pool.record(1).wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let blocked = pool.record(0);
        assert!(!blocked.is_complete());
        release.send(()).unwrap();
        blocked.wait();
        assert!(blocked.is_complete());
    }

    #[test]
    fn join_completes_after_every_stream() {
        let pool = StreamPool::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for s in 0..3 {
            let c = Arc::clone(&counter);
            pool.submit(s, move || {
                std::thread::sleep(Duration::from_millis(10 * (s as u64 + 1)));
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join(&[0, 1, 2, 2]).wait();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_job_fails_the_event_instead_of_hanging() {
        let pool = StreamPool::new(2).unwrap();
        pool.submit(0, || {
            std::thread::sleep(Duration::from_millis(50));
            panic!("kernel fault");
        });
        let event = pool.record(0);

        let (tx, rx) = bounded(1);
        let waiter = event.clone();
        std::thread::spawn(move || tx.send(waiter.try_wait().is_err()).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)), Ok(true));

        // the stream keeps serving jobs but stays marked failed
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(0, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pool.record(0).try_wait().is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.record(1).try_wait().is_ok());
    }

    #[test]
    fn scoped_jobs_write_into_borrowed_data() {
        let pool = StreamPool::new(3).unwrap();
        let mut data = vec![0usize; 9];
        let jobs = data
            .chunks_mut(3)
            .enumerate()
            .map(|(s, chunk)| {
                let job: super::ScopedJob<'_> = Box::new(move || chunk.iter_mut().for_each(|x| *x = s + 1));
                (s, job)
            })
            .collect();

        pool.run_scoped(jobs).unwrap();
        assert_eq!(data, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn completed_event_does_not_block() {
        Event::completed().wait();
        assert!(Event::completed().is_complete());
        StreamPool::new(1).unwrap().synchronize();
    }
}
