//! Compression offload
//!
//! Encoding a message (bincode + deflate + length prefix) is moved off the event loop
//! onto a small pool of worker threads. Work for one destination always lands on the
//! same worker, so frames for a connection come back in submission order. Finished
//! frames are handed to the reactor as [`Delivery`] values; the reactor sends each one
//! only if its destination is still alive.

use crate::{ConnId, TransportError, TransportResult};
use bytes::Bytes;
use serde::Serialize;
use sockstun_proto::{CodecError, TunnelCodec};
use std::marker::PhantomData;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Submits messages for encoding; the frame is later sent to `dest`
pub trait Offload<M> {
    fn submit(&self, dest: ConnId, message: M);

    /// Shut `dest` down once every frame submitted for it before this call is sent
    fn close(&self, dest: ConnId);
}

/// Work handed back to the reactor
#[derive(Debug)]
pub enum Delivery {
    /// An encoded frame ready to be sent
    Frame {
        dest: ConnId,
        frame: Result<Bytes, CodecError>,
    },
    /// Every earlier frame for `dest` has been delivered; shut it down
    Close { dest: ConnId },
}

pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Channel carrying finished frames from the pool to the reactor
pub fn delivery_channel() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

enum Job<M> {
    Encode(ConnId, M),
    Close(ConnId),
}

struct Worker<M> {
    queue: Option<std_mpsc::Sender<Job<M>>>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed pool of encoder threads
pub struct CompressionPool<M> {
    workers: Vec<Worker<M>>,
    _message: PhantomData<fn(M)>,
}

impl<M> CompressionPool<M>
where
    M: Serialize + Send + 'static,
{
    pub fn new(threads: usize, deliveries: DeliverySender) -> TransportResult<Self> {
        if threads == 0 {
            return Err(TransportError::ConfigurationError(
                "compression pool needs at least one thread".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let (tx, rx) = std_mpsc::channel::<Job<M>>();
            let deliveries = deliveries.clone();
            let handle = thread::Builder::new()
                .name(format!("sockstun-compress-{}", index))
                .spawn(move || encode_loop(rx, deliveries))?;

            workers.push(Worker {
                queue: Some(tx),
                handle: Some(handle),
            });
        }

        debug!("Started compression pool with {} threads", threads);
        Ok(Self {
            workers,
            _message: PhantomData,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    fn shard(&self, dest: ConnId) -> usize {
        (dest.0 % self.workers.len() as u64) as usize
    }

    fn enqueue(&self, dest: ConnId, job: Job<M>) {
        let worker = &self.workers[self.shard(dest)];
        let sent = worker
            .queue
            .as_ref()
            .map(|queue| queue.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!(%dest, "compression worker is gone, dropping job");
        }
    }
}

impl<M> Offload<M> for CompressionPool<M>
where
    M: Serialize + Send + 'static,
{
    fn submit(&self, dest: ConnId, message: M) {
        self.enqueue(dest, Job::Encode(dest, message));
    }

    fn close(&self, dest: ConnId) {
        self.enqueue(dest, Job::Close(dest));
    }
}

impl<M> Drop for CompressionPool<M> {
    fn drop(&mut self) {
        // Closing every queue first lets all workers wind down in parallel
        for worker in &mut self.workers {
            worker.queue.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("compression worker panicked");
                }
            }
        }
    }
}

fn encode_loop<M: Serialize>(queue: std_mpsc::Receiver<Job<M>>, deliveries: DeliverySender) {
    while let Ok(job) = queue.recv() {
        let delivery = match job {
            Job::Encode(dest, message) => Delivery::Frame {
                dest,
                frame: TunnelCodec::encode(&message),
            },
            Job::Close(dest) => Delivery::Close { dest },
        };
        if deliveries.send(delivery).is_err() {
            // Reactor is gone; nothing left to deliver to
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use sockstun_proto::ServerMessage;

    #[test]
    fn test_zero_threads_rejected() {
        let (tx, _rx) = delivery_channel();
        let result = CompressionPool::<ServerMessage>::new(0, tx);
        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }

    #[test]
    fn test_frames_for_one_destination_keep_order() {
        let (tx, mut rx) = delivery_channel();
        let pool = CompressionPool::new(3, tx).unwrap();
        assert_eq!(pool.threads(), 3);

        for dest in [ConnId(1), ConnId(2)] {
            for i in 0..50u8 {
                pool.submit(dest, ServerMessage::Data(vec![i; 100]));
            }
        }
        drop(pool);

        let mut seen: std::collections::HashMap<ConnId, Vec<u8>> = Default::default();
        while let Ok(delivery) = rx.try_recv() {
            let Delivery::Frame { dest, frame } = delivery else {
                panic!("unexpected delivery: {:?}", delivery);
            };
            let mut buf = BytesMut::from(frame.unwrap().as_ref());
            let message: ServerMessage = TunnelCodec::decode(&mut buf).unwrap().unwrap();
            match message {
                ServerMessage::Data(data) => seen.entry(dest).or_default().push(data[0]),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        let expected: Vec<u8> = (0..50).collect();
        assert_eq!(seen[&ConnId(1)], expected);
        assert_eq!(seen[&ConnId(2)], expected);
    }

    #[test]
    fn test_close_follows_earlier_frames() {
        let (tx, mut rx) = delivery_channel();
        let pool = CompressionPool::new(2, tx).unwrap();

        for _ in 0..10 {
            pool.submit(ConnId(4), ServerMessage::Data(vec![9; 1000]));
        }
        pool.close(ConnId(4));
        drop(pool);

        let mut deliveries = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            deliveries.push(delivery);
        }
        assert_eq!(deliveries.len(), 11);
        assert!(deliveries[..10]
            .iter()
            .all(|d| matches!(d, Delivery::Frame { dest: ConnId(4), frame: Ok(_) })));
        assert!(matches!(deliveries[10], Delivery::Close { dest: ConnId(4) }));
    }

    #[test]
    fn test_workers_stop_when_reactor_is_gone() {
        let (tx, rx) = delivery_channel();
        let pool = CompressionPool::new(2, tx).unwrap();
        drop(rx);

        pool.submit(ConnId(1), ServerMessage::Data(vec![1, 2, 3]));
        // Joining must not hang
        drop(pool);
    }
}
