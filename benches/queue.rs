use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_fastpath::{
    buffer::{BufferDescriptor, BufferSet, BufferStatus},
    chain::{ChainAllocator, ChainLink, ProcessChain},
    config::QueueConfig,
    memory::MemoryRegistry,
    queue::BufferSetQueue,
};
use std::sync::Arc;

fn new_queue(
    memory: &Arc<MemoryRegistry>,
    chains: &Arc<ChainAllocator>,
    depth: usize,
) -> Arc<BufferSetQueue> {
    BufferSetQueue::new(
        "bench",
        &QueueConfig { depth },
        memory.clone(),
        chains.clone(),
        None,
    )
}

pub fn benchmark_cycle(c: &mut Criterion) {
    let memory = Arc::new(MemoryRegistry::new());
    let chains = Arc::new(ChainAllocator::default());
    let buf = memory.register_host(4096);

    let mut group = c.benchmark_group("queue/cycle");
    for depth in [2, 4, 16] {
        let q = new_queue(&memory, &chains, depth);
        let plain = BufferSet::new(1).with_output(0, BufferDescriptor::single(buf));
        let cached = BufferSet::new(1).with_output(0, BufferDescriptor::single(buf).cached());

        for (name, set) in [("plain", plain), ("cached", cached)] {
            group.bench_function(format!("{name}-{depth}"), |b| {
                b.iter(|| {
                    q.enqueue(&set).unwrap();
                    let next = q.get_next().unwrap();
                    q.complete(next.request_id, BufferStatus::Success, 1, 1)
                        .unwrap();
                    q.dequeue_done().unwrap()
                })
            });
        }
    }
    group.finish();
}

pub fn benchmark_chain(c: &mut Criterion) {
    let memory = Arc::new(MemoryRegistry::new());
    let chains = Arc::new(ChainAllocator::default());
    let buf = memory.register_host(4096);
    let set = BufferSet::new(1).with_output(0, BufferDescriptor::single(buf));

    let mut group = c.benchmark_group("queue/chain");
    for links in [2, 4, 8] {
        let queues: Vec<_> = (0..links).map(|_| new_queue(&memory, &chains, 4)).collect();
        group.bench_function(format!("links-{links}"), |b| {
            b.iter(|| {
                let chain = ProcessChain::new(
                    queues.iter().map(|q| ChainLink::new(q, set)).collect(),
                )
                .unwrap();
                let id = chains.alloc(chain).unwrap();
                queues[0].enqueue_with_chain(&set, Some(id)).unwrap();
                for q in &queues {
                    let next = q.get_next().unwrap();
                    q.complete(next.request_id, BufferStatus::Success, 1, 1)
                        .unwrap();
                }
                queues[links - 1].dequeue_done().unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_cycle, benchmark_chain);
criterion_main!(benches);
