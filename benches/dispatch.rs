use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};

use telebus::{
    ClientId, DataPacket, NodeAddress, RequestPacket, RevisionSet, Revision, Schema, Server,
    ServerConfig, Transport, VariableId,
};

const VARIABLES: usize = 1_024;

struct DenseSchema;

impl Schema for DenseSchema {
    fn ordinal(&self, variable_id: VariableId) -> Option<usize> {
        let id = variable_id as usize;
        (1..=VARIABLES).contains(&id).then(|| id - 1)
    }

    fn variable_count(&self) -> usize {
        VARIABLES
    }
}

struct SequentialRevisions(Revision);

impl RevisionSet for SequentialRevisions {
    fn advance(&mut self, _variable_id: VariableId) -> Revision {
        self.0 += 1;
        self.0
    }
}

struct CountingTransport(usize);

impl Transport for CountingTransport {
    fn deliver(&mut self, _client_id: ClientId, _packet: &DataPacket) {
        self.0 += 1;
    }

    fn forward_request(&mut self, _node_address: NodeAddress, _request: &RequestPacket) {}
}

fn loaded_server(clients: u16) -> Server {
    let config = ServerConfig {
        my_node_address: 1,
        max_clients: clients,
        max_local_requests: 4_096,
        ..ServerConfig::default()
    };
    let mut server = Server::new(
        config,
        Box::new(DenseSchema),
        Box::new(SequentialRevisions(0)),
        Box::new(CountingTransport(0)),
    );
    for client in 0..clients {
        for var in 1..=64u32 {
            let response = server.process_request(
                client,
                &RequestPacket {
                    deadline: u64::MAX,
                    node_address: 0,
                    variable_id: var,
                    revision: 0,
                    quantity: 1,
                },
            );
            assert!(response.accepted);
        }
    }
    server
}

fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");
    for &clients in &[4u16, 32, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(clients),
            &clients,
            |b, &clients| {
                b.iter_batched(
                    || loaded_server(clients),
                    |mut server| {
                        for rev in 1..=100u32 {
                            let packet = DataPacket {
                                node_address: 1,
                                variable_id: 1 + (rev % 64),
                                revision: rev,
                                payload: vec![0u8; 64],
                            };
                            server.process_data(0, &packet).expect("dispatch");
                        }
                        black_box(server)
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_publish_fanout);
criterion_main!(benches);
